//! IP geolocation using a MaxMind GeoLite2-City database
//!
//! Used to annotate ban audit entries and alerts. The database file is
//! downloaded separately from MaxMind.

use maxminddb::{geoip2, MaxMindDBError, Reader};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeoError {
    #[error("Failed to read database: {0}")]
    Database(#[from] MaxMindDBError),

    #[error("IP address not found in database")]
    NotFound,

    #[error("Database file not found: {0}")]
    FileNotFound(String),
}

/// Location of an address as far as the database knows it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpLocation {
    pub country: Option<String>,
    pub country_code: Option<String>,
    pub city: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl IpLocation {
    /// Human-readable label, e.g. "Berlin, Germany"
    pub fn display_location(&self) -> Option<String> {
        match (&self.city, &self.country) {
            (Some(city), Some(country)) => Some(format!("{}, {}", city, country)),
            (None, Some(country)) => Some(country.clone()),
            (Some(city), None) => Some(city.clone()),
            (None, None) => match (self.latitude, self.longitude) {
                (Some(lat), Some(lon)) => Some(format!("({:.4}, {:.4})", lat, lon)),
                _ => None,
            },
        }
    }
}

/// Cheap to clone; clones share the reader
#[derive(Clone)]
pub struct GeoIpService {
    reader: Arc<Reader<Vec<u8>>>,
}

impl GeoIpService {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, GeoError> {
        let path = db_path.as_ref();
        if !path.exists() {
            return Err(GeoError::FileNotFound(path.display().to_string()));
        }

        let reader = Reader::open_readfile(path)?;
        Ok(GeoIpService {
            reader: Arc::new(reader),
        })
    }

    pub fn lookup(&self, ip: &IpAddr) -> Result<IpLocation, GeoError> {
        if !is_routable(ip) {
            return Err(GeoError::NotFound);
        }

        let city: geoip2::City = self.reader.lookup(*ip).map_err(|e| match e {
            MaxMindDBError::AddressNotFoundError(_) => GeoError::NotFound,
            other => GeoError::Database(other),
        })?;

        let location = city.location;

        Ok(IpLocation {
            city: city.city.and_then(|c| english(c.names)),
            country_code: city
                .country
                .as_ref()
                .and_then(|c| c.iso_code)
                .map(String::from),
            country: city.country.and_then(|c| english(c.names)),
            latitude: location.as_ref().and_then(|l| l.latitude),
            longitude: location.as_ref().and_then(|l| l.longitude),
        })
    }

    /// Look up an address, returning None instead of an error
    pub fn lookup_optional(&self, ip: &IpAddr) -> Option<IpLocation> {
        match self.lookup(ip) {
            Ok(location) => Some(location),
            Err(GeoError::NotFound) => None,
            Err(e) => {
                log::debug!("Geolocation lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

fn english(names: Option<BTreeMap<&str, &str>>) -> Option<String> {
    names.and_then(|n| n.get("en").map(|s| s.to_string()))
}

/// Private, loopback and link-local ranges never appear in GeoLite2
fn is_routable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()),
        IpAddr::V6(v6) => {
            let unique_local = (v6.segments()[0] & 0xfe00) == 0xfc00;
            let link_local = (v6.segments()[0] & 0xffc0) == 0xfe80;
            !(v6.is_loopback() || v6.is_unspecified() || unique_local || link_local)
        }
    }
}
