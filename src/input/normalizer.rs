//! Raw record normalization
//!
//! Turns a `RawLoginRecord` into a `FailedLoginEvent`, or nothing when
//! required fields are missing or malformed. A bad record never aborts a
//! scan.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::net::IpAddr;

use crate::models::{FailedLoginEvent, RawLoginRecord};

/// Formats accepted for naive (zone-less) timestamps, interpreted as UTC
const NAIVE_FORMATS: &[&str] = &[
    "%a %b %d %H:%M:%S %Y",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Placeholder used by the event log for empty fields
const EMPTY_FIELD: &str = "-";

#[derive(Debug, Default, Clone, Copy)]
pub struct EventNormalizer;

impl EventNormalizer {
    pub fn new() -> Self {
        EventNormalizer
    }

    /// Normalize one record; `None` means "no event"
    pub fn normalize(&self, record: &RawLoginRecord) -> Option<FailedLoginEvent> {
        let raw_address = present(record.source_address.as_deref())?;
        let address = match raw_address.parse::<IpAddr>() {
            Ok(ip) => ip,
            Err(_) => {
                log::debug!("Skipping record with invalid address '{}'", raw_address);
                return None;
            }
        };

        let raw_time = match present(record.time_generated.as_deref()) {
            Some(t) => t,
            None => {
                log::debug!("Skipping record from {} without a timestamp", address);
                return None;
            }
        };
        let occurred_at = match parse_timestamp(raw_time) {
            Some(t) => t,
            None => {
                log::debug!("Skipping record from {} with bad timestamp '{}'", address, raw_time);
                return None;
            }
        };

        Some(FailedLoginEvent {
            address,
            occurred_at,
            workstation: present(record.workstation.as_deref())
                .unwrap_or(EMPTY_FIELD)
                .to_string(),
            user: present(record.user.as_deref())
                .unwrap_or(EMPTY_FIELD)
                .to_string(),
        })
    }
}

fn present(value: Option<&str>) -> Option<&str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty() && *v != EMPTY_FIELD)
}

/// Parse an event timestamp, normalized to whole seconds
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();

    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NAIVE_FORMATS
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
                .map(|naive| Utc.from_utc_datetime(&naive))
        })?;

    DateTime::from_timestamp(parsed.timestamp(), 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: Option<&str>, time: Option<&str>) -> RawLoginRecord {
        RawLoginRecord {
            event_id: 4625,
            time_generated: time.map(String::from),
            source_address: address.map(String::from),
            workstation: Some("WIN-ATTACKER".to_string()),
            user: Some("administrator".to_string()),
        }
    }

    #[test]
    fn test_normalize_valid_record() {
        let normalizer = EventNormalizer::new();
        let event = normalizer
            .normalize(&record(Some("10.0.0.5"), Some("Mon Jan 01 10:00:00 2024")))
            .unwrap();

        assert_eq!(event.address.to_string(), "10.0.0.5");
        assert_eq!(event.occurred_at.to_rfc3339(), "2024-01-01T10:00:00+00:00");
        assert_eq!(event.workstation, "WIN-ATTACKER");
        assert_eq!(event.user, "administrator");
    }

    #[test]
    fn test_missing_or_placeholder_address() {
        let normalizer = EventNormalizer::new();
        assert!(normalizer.normalize(&record(None, Some("2024-01-01 10:00:00"))).is_none());
        assert!(normalizer.normalize(&record(Some("-"), Some("2024-01-01 10:00:00"))).is_none());
        assert!(normalizer.normalize(&record(Some("garbage"), Some("2024-01-01 10:00:00"))).is_none());
    }

    #[test]
    fn test_bad_timestamp() {
        let normalizer = EventNormalizer::new();
        assert!(normalizer.normalize(&record(Some("10.0.0.5"), None)).is_none());
        assert!(normalizer.normalize(&record(Some("10.0.0.5"), Some("yesterday"))).is_none());
    }

    #[test]
    fn test_placeholder_fields_default() {
        let normalizer = EventNormalizer::new();
        let mut raw = record(Some("2001:db8::7"), Some("2024-03-05T08:09:10Z"));
        raw.workstation = Some("  ".to_string());
        raw.user = None;

        let event = normalizer.normalize(&raw).unwrap();
        assert_eq!(event.workstation, "-");
        assert_eq!(event.user, "-");
    }

    #[test]
    fn test_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-01-01 10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T10:00:00"), Some(expected));
        assert_eq!(parse_timestamp("2024-01-01T11:00:00+01:00"), Some(expected));
        // Sub-second precision is dropped so re-deliveries compare equal
        assert_eq!(parse_timestamp("2024-01-01T10:00:00.750Z"), Some(expected));
    }
}
