//! Ban enforcement
//!
//! Applies ban transitions to the host firewall and reports them to the
//! audit trail and alert queue. A firewall failure never rolls back the
//! ledger; it is logged, audited with `applied = false` and returned.

pub mod firewall;

pub use firewall::{CommandFirewall, DisabledFirewall, Firewall};

use std::net::IpAddr;
use std::sync::Mutex;
use thiserror::Error;

use crate::alerting::{AlertQueue, BanNotice};
use crate::config::{FirewallBackend, FirewallConfig};
use crate::geolocation::GeoIpService;
use crate::models::{AuditAction, BanAuditEntry, IpRecord};
use crate::output::OutputHandler;

#[derive(Error, Debug)]
pub enum EnforcementError {
    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("No firewall backend configured")]
    NoBackend,

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),
}

pub struct BanEnforcer {
    firewall: Box<dyn Firewall>,
    rule_prefix: String,
    audit: Option<Mutex<OutputHandler>>,
    geo: Option<GeoIpService>,
    alerts: Option<AlertQueue>,
}

impl BanEnforcer {
    pub fn new(firewall: Box<dyn Firewall>, rule_prefix: impl Into<String>) -> Self {
        BanEnforcer {
            firewall,
            rule_prefix: rule_prefix.into(),
            audit: None,
            geo: None,
            alerts: None,
        }
    }

    /// Command backend when banning is on, otherwise a no-op firewall
    pub fn from_config(config: &FirewallConfig) -> Result<Self, EnforcementError> {
        let firewall: Box<dyn Firewall> = match (config.ban_ips, config.backend) {
            (false, _) | (true, FirewallBackend::None) => {
                log::info!("Firewall banning disabled; bans are recorded only");
                Box::new(DisabledFirewall)
            }
            (true, backend) => Box::new(CommandFirewall::new(backend)?),
        };
        Ok(Self::new(firewall, config.rule_prefix.clone()))
    }

    pub fn with_audit(mut self, handler: OutputHandler) -> Self {
        self.audit = Some(Mutex::new(handler));
        self
    }

    pub fn with_geolocation(mut self, geo: GeoIpService) -> Self {
        self.geo = Some(geo);
        self
    }

    pub fn with_alerts(mut self, alerts: AlertQueue) -> Self {
        self.alerts = Some(alerts);
        self
    }

    pub fn rule_name(&self, address: &str) -> String {
        format!("{}{}", self.rule_prefix, address)
    }

    /// Block a newly banned address
    pub fn enforce(&self, record: &IpRecord) -> Result<(), EnforcementError> {
        let action = if record.manual {
            AuditAction::ManualBan
        } else {
            AuditAction::Ban
        };
        self.apply(action, record)
    }

    /// Remove the block rule of an unbanned address (best-effort)
    pub fn lift(&self, record: &IpRecord) -> Result<(), EnforcementError> {
        self.apply(AuditAction::Unban, record)
    }

    fn apply(&self, action: AuditAction, record: &IpRecord) -> Result<(), EnforcementError> {
        let rule_name = self.rule_name(&record.address);
        let mut entry = BanAuditEntry::for_record(action, record, rule_name.clone());

        let result = record
            .address
            .parse::<IpAddr>()
            .map_err(|_| EnforcementError::InvalidAddress(record.address.clone()))
            .and_then(|address| {
                if let Some(location) = self.geo.as_ref().and_then(|g| g.lookup_optional(&address)) {
                    entry.location = location.display_location();
                }
                match action {
                    AuditAction::Unban => self.firewall.unblock(&address, &rule_name),
                    _ => self.firewall.block(&address, &rule_name),
                }
            });

        match &result {
            Ok(()) => {
                entry.applied = self.firewall.is_enabled();
                if entry.applied {
                    match action {
                        AuditAction::Unban => log::info!("Firewall rule {} removed", rule_name),
                        _ => log::info!(
                            "Firewall rule {} applied ({} attempts)",
                            rule_name,
                            record.attempts
                        ),
                    }
                }
            }
            Err(e) => {
                log::error!("Firewall {} for {} failed: {}", action, record.address, e);
                entry.error = Some(e.to_string());
            }
        }

        self.report(&entry);
        result
    }

    fn report(&self, entry: &BanAuditEntry) {
        if let Some(audit) = &self.audit {
            match audit.lock() {
                Ok(mut handler) => {
                    if let Err(e) = handler.write_entry(entry) {
                        log::warn!("Failed to write audit entry: {}", e);
                    }
                }
                Err(_) => log::warn!("Audit output lock poisoned; entry for {} dropped", entry.address),
            }
        }

        if let Some(alerts) = &self.alerts {
            alerts.queue_alert(BanNotice::from(entry));
        }
    }
}
