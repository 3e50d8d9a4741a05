//! Operations exposed to outer surfaces (CLI, daemon, an HTTP layer)

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::alerting::AlertQueue;
use crate::config::{Config, ConfigError};
use crate::enforcement::{BanEnforcer, EnforcementError};
use crate::geolocation::GeoIpService;
use crate::input::{source_from_config, InputError};
use crate::models::{EventRecord, IpRecord, LedgerStats, RecordFilter, ScanMode, ScanStatus};
use crate::output::{JsonSnapshotFile, OutputError, OutputHandler};
use crate::persistence::{AttemptLedger, PersistenceError, SqliteLedger};
use crate::scan::{ScanError, ScanOrchestrator, ScanScheduler, SchedulerError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Invalid IP address '{0}'")]
    InvalidAddress(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Event source error: {0}")]
    Input(#[from] InputError),

    #[error("Output error: {0}")]
    Output(#[from] OutputError),

    #[error("Firewall error: {0}")]
    Enforcement(#[from] EnforcementError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),

    #[error("Scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
}

/// Answer to a manual scan request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanTrigger {
    pub started: bool,
}

pub struct GuardService {
    orchestrator: Arc<ScanOrchestrator>,
    scheduler: ScanScheduler,
}

impl GuardService {
    pub fn new(orchestrator: Arc<ScanOrchestrator>, scheduler: ScanScheduler) -> Self {
        GuardService {
            orchestrator,
            scheduler,
        }
    }

    /// Wire up ledger, event source, enforcer and scheduler from `config`
    ///
    /// The scheduler loop is not started; call `start()` for that.
    pub fn from_config(
        config: &Config,
        runtime: Handle,
        alerts: Option<AlertQueue>,
    ) -> Result<Self, ServiceError> {
        config.validate()?;

        let ledger: Arc<dyn AttemptLedger> = Arc::new(SqliteLedger::new(&config.storage.database_path)?);
        let source = source_from_config(&config.input)?;

        let mut enforcer = BanEnforcer::from_config(&config.firewall)?
            .with_audit(OutputHandler::from_config(&config.output)?);
        if let Some(path) = &config.geoip.database_path {
            match GeoIpService::new(path) {
                Ok(geo) => enforcer = enforcer.with_geolocation(geo),
                Err(e) => log::warn!("GeoIP lookups disabled: {}", e),
            }
        }
        if let Some(alerts) = alerts {
            enforcer = enforcer.with_alerts(alerts);
        }

        let mut orchestrator = ScanOrchestrator::new(config, ledger, source, Arc::new(enforcer));
        if let Some(path) = &config.storage.snapshot_path {
            orchestrator = orchestrator.with_snapshot(Arc::new(JsonSnapshotFile::new(path.clone())));
        }
        let orchestrator = Arc::new(orchestrator);

        let scheduler = ScanScheduler::new(
            orchestrator.clone(),
            config.scan.interval_minutes,
            runtime,
        )?;

        Ok(Self::new(orchestrator, scheduler))
    }

    /// Start automatic scans
    pub fn start(&self) {
        self.scheduler.start();
    }

    pub fn trigger_manual(&self) -> ScanTrigger {
        ScanTrigger {
            started: self.scheduler.trigger_manual(),
        }
    }

    /// Run one scan on the calling thread
    ///
    /// Returns `None` when another scan holds the slot.
    pub fn run_scan_now(&self, mode: ScanMode) -> Result<Option<usize>, ServiceError> {
        Ok(self.scheduler.run_blocking(mode)?)
    }

    pub fn status(&self) -> ScanStatus {
        self.scheduler.status()
    }

    pub fn list_records(&self, filter: &RecordFilter) -> Result<Vec<IpRecord>, ServiceError> {
        Ok(self.orchestrator.ledger().list_records(filter)?)
    }

    /// Accepted failed logins of one address, oldest first
    pub fn events_for(&self, address: &str) -> Result<Vec<EventRecord>, ServiceError> {
        let ip = parse_address(address)?;
        Ok(self.orchestrator.ledger().events(&ip)?)
    }

    pub fn stats(&self, days: u32) -> Result<LedgerStats, ServiceError> {
        Ok(self.orchestrator.ledger().stats(days)?)
    }

    /// Ban an address on operator request
    ///
    /// The stored attempt count is at least the configured threshold. The
    /// ban is recorded even if the firewall rejects the rule.
    pub fn add_manual_ban(
        &self,
        address: &str,
        attempts: Option<u32>,
        workstation: Option<&str>,
        user: Option<&str>,
    ) -> Result<IpRecord, ServiceError> {
        let ip = parse_address(address)?;
        let threshold = self.orchestrator.policy()?.threshold();

        let record = self.orchestrator.ledger().upsert_manual_ban(
            &ip,
            attempts.unwrap_or(1),
            workstation.unwrap_or("-"),
            user.unwrap_or("-"),
            threshold,
        )?;
        log::info!("Manual ban added for {} ({} attempts)", ip, record.attempts);

        // The ban stays recorded when the firewall refuses it
        if let Err(e) = self.orchestrator.enforcer().enforce(&record) {
            log::debug!("Manual ban of {} recorded without a firewall rule: {}", ip, e);
        }
        self.export_snapshot();

        Ok(record)
    }

    /// Clear the ban flag and remove the firewall rule; attempts are kept
    pub fn remove_ban(&self, address: &str) -> Result<(), ServiceError> {
        let ip = parse_address(address)?;
        let ledger = self.orchestrator.ledger();
        let was_banned = ledger.ban_state(&ip)?.banned;

        ledger.unban(&ip)?;
        log::info!("IP {} unbanned", ip);

        if was_banned {
            if let Some(record) = ledger.get(&ip)? {
                if let Err(e) = self.orchestrator.enforcer().lift(&record) {
                    log::debug!("Firewall rule for {} may still be present: {}", ip, e);
                }
            }
        }
        self.export_snapshot();
        Ok(())
    }

    pub fn update_scan_interval(&self, minutes: u32) -> Result<(), ServiceError> {
        Ok(self.scheduler.update_interval(minutes)?)
    }

    /// Apply a new configuration to the running service
    ///
    /// Threshold, whitelist, event filter and interval take effect
    /// immediately. Storage, input, firewall and output settings need a
    /// restart.
    pub fn reload(&self, config: &Config) -> Result<(), ServiceError> {
        config.validate()?;
        self.orchestrator.reload(config)?;

        if self.scheduler.interval_minutes() != config.scan.interval_minutes as i64 {
            self.scheduler.update_interval(config.scan.interval_minutes)?;
        }
        Ok(())
    }

    /// Stop scheduling and wait for the running scan, at most `grace`
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.scheduler.shutdown(grace).await
    }

    fn export_snapshot(&self) {
        if let Err(e) = self.orchestrator.export_snapshot() {
            log::error!("Failed to export ledger snapshot: {}", e);
        }
    }
}

fn parse_address(address: &str) -> Result<IpAddr, ServiceError> {
    address
        .trim()
        .parse::<IpAddr>()
        .map_err(|_| ServiceError::InvalidAddress(address.to_string()))
}
