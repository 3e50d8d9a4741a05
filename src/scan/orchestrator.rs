use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use super::ScanError;
use crate::config::Config;
use crate::detection::BanPolicy;
use crate::enforcement::BanEnforcer;
use crate::input::{EventFilter, EventNormalizer, EventSource};
use crate::models::{FailedLoginEvent, ScanMode};
use crate::output::SnapshotSink;
use crate::persistence::AttemptLedger;
use crate::whitelist::WhitelistResolver;

/// Something that can run one complete scan
///
/// The scheduler only depends on this, so it can be driven by a fake in
/// tests.
pub trait ScanRunner: Send + Sync + 'static {
    /// Run a scan and return the number of processed events
    fn run_scan(&self, mode: ScanMode) -> Result<usize, ScanError>;
}

/// Settings swapped as a unit by `reload`
///
/// Scans copy them out at start and never hold the lock while working.
#[derive(Clone)]
struct ScanSettings {
    policy: BanPolicy,
    filter: EventFilter,
    whitelist: Arc<WhitelistResolver>,
}

impl ScanSettings {
    fn from_config(config: &Config) -> Self {
        ScanSettings {
            policy: BanPolicy::from_config(&config.scan),
            filter: EventFilter {
                log_name: config.scan.log_name.clone(),
                event_id: config.scan.event_id,
            },
            whitelist: Arc::new(WhitelistResolver::new(&config.whitelist)),
        }
    }
}

/// One pass over the event source: ingest, decide, enforce, export
pub struct ScanOrchestrator {
    ledger: Arc<dyn AttemptLedger>,
    source: Box<dyn EventSource>,
    enforcer: Arc<BanEnforcer>,
    snapshot: Option<Arc<dyn SnapshotSink>>,
    normalizer: EventNormalizer,
    settings: RwLock<ScanSettings>,
}

impl ScanOrchestrator {
    pub fn new(
        config: &Config,
        ledger: Arc<dyn AttemptLedger>,
        source: Box<dyn EventSource>,
        enforcer: Arc<BanEnforcer>,
    ) -> Self {
        ScanOrchestrator {
            ledger,
            source,
            enforcer,
            snapshot: None,
            normalizer: EventNormalizer::new(),
            settings: RwLock::new(ScanSettings::from_config(config)),
        }
    }

    pub fn with_snapshot(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.snapshot = Some(sink);
        self
    }

    pub fn ledger(&self) -> &Arc<dyn AttemptLedger> {
        &self.ledger
    }

    pub fn enforcer(&self) -> &Arc<BanEnforcer> {
        &self.enforcer
    }

    pub fn policy(&self) -> Result<BanPolicy, ScanError> {
        let settings = self.settings.read().map_err(|_| ScanError::LockPoisoned)?;
        Ok(settings.policy)
    }

    /// Swap policy, filter and whitelist; a running scan finishes with the
    /// settings it started with
    pub fn reload(&self, config: &Config) -> Result<(), ScanError> {
        let fresh = ScanSettings::from_config(config);
        let mut settings = self.settings.write().map_err(|_| ScanError::LockPoisoned)?;
        *settings = fresh;
        log::info!(
            "Scan settings reloaded (threshold {}, {} whitelist entries)",
            settings.policy.effective_threshold(),
            settings.whitelist.len()
        );
        Ok(())
    }

    /// Write the current ledger to the snapshot sink, if any
    pub fn export_snapshot(&self) -> Result<(), ScanError> {
        if let Some(sink) = &self.snapshot {
            let records = self.ledger.snapshot()?;
            sink.export_snapshot(&records)?;
        }
        Ok(())
    }

    /// Copy the current settings and refresh the whitelist's domains
    ///
    /// DNS runs on a private copy. The refreshed whitelist is stored back
    /// unless a reload replaced it in the meantime.
    fn prepare_settings(&self) -> Result<ScanSettings, ScanError> {
        let mut settings = self
            .settings
            .read()
            .map_err(|_| ScanError::LockPoisoned)?
            .clone();
        let loaded = Arc::clone(&settings.whitelist);

        let mut whitelist = WhitelistResolver::clone(&loaded);
        let resolved = whitelist.resolve();
        log::debug!("Whitelist resolved to {} entries ({} from domains)", whitelist.len(), resolved);
        settings.whitelist = Arc::new(whitelist);

        if resolved > 0 {
            let mut current = self.settings.write().map_err(|_| ScanError::LockPoisoned)?;
            if Arc::ptr_eq(&current.whitelist, &loaded) {
                current.whitelist = Arc::clone(&settings.whitelist);
            }
        }
        Ok(settings)
    }

    /// Record one event and ban the address if it just crossed the threshold
    ///
    /// Returns whether the ledger accepted the event.
    fn ingest(&self, event: &FailedLoginEvent, policy: &BanPolicy) -> Result<bool, ScanError> {
        let outcome = self.ledger.record_event(
            &event.address,
            event.occurred_at,
            &event.workstation,
            &event.user,
        )?;
        if !outcome.accepted {
            return Ok(false);
        }

        let attempts = outcome.attempts;
        if !self.ledger.decide_ban(&event.address, attempts, policy)? {
            return Ok(true);
        }

        self.ledger.set_banned(&event.address, true)?;
        log::info!(
            "Auto-ban applied to {} after {} attempts (user={} workstation={})",
            event.address,
            attempts,
            event.user,
            event.workstation
        );

        if let Some(record) = self.ledger.get(&event.address)? {
            // The ban stays recorded when the firewall refuses it
            if let Err(e) = self.enforcer.enforce(&record) {
                log::debug!("Ban of {} recorded without a firewall rule: {}", event.address, e);
            }
        }
        Ok(true)
    }
}

impl ScanRunner for ScanOrchestrator {
    fn run_scan(&self, mode: ScanMode) -> Result<usize, ScanError> {
        let settings = self.prepare_settings()?;
        let raw_records = self.source.fetch_raw_records(&settings.filter)?;
        log::info!("Scan started ({} mode) with {} records", mode, raw_records.len());

        let mut whitelisted: BTreeSet<IpAddr> = BTreeSet::new();
        let mut events: Vec<FailedLoginEvent> = raw_records
            .iter()
            .filter_map(|raw| self.normalizer.normalize(raw))
            .filter(|event| {
                if settings.whitelist.contains(event.address) {
                    whitelisted.insert(event.address);
                    return false;
                }
                true
            })
            .collect();

        // Sources may deliver newest first; the ledger only accepts events
        // newer than the last one stored for the address
        events.sort_by(|a, b| (a.address, a.occurred_at).cmp(&(b.address, b.occurred_at)));

        let mut processed = 0usize;
        let mut failures = 0usize;
        for event in &events {
            match self.ingest(event, &settings.policy) {
                Ok(true) => processed += 1,
                Ok(false) => {}
                Err(e) => {
                    failures += 1;
                    log::error!("Failed to process event from {}: {}", event.address, e);
                }
            }
        }

        if !whitelisted.is_empty() {
            let list: Vec<String> = whitelisted.iter().map(|ip| ip.to_string()).collect();
            log::info!("Ignored events from whitelisted addresses: {}", list.join(", "));
        }
        if failures > 0 {
            log::warn!("{} event(s) could not be stored this scan", failures);
        }

        if let Err(e) = self.export_snapshot() {
            log::error!("Failed to export ledger snapshot: {}", e);
        }

        log::info!("Scan complete ({} mode): {} events processed", mode, processed);
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enforcement::testing::RecordingFirewall;
    use crate::input::InputError;
    use crate::models::RawLoginRecord;
    use crate::output::JsonSnapshotFile;
    use crate::persistence::SqliteLedger;
    use std::sync::Mutex;

    /// Event source backed by a vector the test can extend between scans
    #[derive(Clone, Default)]
    struct VecSource(Arc<Mutex<Vec<RawLoginRecord>>>);

    impl VecSource {
        fn push(&self, address: &str, time: &str) {
            self.0.lock().unwrap().push(RawLoginRecord {
                event_id: 4625,
                time_generated: Some(time.to_string()),
                source_address: Some(address.to_string()),
                workstation: Some("WIN-ATTACKER".to_string()),
                user: Some("administrator".to_string()),
            });
        }
    }

    impl EventSource for VecSource {
        fn fetch_raw_records(&self, filter: &EventFilter) -> Result<Vec<RawLoginRecord>, InputError> {
            Ok(self
                .0
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.event_id == filter.event_id)
                .cloned()
                .collect())
        }
    }

    fn test_config(threshold: u32) -> Config {
        let mut config = Config::default();
        config.scan.threshold = threshold;
        config.scan.minimum_attempts = 1;
        config.whitelist.domains.clear();
        config
    }

    struct Harness {
        orchestrator: ScanOrchestrator,
        ledger: Arc<SqliteLedger>,
        source: VecSource,
        firewall: RecordingFirewall,
    }

    fn harness(config: &Config) -> Harness {
        let ledger = Arc::new(SqliteLedger::in_memory().unwrap());
        let source = VecSource::default();
        let firewall = RecordingFirewall::default();
        let enforcer = Arc::new(BanEnforcer::new(Box::new(firewall.clone()), "SMB_block_"));
        let orchestrator = ScanOrchestrator::new(
            config,
            ledger.clone() as Arc<dyn AttemptLedger>,
            Box::new(source.clone()),
            enforcer,
        );
        Harness {
            orchestrator,
            ledger,
            source,
            firewall,
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_threshold_crossing_bans_once() {
        let h = harness(&test_config(3));
        for second in 0..3 {
            h.source.push("10.0.0.5", &format!("2024-01-01 10:00:0{}", second));
        }

        assert_eq!(h.orchestrator.run_scan(ScanMode::Manual).unwrap(), 3);

        let record = h.ledger.get(&addr("10.0.0.5")).unwrap().unwrap();
        assert_eq!(record.attempts, 3);
        assert!(record.banned);
        assert!(record.banned_at.is_some());
        assert_eq!(
            h.firewall.calls(),
            vec![("block".to_string(), "SMB_block_10.0.0.5".to_string())]
        );

        // More events after the ban do not call the firewall again
        h.source.push("10.0.0.5", "2024-01-01 10:00:05");
        h.orchestrator.run_scan(ScanMode::Auto).unwrap();
        assert_eq!(h.ledger.get(&addr("10.0.0.5")).unwrap().unwrap().attempts, 4);
        assert_eq!(h.firewall.blocks(), 1);
    }

    #[test]
    fn test_rescan_is_idempotent() {
        let h = harness(&test_config(10));
        for second in 0..5 {
            h.source.push("198.51.100.20", &format!("2024-01-01 10:00:0{}", second));
        }

        assert_eq!(h.orchestrator.run_scan(ScanMode::Auto).unwrap(), 5);
        assert_eq!(h.orchestrator.run_scan(ScanMode::Auto).unwrap(), 0);
        assert_eq!(h.orchestrator.run_scan(ScanMode::Manual).unwrap(), 0);

        let record = h.ledger.get(&addr("198.51.100.20")).unwrap().unwrap();
        assert_eq!(record.attempts, 5);
        assert!(!record.banned);
        assert_eq!(h.ledger.event_count(&addr("198.51.100.20")).unwrap(), 5);
    }

    #[test]
    fn test_whitelisted_address_stores_nothing() {
        let h = harness(&test_config(1));
        for second in 0..5 {
            h.source.push("127.0.0.1", &format!("2024-01-01 10:00:0{}", second));
        }
        h.source.push("192.168.0.44", "2024-01-01 10:00:00");

        assert_eq!(h.orchestrator.run_scan(ScanMode::Manual).unwrap(), 0);
        assert!(h.ledger.get(&addr("127.0.0.1")).unwrap().is_none());
        assert!(h.ledger.get(&addr("192.168.0.44")).unwrap().is_none());
        assert!(h.firewall.calls().is_empty());
    }

    #[test]
    fn test_malformed_records_skipped() {
        let h = harness(&test_config(10));
        h.source.push("-", "2024-01-01 10:00:00");
        h.source.push("not-an-ip", "2024-01-01 10:00:00");
        h.source.push("10.0.0.9", "not a time");
        h.source.push("10.0.0.9", "Mon Jan 01 10:00:00 2024");

        assert_eq!(h.orchestrator.run_scan(ScanMode::Manual).unwrap(), 1);
        assert_eq!(h.ledger.snapshot().unwrap().len(), 1);
    }

    #[test]
    fn test_unban_then_new_event_rebans() {
        let h = harness(&test_config(2));
        h.source.push("10.0.0.5", "2024-01-01 10:00:00");
        h.source.push("10.0.0.5", "2024-01-01 10:00:01");
        h.orchestrator.run_scan(ScanMode::Auto).unwrap();
        assert_eq!(h.firewall.blocks(), 1);

        h.ledger.unban(&addr("10.0.0.5")).unwrap();
        // Replaying the same window changes nothing
        h.orchestrator.run_scan(ScanMode::Auto).unwrap();
        assert!(!h.ledger.ban_state(&addr("10.0.0.5")).unwrap().banned);

        h.source.push("10.0.0.5", "2024-01-01 10:00:02");
        h.orchestrator.run_scan(ScanMode::Auto).unwrap();
        assert!(h.ledger.ban_state(&addr("10.0.0.5")).unwrap().banned);
        assert_eq!(h.firewall.blocks(), 2);
    }

    #[test]
    fn test_firewall_failure_keeps_ban() {
        let h = harness(&test_config(1));
        h.firewall.fail.store(true, std::sync::atomic::Ordering::SeqCst);
        h.source.push("10.0.0.7", "2024-01-01 10:00:00");

        assert_eq!(h.orchestrator.run_scan(ScanMode::Manual).unwrap(), 1);
        assert!(h.ledger.ban_state(&addr("10.0.0.7")).unwrap().banned);
    }

    #[test]
    fn test_reload_changes_threshold() {
        let h = harness(&test_config(10));
        for second in 0..3 {
            h.source.push("10.0.0.5", &format!("2024-01-01 10:00:0{}", second));
        }
        h.orchestrator.run_scan(ScanMode::Auto).unwrap();
        assert!(!h.ledger.ban_state(&addr("10.0.0.5")).unwrap().banned);

        h.orchestrator.reload(&test_config(3)).unwrap();
        assert_eq!(h.orchestrator.policy().unwrap().effective_threshold(), 3);

        h.source.push("10.0.0.5", "2024-01-01 10:00:09");
        h.orchestrator.run_scan(ScanMode::Auto).unwrap();
        assert!(h.ledger.ban_state(&addr("10.0.0.5")).unwrap().banned);
    }

    #[test]
    fn test_scan_exports_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("banned_ips.json");
        let mut h = harness(&test_config(10));
        h.orchestrator = h
            .orchestrator
            .with_snapshot(Arc::new(JsonSnapshotFile::new(path.clone())));
        h.source.push("10.0.0.5", "2024-01-01 10:00:00");

        h.orchestrator.run_scan(ScanMode::Manual).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"10.0.0.5\""));
    }

    #[test]
    fn test_newest_first_delivery_counts_every_event() {
        let h = harness(&test_config(10));
        for second in (0..10).rev() {
            h.source.push("10.0.0.5", &format!("2024-01-01 10:00:0{}", second));
        }
        h.source.push("10.0.0.9", "2024-01-01 09:00:00");

        assert_eq!(h.orchestrator.run_scan(ScanMode::Auto).unwrap(), 11);

        let record = h.ledger.get(&addr("10.0.0.5")).unwrap().unwrap();
        assert_eq!(record.attempts, 10);
        assert!(record.banned);
        assert_eq!(h.firewall.blocks(), 1);
        assert_eq!(h.ledger.get(&addr("10.0.0.9")).unwrap().unwrap().attempts, 1);
    }

    /// Source whose fetch takes a while
    struct SlowSource {
        inner: VecSource,
        delay: std::time::Duration,
    }

    impl EventSource for SlowSource {
        fn fetch_raw_records(&self, filter: &EventFilter) -> Result<Vec<RawLoginRecord>, InputError> {
            std::thread::sleep(self.delay);
            self.inner.fetch_raw_records(filter)
        }
    }

    #[test]
    fn test_reload_does_not_wait_for_running_scan() {
        use std::time::{Duration, Instant};

        let config = test_config(10);
        let ledger: Arc<dyn AttemptLedger> = Arc::new(SqliteLedger::in_memory().unwrap());
        let enforcer = Arc::new(BanEnforcer::new(Box::new(RecordingFirewall::default()), "SMB_block_"));
        let inner = VecSource::default();
        inner.push("10.0.0.5", "2024-01-01 10:00:00");
        let source = SlowSource {
            inner,
            delay: Duration::from_millis(600),
        };
        let orchestrator = Arc::new(ScanOrchestrator::new(&config, ledger, Box::new(source), enforcer));

        let scan = {
            let orchestrator = Arc::clone(&orchestrator);
            std::thread::spawn(move || orchestrator.run_scan(ScanMode::Manual))
        };
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        orchestrator.reload(&test_config(3)).unwrap();
        assert_eq!(orchestrator.policy().unwrap().effective_threshold(), 3);
        assert!(started.elapsed() < Duration::from_millis(300));

        // The running scan keeps the settings it started with
        assert_eq!(scan.join().unwrap().unwrap(), 1);
    }

    #[test]
    fn test_source_error_fails_scan() {
        let config = test_config(10);
        let ledger: Arc<dyn AttemptLedger> = Arc::new(SqliteLedger::in_memory().unwrap());
        let enforcer = Arc::new(BanEnforcer::new(Box::new(RecordingFirewall::default()), "SMB_block_"));
        let source = crate::input::JsonlEventSource::new("/nonexistent/events.jsonl".into());
        let orchestrator = ScanOrchestrator::new(&config, ledger, Box::new(source), enforcer);

        assert!(matches!(
            orchestrator.run_scan(ScanMode::Auto),
            Err(ScanError::Input(_))
        ));
    }
}
