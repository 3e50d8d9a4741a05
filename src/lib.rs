pub mod alerting;
pub mod config;
pub mod detection;
pub mod enforcement;
pub mod geolocation;
pub mod input;
pub mod models;
pub mod output;
pub mod persistence;
pub mod scan;
pub mod service;
pub mod whitelist;

// Re-export commonly used types
pub use alerting::{AlertDispatcher, AlertQueue, BanNotice};
pub use config::Config;
pub use detection::BanPolicy;
pub use enforcement::{BanEnforcer, Firewall};
pub use geolocation::GeoIpService;
pub use models::{FailedLoginEvent, IpRecord, RawLoginRecord, RecordFilter, ScanMode, ScanStatus};
pub use persistence::{AttemptLedger, SqliteLedger};
pub use scan::{ScanOrchestrator, ScanRunner, ScanScheduler};
pub use service::{GuardService, ScanTrigger, ServiceError};
pub use whitelist::WhitelistResolver;
