pub mod audit;
pub mod event;
pub mod record;
pub mod scan;

pub use audit::{AuditAction, BanAuditEntry};
pub use event::{EventRecord, FailedLoginEvent, RawLoginRecord};
pub use record::{BanState, IpRecord, LedgerStats, RecordFilter, RecordOutcome, SortBy, SortOrder, TimelinePoint};
pub use scan::{ScanMode, ScanStatus};
