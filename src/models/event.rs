use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Event id of a Windows "An account failed to log on" record
pub const FAILED_LOGON_EVENT_ID: u32 = 4625;

/// A failed-login record as delivered by an event source adapter.
///
/// Every field except the event id is optional; the normalizer decides
/// whether enough of it is present to count as an attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawLoginRecord {
    pub event_id: u32,
    #[serde(default)]
    pub time_generated: Option<String>,
    #[serde(default)]
    pub source_address: Option<String>,
    #[serde(default)]
    pub workstation: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

impl RawLoginRecord {
    /// Build a record from the insertion strings of a 4625 security event.
    ///
    /// Layout: target user at index 5, workstation at index 13 and the
    /// source network address second to last.
    pub fn from_string_inserts(event_id: u32, time_generated: &str, inserts: &[String]) -> Self {
        let source_address = if inserts.len() >= 2 {
            inserts.get(inserts.len() - 2).cloned()
        } else {
            None
        };

        RawLoginRecord {
            event_id,
            time_generated: Some(time_generated.to_string()),
            source_address,
            workstation: inserts.get(13).cloned(),
            user: inserts.get(5).cloned(),
        }
    }
}

/// A normalized failed login, consumed once by the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedLoginEvent {
    pub address: IpAddr,
    pub occurred_at: DateTime<Utc>,
    pub workstation: String,
    pub user: String,
}

/// Append-only audit row for an accepted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub address: String,
    pub occurred_at: DateTime<Utc>,
    pub workstation: String,
    pub user: String,
}
