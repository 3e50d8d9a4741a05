use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-address ban state, one row per source address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRecord {
    pub address: String,
    pub attempts: u32,
    pub last_attempt: DateTime<Utc>,
    pub workstation: String,
    pub last_user: String,
    pub banned: bool,
    pub banned_at: Option<DateTime<Utc>>,
    pub manual: bool,
}

/// Result of recording one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordOutcome {
    /// Attempt count after the call
    pub attempts: u32,
    /// False for stale or duplicate events, which leave the count unchanged
    pub accepted: bool,
}

/// Ban flag and transition time of a single address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BanState {
    pub banned: bool,
    pub banned_at: Option<DateTime<Utc>>,
}

/// Column used to order a record listing
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    LastAttempt,
    Attempts,
    Address,
    BannedAt,
}

impl SortBy {
    /// Parse a sort key, falling back to `LastAttempt` for anything unknown
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "attempts" => SortBy::Attempts,
            "ip" | "address" => SortBy::Address,
            "banned_time" | "banned_at" => SortBy::BannedAt,
            _ => SortBy::LastAttempt,
        }
    }

    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortBy::LastAttempt => "last_attempt",
            SortBy::Attempts => "attempts",
            SortBy::Address => "address",
            SortBy::BannedAt => "banned_at",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn from_str(s: &str) -> Self {
        if s.eq_ignore_ascii_case("asc") {
            SortOrder::Asc
        } else {
            SortOrder::Desc
        }
    }

    pub(crate) fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter for listing ledger records
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordFilter {
    pub min_attempts: u32,
    /// Inclusive lower bound on `last_attempt`
    pub start: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `last_attempt`
    pub end: Option<DateTime<Utc>>,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

/// Failed attempts recorded on a single day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelinePoint {
    pub date: String,
    pub attempts: u32,
}

/// Aggregate ban statistics over a trailing window of days
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerStats {
    pub total_banned: u32,
    pub recent_banned: u32,
    pub window_days: u32,
    pub timeline: Vec<TimelinePoint>,
}
