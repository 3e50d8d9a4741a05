use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::IpRecord;

/// Ban lifecycle transition recorded in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Ban,
    ManualBan,
    Unban,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Ban => write!(f, "ban"),
            AuditAction::ManualBan => write!(f, "manual_ban"),
            AuditAction::Unban => write!(f, "unban"),
        }
    }
}

/// One audit line: what happened to an address and whether the firewall
/// accepted the change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanAuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub address: String,
    pub attempts: u32,
    pub workstation: String,
    pub user: String,
    pub rule_name: String,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl BanAuditEntry {
    pub fn for_record(action: AuditAction, record: &IpRecord, rule_name: String) -> Self {
        BanAuditEntry {
            timestamp: Utc::now(),
            action,
            address: record.address.clone(),
            attempts: record.attempts,
            workstation: record.workstation.clone(),
            user: record.last_user.clone(),
            rule_name,
            applied: false,
            error: None,
            location: None,
        }
    }
}
