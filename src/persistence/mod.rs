//! Persistence module for the attempt ledger
//!
//! This module provides durable storage for per-address attempt counts
//! and ban state, so decisions survive daemon restarts.

pub mod sqlite_store;

pub use sqlite_store::SqliteLedger;

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::net::IpAddr;
use thiserror::Error;

use crate::detection::BanPolicy;
use crate::models::{BanState, EventRecord, IpRecord, LedgerStats, RecordFilter, RecordOutcome};

/// Errors that can occur during persistence operations
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid data in database: {0}")]
    InvalidData(String),

    #[error("Database schema version {found} is newer than supported version {supported}")]
    UnsupportedSchema { found: u32, supported: u32 },

    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

/// The per-address ban state machine
///
/// Implementations serialize all mutations; every method is a single
/// atomic unit with respect to other callers.
pub trait AttemptLedger: Send + Sync {
    // =====================
    // Ingestion
    // =====================

    /// Record a failed login, idempotently
    ///
    /// Events not strictly newer than the stored `last_attempt`, and events
    /// whose `(address, occurred_at)` pair is already stored, are not
    /// accepted and leave the count unchanged.
    fn record_event(
        &self,
        address: &IpAddr,
        occurred_at: DateTime<Utc>,
        workstation: &str,
        user: &str,
    ) -> Result<RecordOutcome, PersistenceError>;

    // =====================
    // Ban state
    // =====================

    fn ban_state(&self, address: &IpAddr) -> Result<BanState, PersistenceError>;

    /// Set the ban flag
    ///
    /// Banning keeps an existing `banned_at`; unbanning clears it. Banning
    /// an unknown address creates a minimal record.
    fn set_banned(&self, address: &IpAddr, banned: bool) -> Result<(), PersistenceError>;

    fn unban(&self, address: &IpAddr) -> Result<(), PersistenceError> {
        self.set_banned(address, false)
    }

    /// Create or overwrite an operator ban
    ///
    /// The stored attempt count is the larger of `attempts` and `threshold`.
    fn upsert_manual_ban(
        &self,
        address: &IpAddr,
        attempts: u32,
        workstation: &str,
        user: &str,
        threshold: u32,
    ) -> Result<IpRecord, PersistenceError>;

    /// Whether `attempts` should trigger a new ban for `address`
    fn decide_ban(
        &self,
        address: &IpAddr,
        attempts: u32,
        policy: &BanPolicy,
    ) -> Result<bool, PersistenceError> {
        if attempts < policy.effective_threshold() {
            return Ok(false);
        }
        let state = self.ban_state(address)?;
        Ok(policy.should_ban(address, attempts, &state, Utc::now()))
    }

    // =====================
    // Queries
    // =====================

    fn get(&self, address: &IpAddr) -> Result<Option<IpRecord>, PersistenceError>;

    fn list_records(&self, filter: &RecordFilter) -> Result<Vec<IpRecord>, PersistenceError>;

    /// Every record keyed by address
    fn snapshot(&self) -> Result<BTreeMap<String, IpRecord>, PersistenceError>;

    /// Accepted events for an address, oldest first
    fn events(&self, address: &IpAddr) -> Result<Vec<EventRecord>, PersistenceError>;

    /// Number of stored event rows for an address
    fn event_count(&self, address: &IpAddr) -> Result<usize, PersistenceError>;

    fn stats(&self, days: u32) -> Result<LedgerStats, PersistenceError>;
}
