//! SQLite implementation of the AttemptLedger trait

use super::{AttemptLedger, PersistenceError};
use crate::models::{BanState, EventRecord, IpRecord, LedgerStats, RecordFilter, RecordOutcome, TimelinePoint};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Ordered schema migrations; the database's `user_version` is the number
/// already applied.
const MIGRATIONS: &[&str] = &[
    include_str!("schema.sql"),
    "CREATE INDEX IF NOT EXISTS idx_ip_records_banned ON ip_records(banned, banned_at);",
];

const RECORD_COLUMNS: &str =
    "address, attempts, last_attempt, workstation, last_user, banned, banned_at, manual";

/// SQLite-backed attempt ledger
///
/// A single connection behind a mutex serializes every mutation. Each
/// operation is one short transaction, so readers wait at most for a
/// single address update.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (or create) the ledger database at the specified path
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, PersistenceError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(conn)
    }

    /// Create an in-memory ledger (useful for testing)
    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        let ledger = SqliteLedger {
            conn: Mutex::new(conn),
        };
        ledger.migrate()?;
        Ok(ledger)
    }

    /// Apply pending schema migrations
    fn migrate(&self) -> Result<(), PersistenceError> {
        let mut conn = self.conn()?;
        let current: u32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let supported = MIGRATIONS.len() as u32;

        if current > supported {
            return Err(PersistenceError::UnsupportedSchema {
                found: current,
                supported,
            });
        }

        for (index, migration) in MIGRATIONS.iter().enumerate().skip(current as usize) {
            let tx = conn.transaction()?;
            tx.execute_batch(migration)?;
            tx.pragma_update(None, "user_version", index as u32 + 1)?;
            tx.commit()?;
            log::debug!("Applied ledger migration {}", index + 1);
        }

        Ok(())
    }

    /// Schema version currently applied
    pub fn schema_version(&self) -> Result<u32, PersistenceError> {
        let conn = self.conn()?;
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::LockPoisoned)
    }

    fn fetch(conn: &Connection, address: &str) -> Result<Option<IpRecord>, PersistenceError> {
        let record = conn
            .query_row(
                &format!("SELECT {} FROM ip_records WHERE address = ?1", RECORD_COLUMNS),
                params![address],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

fn from_timestamp(idx: usize, secs: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, secs))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<IpRecord> {
    let banned_at: Option<i64> = row.get(6)?;
    Ok(IpRecord {
        address: row.get(0)?,
        attempts: row.get(1)?,
        last_attempt: from_timestamp(2, row.get(2)?)?,
        workstation: row.get(3)?,
        last_user: row.get(4)?,
        banned: row.get(5)?,
        banned_at: banned_at.map(|secs| from_timestamp(6, secs)).transpose()?,
        manual: row.get(7)?,
    })
}

impl AttemptLedger for SqliteLedger {
    fn record_event(
        &self,
        address: &IpAddr,
        occurred_at: DateTime<Utc>,
        workstation: &str,
        user: &str,
    ) -> Result<RecordOutcome, PersistenceError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let key = address.to_string();
        let timestamp = occurred_at.timestamp();

        let existing: Option<(u32, i64)> = tx
            .query_row(
                "SELECT attempts, last_attempt FROM ip_records WHERE address = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((attempts, last_attempt)) = existing {
            if timestamp <= last_attempt {
                log::trace!(
                    "Skipping stale event for {} at {} (last processed {})",
                    key,
                    timestamp,
                    last_attempt
                );
                return Ok(RecordOutcome {
                    attempts,
                    accepted: false,
                });
            }
        }

        let already_recorded: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE address = ?1 AND occurred_at = ?2)",
            params![key, timestamp],
            |row| row.get(0),
        )?;
        if already_recorded {
            log::debug!("Event already stored for {} at {}; ignoring for counters", key, timestamp);
            return Ok(RecordOutcome {
                attempts: existing.map(|(attempts, _)| attempts).unwrap_or(0),
                accepted: false,
            });
        }

        tx.execute(
            "INSERT INTO events (address, occurred_at, workstation, user) VALUES (?1, ?2, ?3, ?4)",
            params![key, timestamp, workstation, user],
        )?;
        let attempts: u32 = tx.query_row(
            "INSERT INTO ip_records (address, attempts, last_attempt, workstation, last_user, banned, banned_at, manual)
             VALUES (?1, 1, ?2, ?3, ?4, 0, NULL, 0)
             ON CONFLICT(address) DO UPDATE SET
                 attempts = attempts + 1,
                 last_attempt = excluded.last_attempt,
                 workstation = excluded.workstation,
                 last_user = excluded.last_user
             RETURNING attempts",
            params![key, timestamp, workstation, user],
            |row| row.get(0),
        )?;
        tx.commit()?;

        Ok(RecordOutcome {
            attempts,
            accepted: true,
        })
    }

    fn ban_state(&self, address: &IpAddr) -> Result<BanState, PersistenceError> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                "SELECT banned, banned_at FROM ip_records WHERE address = ?1",
                params![address.to_string()],
                |row| {
                    let banned_at: Option<i64> = row.get(1)?;
                    Ok(BanState {
                        banned: row.get(0)?,
                        banned_at: banned_at.map(|secs| from_timestamp(1, secs)).transpose()?,
                    })
                },
            )
            .optional()?;
        Ok(state.unwrap_or_default())
    }

    fn set_banned(&self, address: &IpAddr, banned: bool) -> Result<(), PersistenceError> {
        let conn = self.conn()?;
        let key = address.to_string();

        if banned {
            let now = Utc::now().timestamp();
            conn.execute(
                "INSERT INTO ip_records (address, attempts, last_attempt, workstation, last_user, banned, banned_at, manual)
                 VALUES (?1, 1, ?2, '-', '-', 1, ?2, 0)
                 ON CONFLICT(address) DO UPDATE SET
                     banned = 1,
                     banned_at = COALESCE(banned_at, excluded.banned_at)",
                params![key, now],
            )?;
        } else {
            conn.execute(
                "UPDATE ip_records SET banned = 0, banned_at = NULL WHERE address = ?1",
                params![key],
            )?;
        }
        Ok(())
    }

    fn upsert_manual_ban(
        &self,
        address: &IpAddr,
        attempts: u32,
        workstation: &str,
        user: &str,
        threshold: u32,
    ) -> Result<IpRecord, PersistenceError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let key = address.to_string();
        let now = Utc::now().timestamp();
        let attempts = attempts.max(threshold);

        // Existing counters never move backwards
        tx.execute(
            "INSERT INTO ip_records (address, attempts, last_attempt, workstation, last_user, banned, banned_at, manual)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?3, 1)
             ON CONFLICT(address) DO UPDATE SET
                 attempts = MAX(attempts, excluded.attempts),
                 last_attempt = MAX(last_attempt, excluded.last_attempt),
                 workstation = excluded.workstation,
                 last_user = excluded.last_user,
                 banned = 1,
                 banned_at = COALESCE(banned_at, excluded.banned_at),
                 manual = 1",
            params![key, attempts, now, workstation, user],
        )?;
        let record = Self::fetch(&tx, &key)?.ok_or_else(|| {
            PersistenceError::InvalidData(format!("record for {} vanished after upsert", key))
        })?;
        tx.commit()?;

        Ok(record)
    }

    fn get(&self, address: &IpAddr) -> Result<Option<IpRecord>, PersistenceError> {
        let conn = self.conn()?;
        Self::fetch(&conn, &address.to_string())
    }

    fn list_records(&self, filter: &RecordFilter) -> Result<Vec<IpRecord>, PersistenceError> {
        let conn = self.conn()?;
        let start = filter.start.map(|t| t.timestamp()).unwrap_or(i64::MIN);
        let end = filter.end.map(|t| t.timestamp()).unwrap_or(i64::MAX);

        // Sort column and direction come from closed enums
        let query = format!(
            "SELECT {} FROM ip_records
             WHERE attempts >= ?1 AND last_attempt >= ?2 AND last_attempt <= ?3
             ORDER BY {} {}, address ASC",
            RECORD_COLUMNS,
            filter.sort_by.column(),
            filter.sort_order.keyword()
        );

        let mut stmt = conn.prepare(&query)?;
        let records = stmt
            .query_map(params![filter.min_attempts, start, end], row_to_record)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn snapshot(&self) -> Result<BTreeMap<String, IpRecord>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!("SELECT {} FROM ip_records", RECORD_COLUMNS))?;
        let records = stmt
            .query_map([], row_to_record)?
            .map(|r| r.map(|record| (record.address.clone(), record)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(records)
    }

    fn events(&self, address: &IpAddr) -> Result<Vec<EventRecord>, PersistenceError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, occurred_at, workstation, user FROM events
             WHERE address = ?1 ORDER BY occurred_at ASC",
        )?;
        let events = stmt
            .query_map(params![address.to_string()], |row| {
                Ok(EventRecord {
                    address: row.get(0)?,
                    occurred_at: from_timestamp(1, row.get(1)?)?,
                    workstation: row.get(2)?,
                    user: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn event_count(&self, address: &IpAddr) -> Result<usize, PersistenceError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM events WHERE address = ?1",
            params![address.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn stats(&self, days: u32) -> Result<LedgerStats, PersistenceError> {
        let days = days.clamp(1, 30);
        let lower_bound = (Utc::now() - Duration::days(days as i64)).timestamp();
        let conn = self.conn()?;

        let total_banned: u32 = conn.query_row(
            "SELECT COUNT(*) FROM ip_records WHERE banned = 1",
            [],
            |row| row.get(0),
        )?;
        let recent_banned: u32 = conn.query_row(
            "SELECT COUNT(*) FROM ip_records WHERE banned = 1 AND banned_at >= ?1",
            params![lower_bound],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare(
            "SELECT date(occurred_at, 'unixepoch') AS day, COUNT(*)
             FROM events WHERE occurred_at >= ?1
             GROUP BY day ORDER BY day",
        )?;
        let timeline = stmt
            .query_map(params![lower_bound], |row| {
                Ok(TimelinePoint {
                    date: row.get(0)?,
                    attempts: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(LedgerStats {
            total_banned,
            recent_banned,
            window_days: days,
            timeline,
        })
    }
}
