use chrono::{Datelike, Duration, NaiveDateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use super::{EventFilter, EventSource, InputError};
use crate::models::event::FAILED_LOGON_EVENT_ID;
use crate::models::RawLoginRecord;

fn open(path: &Path) -> Result<BufReader<File>, InputError> {
    let file = File::open(path).map_err(|source| InputError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(BufReader::new(file))
}

/// One line of an exported event log
///
/// Either carries the fields directly or the raw insertion strings of the
/// security event, which are mapped by position.
#[derive(Debug, Deserialize)]
struct ExportedEvent {
    #[serde(flatten)]
    record: RawLoginRecord,
    #[serde(default)]
    string_inserts: Option<Vec<String>>,
    /// Event log the record was exported from; lines without one match
    /// any filter
    #[serde(default)]
    log_name: Option<String>,
}

impl ExportedEvent {
    fn matches(&self, filter: &EventFilter) -> bool {
        self.record.event_id == filter.event_id
            && self
                .log_name
                .as_deref()
                .map_or(true, |name| name.eq_ignore_ascii_case(&filter.log_name))
    }

    fn into_record(self) -> RawLoginRecord {
        match self.string_inserts {
            Some(inserts) if self.record.source_address.is_none() => RawLoginRecord::from_string_inserts(
                self.record.event_id,
                self.record.time_generated.as_deref().unwrap_or_default(),
                &inserts,
            ),
            _ => self.record,
        }
    }
}

/// Exported event log with one JSON record per line
///
/// The whole file is read on every fetch.
pub struct JsonlEventSource {
    file_path: PathBuf,
}

impl JsonlEventSource {
    pub fn new(file_path: PathBuf) -> Self {
        JsonlEventSource { file_path }
    }
}

impl EventSource for JsonlEventSource {
    fn fetch_raw_records(&self, filter: &EventFilter) -> Result<Vec<RawLoginRecord>, InputError> {
        let reader = open(&self.file_path)?;
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for (number, line) in reader.lines().enumerate() {
            let line = line.map_err(|source| InputError::Io {
                path: self.file_path.clone(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }

            match serde_json::from_str::<ExportedEvent>(&line) {
                Ok(event) if event.matches(filter) => records.push(event.into_record()),
                Ok(_) => {}
                Err(e) => {
                    skipped += 1;
                    log::debug!("Skipping malformed line {} in {:?}: {}", number + 1, self.file_path, e);
                }
            }
        }

        if skipped > 0 {
            log::warn!("Skipped {} malformed line(s) in {:?}", skipped, self.file_path);
        }
        Ok(records)
    }
}

/// sshd failed-password lines from a syslog-style auth log
///
/// Each match is reported as a failed logon (event id 4625) with the
/// logging host as workstation. The file is the log, so the filter's log
/// name is not consulted.
pub struct AuthLogSource {
    file_path: PathBuf,
    pattern: Regex,
}

impl AuthLogSource {
    pub fn new(file_path: PathBuf) -> Result<Self, InputError> {
        let pattern = Regex::new(
            r"^(?P<stamp>[A-Z][a-z]{2}\s+\d{1,2}\s+\d{2}:\d{2}:\d{2}|\d{4}-\d{2}-\d{2}T\S+)\s+(?P<host>\S+)\s+sshd(?:\[\d+\])?:\s+Failed password for (?:invalid user )?(?P<user>\S+) from (?P<ip>\S+) port \d+",
        )?;
        Ok(AuthLogSource { file_path, pattern })
    }

    /// Parse one log line; lines that are not failed sshd logins yield `None`
    pub fn parse_line(&self, line: &str, year: i32) -> Option<RawLoginRecord> {
        let caps = self.pattern.captures(line)?;
        let stamp = &caps["stamp"];

        let time_generated = if stamp.contains('T') {
            stamp.to_string()
        } else {
            syslog_stamp_to_iso(stamp, year)?
        };

        Some(RawLoginRecord {
            event_id: FAILED_LOGON_EVENT_ID,
            time_generated: Some(time_generated),
            source_address: Some(caps["ip"].to_string()),
            workstation: Some(caps["host"].to_string()),
            user: Some(caps["user"].to_string()),
        })
    }
}

/// Classic syslog stamps carry no year; assume the current one unless that
/// puts the entry in the future.
fn syslog_stamp_to_iso(stamp: &str, year: i32) -> Option<String> {
    let compact = stamp.split_whitespace().collect::<Vec<_>>().join(" ");
    let parse = |y: i32| NaiveDateTime::parse_from_str(&format!("{} {}", y, compact), "%Y %b %d %H:%M:%S").ok();

    let mut parsed = parse(year)?;
    if parsed > Utc::now().naive_utc() + Duration::days(1) {
        parsed = parse(year - 1)?;
    }
    Some(parsed.format("%Y-%m-%d %H:%M:%S").to_string())
}

impl EventSource for AuthLogSource {
    fn fetch_raw_records(&self, filter: &EventFilter) -> Result<Vec<RawLoginRecord>, InputError> {
        if filter.event_id != FAILED_LOGON_EVENT_ID {
            return Ok(Vec::new());
        }

        let reader = open(&self.file_path)?;
        let year = Utc::now().year();
        let mut records = Vec::new();

        for line in reader.lines() {
            let line = line.map_err(|source| InputError::Io {
                path: self.file_path.clone(),
                source,
            })?;
            if let Some(record) = self.parse_line(&line, year) {
                records.push(record);
            }
        }

        Ok(records)
    }
}
