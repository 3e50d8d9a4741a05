//! Audit trail and ledger snapshot export

use crate::config::OutputConfig;
use crate::models::{BanAuditEntry, IpRecord};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Output handler for ban audit entries
pub struct OutputHandler {
    format: OutputFormat,
    writer: Option<Box<dyn Write + Send>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Jsonl,
    Console,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "jsonl" => OutputFormat::Jsonl,
            "console" => OutputFormat::Console,
            _ => OutputFormat::Jsonl, // Default
        }
    }
}

impl OutputHandler {
    /// Create a new output handler; without a file, entries go to stdout
    pub fn new(format: OutputFormat, file_path: Option<PathBuf>) -> Result<Self, OutputError> {
        let writer: Option<Box<dyn Write + Send>> = match (&format, file_path) {
            (OutputFormat::Console, _) => None,
            (_, Some(path)) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Some(Box::new(BufWriter::new(file)))
            }
            (_, None) => None,
        };

        Ok(OutputHandler { format, writer })
    }

    pub fn from_config(config: &OutputConfig) -> Result<Self, OutputError> {
        Self::new(OutputFormat::from_str(&config.format), config.file_path.clone())
    }

    /// In-memory handler, used by tests to inspect what was written
    #[cfg(test)]
    pub(crate) fn with_writer(format: OutputFormat, writer: Box<dyn Write + Send>) -> Self {
        OutputHandler {
            format,
            writer: Some(writer),
        }
    }

    pub fn write_entry(&mut self, entry: &BanAuditEntry) -> Result<(), OutputError> {
        let output = match &self.format {
            OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(entry)?),
            OutputFormat::Jsonl => format!("{}\n", serde_json::to_string(entry)?),
            OutputFormat::Console => format_console(entry),
        };
        self.write_output(&output)
    }

    fn write_output(&mut self, data: &str) -> Result<(), OutputError> {
        match &mut self.writer {
            Some(writer) => {
                writer.write_all(data.as_bytes())?;
                writer.flush()?;
            }
            None => {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(data.as_bytes())?;
                stdout.flush()?;
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), OutputError> {
        if let Some(writer) = &mut self.writer {
            writer.flush()?;
        }
        Ok(())
    }
}

fn format_console(entry: &BanAuditEntry) -> String {
    let status = match (&entry.applied, &entry.error) {
        (true, _) => "applied".to_string(),
        (false, Some(err)) => format!("failed: {}", err),
        (false, None) => "not applied".to_string(),
    };
    let location = entry
        .location
        .as_deref()
        .map(|l| format!(" ({})", l))
        .unwrap_or_default();

    format!(
        "[{}] {} {}{} - attempts: {}, user: {}, workstation: {}, rule: {} [{}]\n",
        entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
        entry.action,
        entry.address,
        location,
        entry.attempts,
        entry.user,
        entry.workstation,
        entry.rule_name,
        status
    )
}

/// Destination for the full ledger snapshot
pub trait SnapshotSink: Send + Sync {
    fn export_snapshot(&self, records: &BTreeMap<String, IpRecord>) -> Result<(), OutputError>;
}

/// Pretty JSON object keyed by address, replaced atomically on every export
pub struct JsonSnapshotFile {
    path: PathBuf,
}

impl JsonSnapshotFile {
    pub fn new(path: PathBuf) -> Self {
        JsonSnapshotFile { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl SnapshotSink for JsonSnapshotFile {
    fn export_snapshot(&self, records: &BTreeMap<String, IpRecord>) -> Result<(), OutputError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut writer = BufWriter::new(File::create(&tmp_path)?);
            serde_json::to_writer_pretty(&mut writer, records)?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        std::fs::rename(&tmp_path, &self.path)?;

        log::debug!("Exported {} record(s) to {:?}", records.len(), self.path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AuditAction;
    use chrono::Utc;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuffer {
        fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    fn create_test_record(address: &str) -> IpRecord {
        IpRecord {
            address: address.to_string(),
            attempts: 12,
            last_attempt: Utc::now(),
            workstation: "WIN-X".to_string(),
            last_user: "admin".to_string(),
            banned: true,
            banned_at: Some(Utc::now()),
            manual: false,
        }
    }

    fn create_test_entry() -> BanAuditEntry {
        let mut entry = BanAuditEntry::for_record(
            AuditAction::Ban,
            &create_test_record("10.0.0.5"),
            "SMB_block_10.0.0.5".to_string(),
        );
        entry.applied = true;
        entry
    }

    #[test]
    fn test_output_format_from_str() {
        assert_eq!(OutputFormat::from_str("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from_str("console"), OutputFormat::Console);
        assert_eq!(OutputFormat::from_str("whatever"), OutputFormat::Jsonl);
    }

    #[test]
    fn test_jsonl_entry() {
        let buffer = SharedBuffer::default();
        let mut handler = OutputHandler::with_writer(OutputFormat::Jsonl, Box::new(buffer.clone()));
        handler.write_entry(&create_test_entry()).unwrap();

        let contents = buffer.contents();
        assert_eq!(contents.lines().count(), 1);
        let parsed: BanAuditEntry = serde_json::from_str(contents.trim()).unwrap();
        assert_eq!(parsed.address, "10.0.0.5");
        assert_eq!(parsed.action, AuditAction::Ban);
        assert!(!contents.contains("\"error\""));
    }

    #[test]
    fn test_console_line() {
        let mut entry = create_test_entry();
        entry.applied = false;
        entry.error = Some("netsh exited with 1".to_string());
        entry.location = Some("Berlin, Germany".to_string());

        let line = format_console(&entry);
        assert!(line.contains("ban 10.0.0.5 (Berlin, Germany)"));
        assert!(line.contains("failed: netsh exited with 1"));
    }

    #[test]
    fn test_file_output_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        for _ in 0..2 {
            let mut handler = OutputHandler::new(OutputFormat::Jsonl, Some(path.clone())).unwrap();
            handler.write_entry(&create_test_entry()).unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn test_snapshot_replaced_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("banned_ips.json");
        let sink = JsonSnapshotFile::new(path.clone());

        let mut records = BTreeMap::new();
        records.insert("10.0.0.5".to_string(), create_test_record("10.0.0.5"));
        sink.export_snapshot(&records).unwrap();

        records.insert("10.0.0.6".to_string(), create_test_record("10.0.0.6"));
        sink.export_snapshot(&records).unwrap();

        let parsed: BTreeMap<String, IpRecord> =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["10.0.0.6"].attempts, 12);
        assert!(!dir.path().join("out").join("banned_ips.json.tmp").exists());
    }
}
