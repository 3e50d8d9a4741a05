pub mod file_source;
pub mod normalizer;

pub use file_source::{AuthLogSource, JsonlEventSource};
pub use normalizer::EventNormalizer;

use std::path::PathBuf;
use thiserror::Error;

use crate::config::InputConfig;
use crate::models::RawLoginRecord;

#[derive(Error, Debug)]
pub enum InputError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Unknown input source type: {0}")]
    UnknownSource(String),
}

/// Selects which raw records a scan is interested in
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub log_name: String,
    pub event_id: u32,
}

/// A source of raw failed-login records
///
/// Called once per scan. Sources may return records already seen in a
/// previous call; the ledger absorbs the overlap.
pub trait EventSource: Send + Sync {
    fn fetch_raw_records(&self, filter: &EventFilter) -> Result<Vec<RawLoginRecord>, InputError>;
}

/// Build the event source named in the input configuration
pub fn source_from_config(config: &InputConfig) -> Result<Box<dyn EventSource>, InputError> {
    match config.source_type.as_str() {
        "jsonl" => Ok(Box::new(JsonlEventSource::new(config.file_path.clone()))),
        "auth_log" => Ok(Box::new(AuthLogSource::new(config.file_path.clone())?)),
        other => Err(InputError::UnknownSource(other.to_string())),
    }
}
