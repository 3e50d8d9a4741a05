//! Scan orchestration and scheduling

pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::{ScanOrchestrator, ScanRunner};
pub use scheduler::{ScanScheduler, ScanTicket, SchedulerError};

use thiserror::Error;

use crate::input::InputError;
use crate::output::OutputError;
use crate::persistence::PersistenceError;

/// Errors that abort a whole scan; per-record failures are only logged
#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Event source error: {0}")]
    Input(#[from] InputError),

    #[error("Ledger error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Snapshot export error: {0}")]
    Output(#[from] OutputError),

    #[error("Scan settings lock poisoned")]
    LockPoisoned,
}
