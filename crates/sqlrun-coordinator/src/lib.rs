//! sqlrun coordinator
//!
//! Runs SQL for editor files through long-lived worker processes, one per
//! file:
//! - `transport`: line-delimited JSON over a worker's stdio
//! - `queue`: FIFO, one statement in flight per session
//! - `session` / `registry`: worker lifecycle per file key, capped globally
//! - `run`: multi-statement runs with batch abort and destructive cancel

pub mod launcher;
pub mod presenter;
pub mod queue;
pub mod registry;
pub mod run;
pub mod session;
pub mod splitter;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use launcher::{ProcessLauncher, WorkerHandle, WorkerIo, WorkerLauncher};
pub use presenter::{ConsolePresenter, OutputFormat};
pub use queue::{
    BatchEntry, Completion, OnSettled, OnStarted, QueryQueue, QueueClaim, StatementExecutor,
};
pub use registry::SessionRegistry;
pub use run::{CancelReason, MessageResult, RunCoordinator, RunEvent, RunId, RunStatus, RunSummary};
pub use session::{Session, SessionOptions, SessionState};
pub use splitter::{ParsedStatement, SemicolonSplitter, StatementParser};
pub use transport::WorkerTransport;
