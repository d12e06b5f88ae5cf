//! sqlrun common library
//!
//! Shared error taxonomy, worker protocol and configuration for the
//! coordinator and worker binaries.

pub mod config;
pub mod error;
pub mod protocol;

// Re-export commonly used types
pub use config::{AppConfig, Backend, WorkerSettings};
pub use error::{Result, SqlRunError};
pub use protocol::{
    CloseResult, ColumnInfo, Command, ConnectResult, ErrorDetails, ExecuteResult, LineDecoder,
    ProtocolError, ReconnectResult, ResponseKind, Row, WorkerEvent,
};
