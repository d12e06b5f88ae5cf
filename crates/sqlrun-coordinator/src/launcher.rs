//! Worker process launching
//!
//! The transport never spawns processes itself; it asks a `WorkerLauncher`
//! for a set of pipes plus a kill handle. Production uses
//! `ProcessLauncher`, tests plug in an in-process fake.

use async_trait::async_trait;
use sqlrun_common::{Result, SqlRunError, WorkerSettings};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Forcible termination of a launched worker
pub trait WorkerHandle: Send {
    /// Kill the worker immediately; must be idempotent
    fn kill(&mut self);

    /// OS process id, when there is one
    fn id(&self) -> Option<u32>;
}

/// The pipes of one launched worker
pub struct WorkerIo {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    /// Informational output, logged but never parsed
    pub stderr: Option<BoxedReader>,
    pub handle: Box<dyn WorkerHandle>,
}

/// Spawns workers
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self) -> Result<WorkerIo>;
}

/// Spawns the configured worker executable with piped stdio
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self::new(settings.resolve_program(), settings.command_args())
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self) -> Result<WorkerIo> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SqlRunError::Connection(format!(
                    "failed to spawn worker {}: {}",
                    self.program.display(),
                    e
                ))
            })?;

        let pid = child.id();
        info!(pid = ?pid, program = %self.program.display(), "Spawned worker process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SqlRunError::internal("worker stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SqlRunError::internal("worker stdout was not piped"))?;
        let stderr = child.stderr.take();

        Ok(WorkerIo {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            handle: Box::new(ProcessHandle { child, pid }),
        })
    }
}

struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
}

impl WorkerHandle for ProcessHandle {
    fn kill(&mut self) {
        match self.child.try_wait() {
            Ok(Some(status)) => debug!(pid = ?self.pid, %status, "Worker already exited"),
            _ => {
                if let Err(e) = self.child.start_kill() {
                    warn!(pid = ?self.pid, error = %e, "Failed to kill worker");
                } else {
                    debug!(pid = ?self.pid, "Killed worker");
                }
            }
        }
    }

    fn id(&self) -> Option<u32> {
        self.pid
    }
}
