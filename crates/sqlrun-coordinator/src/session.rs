//! Session lifecycle
//!
//! A session pairs one worker transport with one query queue and is scoped
//! to one file key. It is only handed out after the worker has connected;
//! once it reaches a terminal state it is never revived, the registry
//! replaces it instead.

use async_trait::async_trait;
use serde::Serialize;
use sqlrun_common::{Command, ExecuteResult, ReconnectResult, Result, SqlRunError, WorkerEvent};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::launcher::WorkerLauncher;
use crate::queue::{BatchEntry, Completion, OnStarted, QueryQueue, StatementExecutor};
use crate::transport::WorkerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Connecting,
    Ready,
    Executing,
    Terminated,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Terminated | SessionState::Error)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Terminated => "terminated",
            SessionState::Error => "error",
        };
        write!(f, "{}", s)
    }
}

/// Per-session settings, read once at creation
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub dsn: String,
    pub max_rows: Option<usize>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            dsn: ":memory:".to_string(),
            max_rows: None,
        }
    }
}

/// Issues EXECUTE on the transport and tracks ready/executing
struct TransportExecutor {
    key: String,
    transport: Arc<WorkerTransport>,
    state: Arc<watch::Sender<SessionState>>,
    max_rows: Option<usize>,
}

#[async_trait]
impl StatementExecutor for TransportExecutor {
    async fn execute(&self, sql: &str, result_handle: &str) -> Result<ExecuteResult> {
        self.state.send_if_modified(|state| {
            if *state == SessionState::Ready {
                *state = SessionState::Executing;
                true
            } else {
                false
            }
        });

        let started = Instant::now();
        let reply = self
            .transport
            .send(Command::Execute {
                sql: sql.to_string(),
                result_set_id: result_handle.to_string(),
                max_rows: self.max_rows,
            })
            .await;

        self.state.send_if_modified(|state| {
            if *state == SessionState::Executing {
                *state = SessionState::Ready;
                true
            } else {
                false
            }
        });

        let mut result = match reply? {
            WorkerEvent::ExecuteResult(result) => result,
            other => {
                return Err(SqlRunError::Protocol(format!(
                    "expected EXECUTE_RESULT, got {}",
                    other.kind()
                )))
            }
        };
        if result.result_set_id.is_empty() {
            result.result_set_id = result_handle.to_string();
        }
        debug!(
            session = %self.key,
            result_handle = %result_handle,
            success = result.success,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Statement settled"
        );
        Ok(result)
    }
}

/// One worker plus its queue, bound to a file key
pub struct Session {
    key: String,
    state: Arc<watch::Sender<SessionState>>,
    transport: Arc<WorkerTransport>,
    queue: QueryQueue<TransportExecutor>,
    monitor: JoinHandle<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Launch and connect a worker.
    ///
    /// Resolves only after READY and a successful CONNECT; a failure leaves
    /// no worker behind.
    pub async fn open(
        key: &str,
        launcher: &dyn WorkerLauncher,
        options: &SessionOptions,
    ) -> Result<Self> {
        let state = Arc::new(watch::channel(SessionState::Connecting).0);
        info!(session = %key, "Opening session");

        let (transport, _) = match WorkerTransport::start(launcher, key, &options.dsn).await {
            Ok(started) => started,
            Err(e) => {
                state.send_replace(SessionState::Error);
                warn!(session = %key, error = %e, "Session failed to connect");
                return Err(e);
            }
        };
        let transport = Arc::new(transport);
        state.send_replace(SessionState::Ready);

        let queue = QueryQueue::new(
            key,
            TransportExecutor {
                key: key.to_string(),
                transport: transport.clone(),
                state: state.clone(),
                max_rows: options.max_rows,
            },
        );

        let monitor = tokio::spawn(watch_transport(
            key.to_string(),
            transport.clone(),
            state.clone(),
            queue.clone(),
        ));

        info!(session = %key, pid = ?transport.pid(), "Session ready");
        Ok(Self {
            key: key.to_string(),
            state,
            transport,
            queue,
            monitor,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.transport.pid()
    }

    /// Usable for new work
    pub fn is_healthy(&self) -> bool {
        !self.state().is_terminal() && !self.transport.is_closed()
    }

    /// Queue a statement behind anything already submitted.
    ///
    /// `on_started` fires when the statement is dequeued and sent.
    pub async fn execute(
        &self,
        sql: &str,
        result_handle: &str,
        on_started: OnStarted,
    ) -> Result<ExecuteResult> {
        self.queue.execute(sql, result_handle, on_started).await
    }

    /// Queue a run's statements as one contiguous batch. Statements
    /// submitted afterwards, by any caller, start only after the batch;
    /// a failure cancels the batch's statements that have not started.
    pub fn submit_batch(&self, statements: Vec<BatchEntry>) -> Vec<Completion> {
        self.queue.enqueue_batch(statements)
    }

    /// Drop statements that have not started yet
    pub fn cancel_pending(&self, result_handles: &HashSet<String>) -> usize {
        self.queue.cancel_pending(result_handles)
    }

    /// Ask the worker to check or re-establish its connection, keeping the
    /// process and its state.
    ///
    /// Refused with `Busy` while statements are queued or running, so the
    /// connection never changes under a statement.
    pub async fn reconnect(&self) -> Result<ReconnectResult> {
        if let Some(reason) = self.terminal_error() {
            return Err(reason);
        }
        let Some(_claim) = self.queue.try_claim() else {
            return Err(SqlRunError::Busy(
                "wait for running statements to finish before reconnecting".to_string(),
            ));
        };
        match self.transport.send(Command::Reconnect).await? {
            WorkerEvent::ReconnectResult(result) if result.success => {
                info!(
                    session = %self.key,
                    message = result.message.as_deref().unwrap_or(""),
                    "Session reconnected"
                );
                Ok(result)
            }
            WorkerEvent::ReconnectResult(result) => Err(SqlRunError::Connection(
                result
                    .error
                    .unwrap_or_else(|| "reconnect failed".to_string()),
            )),
            other => Err(SqlRunError::Protocol(format!(
                "expected RECONNECT_RESULT, got {}",
                other.kind()
            ))),
        }
    }

    /// Kill the worker. Pending statements fail with `QueryCancelled`, the
    /// running one with `SessionTerminated`, and all worker-side state such
    /// as temp tables is gone.
    pub fn cancel(&self) {
        let pending = self.queue.close(SqlRunError::SessionTerminated);
        self.state.send_replace(SessionState::Terminated);
        self.transport.kill();
        warn!(
            session = %self.key,
            cancelled_pending = pending,
            "Session cancelled; worker state discarded"
        );
    }

    /// Orderly teardown: CLOSE the worker when it is idle, then kill it
    pub async fn close(&self) {
        self.queue.close(SqlRunError::SessionTerminated);
        // Terminal before CLOSE so the worker's exit is not reported as a failure
        self.state.send_replace(SessionState::Terminated);
        if self.transport.is_closed() {
            return;
        }
        if self.queue.in_flight().is_none() {
            match self.transport.send(Command::Close).await {
                Ok(_) => debug!(session = %self.key, "Worker acknowledged CLOSE"),
                Err(e) => debug!(session = %self.key, error = %e, "CLOSE not acknowledged"),
            }
        }
        self.transport.kill();
        info!(session = %self.key, "Session closed");
    }

    fn terminal_error(&self) -> Option<SqlRunError> {
        match self.state() {
            SessionState::Terminated => Some(SqlRunError::SessionTerminated),
            SessionState::Error => Some(
                self.transport
                    .close_reason()
                    .unwrap_or(SqlRunError::SessionTerminated),
            ),
            _ => None,
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.monitor.abort();
        if !self.transport.is_closed() {
            self.transport.kill();
        }
    }
}

/// Moves the session to `Error` if the worker goes away on its own
async fn watch_transport(
    key: String,
    transport: Arc<WorkerTransport>,
    state: Arc<watch::Sender<SessionState>>,
    queue: QueryQueue<TransportExecutor>,
) {
    let reason = transport.closed().await;
    let failed = state.send_if_modified(|state| {
        if state.is_terminal() {
            false
        } else {
            *state = SessionState::Error;
            true
        }
    });
    if failed {
        queue.close(reason.clone());
        warn!(session = %key, reason = %reason, "Worker lost; session unusable");
    }
}
