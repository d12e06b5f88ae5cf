//! Worker transport
//!
//! Owns the pipes of one worker process. A reader task deframes stdout into
//! `WorkerEvent`s and routes each to whoever is waiting on that response
//! kind; a second task re-logs stderr. Writes go through a single async
//! mutex so lines are never interleaved.
//!
//! Correlation is by response kind, so at most one command of each kind may
//! be outstanding. Callers (the query queue) are responsible for that; a
//! second concurrent command of the same kind is refused rather than
//! risking a mis-routed reply.

use parking_lot::Mutex;
use sqlrun_common::{
    Command, ConnectResult, LineDecoder, ResponseKind, Result, SqlRunError, WorkerEvent,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, info, warn};

use crate::launcher::{BoxedReader, BoxedWriter, WorkerHandle, WorkerIo, WorkerLauncher};

const READ_CHUNK: usize = 8 * 1024;
const EVENT_BUFFER: usize = 64;

type Waiter = oneshot::Sender<Result<WorkerEvent>>;

#[derive(Default)]
struct Pending {
    waiters: HashMap<ResponseKind, Waiter>,
    /// Set once; every later call fails with this
    closed: Option<SqlRunError>,
}

struct Shared {
    label: String,
    pending: Mutex<Pending>,
    ready: watch::Sender<bool>,
    closed: watch::Sender<Option<SqlRunError>>,
    events: broadcast::Sender<WorkerEvent>,
    handle: Mutex<Box<dyn WorkerHandle>>,
    writer: tokio::sync::Mutex<BoxedWriter>,
}

impl Shared {
    fn dispatch(&self, event: WorkerEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event.clone());

        match event {
            WorkerEvent::Ready => {
                debug!(session = %self.label, "Worker ready");
                self.ready.send_replace(true);
            }
            WorkerEvent::Error(payload) => {
                let message = WorkerEvent::error_text(&payload);
                let waiters: Vec<Waiter> = {
                    let mut pending = self.pending.lock();
                    pending.waiters.drain().map(|(_, tx)| tx).collect()
                };
                warn!(
                    session = %self.label,
                    rejected = waiters.len(),
                    error = %message,
                    "Worker reported an error"
                );
                for tx in waiters {
                    let _ = tx.send(Err(SqlRunError::Worker(message.clone())));
                }
            }
            event => {
                let Some(kind) = event.response_kind() else {
                    return;
                };
                let waiter = self.pending.lock().waiters.remove(&kind);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(Ok(event));
                    }
                    None => warn!(session = %self.label, %kind, "Dropping unsolicited response"),
                }
            }
        }
    }

    /// Mark the transport dead and reject everything outstanding.
    ///
    /// The first reason wins; later calls only log.
    fn close(&self, reason: SqlRunError) {
        let waiters: Vec<Waiter> = {
            let mut pending = self.pending.lock();
            if pending.closed.is_some() {
                return;
            }
            pending.closed = Some(reason.clone());
            pending.waiters.drain().map(|(_, tx)| tx).collect()
        };
        info!(
            session = %self.label,
            reason = %reason,
            rejected = waiters.len(),
            "Worker transport closed"
        );
        for tx in waiters {
            let _ = tx.send(Err(reason.clone()));
        }
        self.closed.send_replace(Some(reason));
    }

    fn close_reason(&self) -> Option<SqlRunError> {
        self.pending.lock().closed.clone()
    }
}

/// Line-delimited JSON channel to one worker process
pub struct WorkerTransport {
    shared: Arc<Shared>,
    pid: Option<u32>,
}

impl WorkerTransport {
    /// Launch a worker, wait for READY and perform the initial CONNECT.
    ///
    /// Any failure is reported as a connection error and the worker is
    /// killed before returning.
    pub async fn start(
        launcher: &dyn WorkerLauncher,
        label: &str,
        dsn: &str,
    ) -> Result<(Self, ConnectResult)> {
        let io = launcher.launch().await.map_err(|e| match e {
            SqlRunError::Connection(_) => e,
            other => SqlRunError::Connection(other.to_string()),
        })?;
        let transport = Self::attach(io, label);
        match transport.handshake(dsn).await {
            Ok(connected) => Ok((transport, connected)),
            Err(e) => {
                transport.kill();
                Err(e)
            }
        }
    }

    /// Wrap already-launched pipes and start the reader tasks
    pub fn attach(io: WorkerIo, label: &str) -> Self {
        let WorkerIo {
            stdin,
            stdout,
            stderr,
            handle,
        } = io;
        let pid = handle.id();
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let shared = Arc::new(Shared {
            label: label.to_string(),
            pending: Mutex::new(Pending::default()),
            ready: watch::channel(false).0,
            closed: watch::channel(None).0,
            events,
            handle: Mutex::new(handle),
            writer: tokio::sync::Mutex::new(stdin),
        });

        tokio::spawn(read_loop(shared.clone(), stdout));
        if let Some(stderr) = stderr {
            tokio::spawn(log_stderr(label.to_string(), pid, stderr));
        }

        Self { shared, pid }
    }

    /// Wait for READY, then send CONNECT
    pub async fn handshake(&self, dsn: &str) -> Result<ConnectResult> {
        let mut ready = self.shared.ready.subscribe();
        tokio::select! {
            res = async { ready.wait_for(|r| *r).await.map(|_| ()) } => {
                res.map_err(|_| SqlRunError::Connection("worker dropped before READY".into()))?;
            }
            reason = self.closed() => {
                return Err(SqlRunError::Connection(format!(
                    "worker exited before READY: {}",
                    reason
                )));
            }
        }

        match self.send(Command::Connect { dsn: dsn.to_string() }).await {
            Ok(WorkerEvent::ConnectResult(result)) if result.success => {
                info!(
                    session = %self.shared.label,
                    pid = ?self.pid,
                    message = result.message.as_deref().unwrap_or(""),
                    "Worker connected"
                );
                Ok(result)
            }
            Ok(WorkerEvent::ConnectResult(result)) => Err(SqlRunError::Connection(
                result
                    .error
                    .unwrap_or_else(|| "CONNECT was refused".to_string()),
            )),
            Ok(other) => Err(SqlRunError::Protocol(format!(
                "expected CONNECT_RESULT, got {}",
                other.kind()
            ))),
            Err(SqlRunError::Connection(msg)) => Err(SqlRunError::Connection(msg)),
            Err(e) => Err(SqlRunError::Connection(e.to_string())),
        }
    }

    /// Send a command and wait for the event that answers it.
    ///
    /// Fails with the worker's message if an ERROR event arrives first, or
    /// with the close reason if the worker dies or is killed meanwhile.
    ///
    /// Dropping the returned future leaves the slot registered until the
    /// worker answers, so the late reply is consumed instead of being
    /// handed to the next caller. Until then, another command of the same
    /// kind is refused with `Protocol`. The query queue always awaits its
    /// sends to completion.
    pub async fn send(&self, command: Command) -> Result<WorkerEvent> {
        let kind = command.response_kind();
        let line = command.to_line()?;

        let rx = {
            let mut pending = self.shared.pending.lock();
            if let Some(reason) = &pending.closed {
                return Err(reason.clone());
            }
            if pending.waiters.contains_key(&kind) {
                return Err(SqlRunError::Protocol(format!(
                    "a command awaiting {} is already outstanding",
                    kind
                )));
            }
            let (tx, rx) = oneshot::channel();
            pending.waiters.insert(kind, tx);
            rx
        };

        debug!(session = %self.shared.label, command = command.kind(), "Sending command");
        if let Err(e) = self.write_line(&line).await {
            self.shared.pending.lock().waiters.remove(&kind);
            return Err(self
                .shared
                .close_reason()
                .unwrap_or_else(|| SqlRunError::WorkerExited(format!("write failed: {}", e))));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(self
                .shared
                .close_reason()
                .unwrap_or(SqlRunError::SessionTerminated)),
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut writer = self.shared.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    /// Stream of every decoded event, including READY and ERROR
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Kill the worker; anything awaiting a response fails with
    /// `SessionTerminated`
    pub fn kill(&self) {
        self.shared.close(SqlRunError::SessionTerminated);
        self.shared.handle.lock().kill();
    }

    /// Resolves once the transport is closed, with the reason
    pub async fn closed(&self) -> SqlRunError {
        let mut rx = self.shared.closed.subscribe();
        let reason = rx
            .wait_for(|r| r.is_some())
            .await
            .ok()
            .and_then(|r| r.clone());
        reason.unwrap_or(SqlRunError::SessionTerminated)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close_reason().is_some()
    }

    pub fn close_reason(&self) -> Option<SqlRunError> {
        self.shared.close_reason()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }
}

impl Drop for WorkerTransport {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.kill();
        }
    }
}

async fn read_loop(shared: Arc<Shared>, mut stdout: BoxedReader) {
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => {
                if decoder.pending_bytes() > 0 {
                    warn!(
                        session = %shared.label,
                        bytes = decoder.pending_bytes(),
                        "Discarding unterminated output"
                    );
                }
                shared.close(SqlRunError::WorkerExited(
                    "worker closed its output".to_string(),
                ));
                return;
            }
            Ok(n) => {
                for decoded in decoder.push(&buf[..n]) {
                    match decoded {
                        Ok(event) => shared.dispatch(event),
                        Err(e) => warn!(session = %shared.label, error = %e, "Dropping malformed line"),
                    }
                }
            }
            Err(e) => {
                shared.close(SqlRunError::WorkerExited(format!("read failed: {}", e)));
                return;
            }
        }
    }
}

async fn log_stderr(label: String, pid: Option<u32>, stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "sqlrun::worker", session = %label, pid = ?pid, "{}", line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLauncher, FakeWorkerConfig};
    use std::time::Duration;

    fn execute(sql: &str, id: &str) -> Command {
        Command::Execute {
            sql: sql.into(),
            result_set_id: id.into(),
            max_rows: None,
        }
    }

    #[tokio::test]
    async fn test_start_performs_handshake() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (transport, connected) = WorkerTransport::start(&launcher, "a.sql", "Hermes")
            .await
            .unwrap();
        assert!(connected.success);
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(launcher.commands(0), vec!["CONNECT"]);
        assert!(!transport.is_closed());
    }

    #[tokio::test]
    async fn test_connect_failure_kills_worker() {
        let launcher = FakeLauncher::new(FakeWorkerConfig {
            connect_error: Some("Data source name not found".into()),
            ..Default::default()
        });
        let err = match WorkerTransport::start(&launcher, "a.sql", "nope").await {
            Ok(_) => panic!("connect should fail"),
            Err(e) => e,
        };
        assert_eq!(err, SqlRunError::Connection("Data source name not found".into()));
        assert_eq!(launcher.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_exit_before_ready_is_connection_error() {
        let launcher = FakeLauncher::new(FakeWorkerConfig {
            exit_before_ready: true,
            ..Default::default()
        });
        let err = match WorkerTransport::start(&launcher, "a.sql", "dsn").await {
            Ok(_) => panic!("start should fail"),
            Err(e) => e,
        };
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert!(err.to_string().contains("before READY"));
    }

    #[tokio::test]
    async fn test_malformed_line_is_dropped() {
        let launcher = FakeLauncher::new(FakeWorkerConfig {
            garbage_before_results: true,
            ..Default::default()
        });
        let (transport, _) = WorkerTransport::start(&launcher, "a.sql", "dsn").await.unwrap();
        let mut events = transport.subscribe();

        let reply = transport.send(execute("SELECT 1", "r0")).await.unwrap();
        assert!(matches!(reply, WorkerEvent::ExecuteResult(ref r) if r.success));
        // Only the valid line after the garbage reaches subscribers
        assert!(matches!(events.recv().await.unwrap(), WorkerEvent::ExecuteResult(_)));

        let reply = transport.send(execute("SELECT 2", "r1")).await.unwrap();
        assert!(matches!(reply, WorkerEvent::ExecuteResult(ref r) if r.result_set_id == "r1"));
    }

    #[tokio::test]
    async fn test_error_event_rejects_pending_call() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (transport, _) = WorkerTransport::start(&launcher, "a.sql", "dsn").await.unwrap();

        let err = transport.send(execute("FAKE_ERROR_EVENT", "r0")).await.unwrap_err();
        assert_eq!(err, SqlRunError::Worker("simulated worker failure".into()));

        // The transport stays usable
        assert!(transport.send(execute("SELECT 1", "r1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_worker_exit_rejects_pending_call() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (transport, _) = WorkerTransport::start(&launcher, "a.sql", "dsn").await.unwrap();

        let err = transport.send(execute("FAKE_CRASH", "r0")).await.unwrap_err();
        assert!(matches!(err, SqlRunError::WorkerExited(_)));
        assert!(transport.is_closed());

        let err = transport.send(execute("SELECT 1", "r1")).await.unwrap_err();
        assert!(matches!(err, SqlRunError::WorkerExited(_)));
    }

    #[tokio::test]
    async fn test_kill_rejects_with_session_terminated() {
        let launcher = FakeLauncher::new(FakeWorkerConfig {
            execute_delay: Duration::from_secs(30),
            ..Default::default()
        });
        let (transport, _) = WorkerTransport::start(&launcher, "a.sql", "dsn").await.unwrap();
        let transport = Arc::new(transport);

        let call = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.send(execute("SELECT 1", "r0")).await })
        };
        launcher.wait_for_in_flight(1).await;
        transport.kill();

        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err, SqlRunError::SessionTerminated);
        assert_eq!(transport.closed().await, SqlRunError::SessionTerminated);
        assert_eq!(launcher.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_send_blocks_kind_until_reply() {
        let launcher = FakeLauncher::new(FakeWorkerConfig {
            execute_delay: Duration::from_millis(100),
            ..Default::default()
        });
        let (transport, _) = WorkerTransport::start(&launcher, "a.sql", "dsn").await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), transport.send(execute("SELECT 1", "r0")))
                .await;
        assert!(abandoned.is_err());

        let err = transport.send(execute("SELECT 2", "r1")).await.unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");

        // Once the late reply is consumed the slot frees up, and it is not
        // mistaken for the answer to the next command
        tokio::time::sleep(Duration::from_millis(250)).await;
        let reply = transport.send(execute("SELECT 3", "r2")).await.unwrap();
        assert!(matches!(reply, WorkerEvent::ExecuteResult(ref r) if r.result_set_id == "r2"));
        assert_eq!(launcher.executed_sql(), vec!["SELECT 1", "SELECT 3"]);
    }

    #[tokio::test]
    async fn test_same_kind_concurrency_is_refused() {
        let launcher = FakeLauncher::new(FakeWorkerConfig {
            execute_delay: Duration::from_millis(200),
            ..Default::default()
        });
        let (transport, _) = WorkerTransport::start(&launcher, "a.sql", "dsn").await.unwrap();
        let transport = Arc::new(transport);

        let first = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.send(execute("SELECT 1", "r0")).await })
        };
        launcher.wait_for_in_flight(1).await;

        let err = transport.send(execute("SELECT 2", "r1")).await.unwrap_err();
        assert_eq!(err.code(), "PROTOCOL_ERROR");
        assert!(first.await.unwrap().is_ok());
    }
}
