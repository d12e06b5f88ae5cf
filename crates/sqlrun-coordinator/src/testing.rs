//! In-process fake worker for tests
//!
//! Speaks the real line protocol over `tokio::io::duplex`. Each launched
//! instance keeps its own temp-table map, so tests can tell whether two
//! statements ran against the same worker.
//!
//! SQL markers understood by the fake:
//! - `CREATE TEMP TABLE <name> AS SELECT <n>`: stores `n` under `name`
//! - `SELECT * FROM <name>`: one row `{col: n}` or a missing-table failure
//! - `FAIL`: `success:false` with structured details
//! - `WAIT_GATE`: blocks until the test calls `open_gate`
//! - `SLEEP <ms>`: delays the reply
//! - `FAKE_ERROR_EVENT`: answers with an ERROR event
//! - `FAKE_CRASH`: exits without answering

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use sqlrun_common::{
    CloseResult, ColumnInfo, Command, ConnectResult, ErrorDetails, ExecuteResult,
    ReconnectResult, Result, Row, SqlRunError, WorkerEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::AbortHandle;

use crate::launcher::{WorkerHandle, WorkerIo, WorkerLauncher};

#[derive(Debug, Clone, Default)]
pub struct FakeWorkerConfig {
    pub connect_error: Option<String>,
    pub connect_delay: Duration,
    pub execute_delay: Duration,
    pub exit_before_ready: bool,
    pub garbage_before_results: bool,
    pub fail_spawn: bool,
}

struct FakeState {
    spawns: AtomicUsize,
    kills: AtomicUsize,
    commands: Mutex<Vec<Vec<String>>>,
    executed: Mutex<Vec<(usize, String)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    gate: Semaphore,
}

/// Launcher producing fake workers and recording what they saw
#[derive(Clone)]
pub struct FakeLauncher {
    config: Arc<Mutex<FakeWorkerConfig>>,
    state: Arc<FakeState>,
}

impl FakeLauncher {
    pub fn new(config: FakeWorkerConfig) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
            state: Arc::new(FakeState {
                spawns: AtomicUsize::new(0),
                kills: AtomicUsize::new(0),
                commands: Mutex::new(Vec::new()),
                executed: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                gate: Semaphore::new(0),
            }),
        }
    }

    /// Change behaviour for workers launched from now on
    pub fn reconfigure(&self, config: FakeWorkerConfig) {
        *self.config.lock() = config;
    }

    pub fn spawn_count(&self) -> usize {
        self.state.spawns.load(Ordering::SeqCst)
    }

    pub fn kill_count(&self) -> usize {
        self.state.kills.load(Ordering::SeqCst)
    }

    /// Command kinds received by worker instance `index`
    pub fn commands(&self, index: usize) -> Vec<String> {
        self.state
            .commands
            .lock()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// SQL of every EXECUTE in arrival order, with the instance index
    pub fn executed(&self) -> Vec<(usize, String)> {
        self.state.executed.lock().clone()
    }

    pub fn executed_sql(&self) -> Vec<String> {
        self.executed().into_iter().map(|(_, sql)| sql).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.max_in_flight.load(Ordering::SeqCst)
    }

    /// Release `n` statements blocked on `WAIT_GATE`
    pub fn open_gate(&self, n: usize) {
        self.state.gate.add_permits(n);
    }

    pub async fn wait_for_in_flight(&self, n: usize) {
        self.wait_until(|| self.state.in_flight.load(Ordering::SeqCst) >= n)
            .await
    }

    pub async fn wait_for_executed(&self, n: usize) {
        self.wait_until(|| self.state.executed.lock().len() >= n).await
    }

    async fn wait_until(&self, condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("fake worker condition not reached");
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self) -> Result<WorkerIo> {
        let config = self.config.lock().clone();
        if config.fail_spawn {
            return Err(SqlRunError::Connection("failed to spawn worker: fake".into()));
        }
        let index = self.state.spawns.fetch_add(1, Ordering::SeqCst);
        self.state.commands.lock().push(Vec::new());

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client);
        let task = tokio::spawn(run_fake(index, config, self.state.clone(), server));

        Ok(WorkerIo {
            stdin: Box::new(client_write),
            stdout: Box::new(client_read),
            stderr: None,
            handle: Box::new(FakeHandle {
                abort: task.abort_handle(),
                state: self.state.clone(),
                killed: false,
            }),
        })
    }
}

struct FakeHandle {
    abort: AbortHandle,
    state: Arc<FakeState>,
    killed: bool,
}

impl WorkerHandle for FakeHandle {
    fn kill(&mut self) {
        if !self.killed {
            self.killed = true;
            self.state.kills.fetch_add(1, Ordering::SeqCst);
            self.abort.abort();
        }
    }

    fn id(&self) -> Option<u32> {
        None
    }
}

/// Counts an EXECUTE as in flight until dropped, including on abort
struct InFlight<'a>(&'a FakeState);

impl<'a> InFlight<'a> {
    fn enter(state: &'a FakeState) -> Self {
        let now = state.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        state.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(state)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, event: WorkerEvent) {
    let line = event.to_line().unwrap();
    let _ = writer.write_all(line.as_bytes()).await;
    let _ = writer.flush().await;
}

async fn run_fake(
    index: usize,
    config: FakeWorkerConfig,
    state: Arc<FakeState>,
    stream: tokio::io::DuplexStream,
) {
    if config.exit_before_ready {
        return;
    }
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    let mut tables: HashMap<String, i64> = HashMap::new();
    let mut connected = false;

    send(&mut write, WorkerEvent::Ready).await;

    while let Ok(Some(line)) = lines.next_line().await {
        let command = match Command::decode(&line) {
            Ok(command) => command,
            Err(e) => {
                send(&mut write, WorkerEvent::Error(json!({ "error": e.to_string() }))).await;
                continue;
            }
        };
        if let Some(log) = state.commands.lock().get_mut(index) {
            log.push(command.kind().to_string());
        }

        match command {
            Command::Connect { .. } => {
                tokio::time::sleep(config.connect_delay).await;
                let result = match &config.connect_error {
                    Some(error) => ConnectResult {
                        success: false,
                        error: Some(error.clone()),
                        ..Default::default()
                    },
                    None => {
                        connected = true;
                        ConnectResult {
                            success: true,
                            message: Some("Connected to fake".into()),
                            ..Default::default()
                        }
                    }
                };
                send(&mut write, WorkerEvent::ConnectResult(result)).await;
            }
            Command::Execute {
                sql, result_set_id, ..
            } => {
                state.executed.lock().push((index, sql.clone()));
                let in_flight = InFlight::enter(&state);

                tokio::time::sleep(config.execute_delay).await;
                if let Some(ms) = sleep_marker(&sql) {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                }
                if sql.contains("WAIT_GATE") {
                    if let Ok(permit) = state.gate.acquire().await {
                        permit.forget();
                    }
                }
                if sql.contains("FAKE_CRASH") {
                    return;
                }

                let event = if sql.contains("FAKE_ERROR_EVENT") {
                    WorkerEvent::Error(json!({ "error": "simulated worker failure" }))
                } else if !connected {
                    WorkerEvent::ExecuteResult(ExecuteResult::failure(&result_set_id, "Not connected"))
                } else {
                    WorkerEvent::ExecuteResult(execute(&sql, &result_set_id, &mut tables))
                };

                drop(in_flight);
                if config.garbage_before_results {
                    let _ = write.write_all(b"this is not json\n").await;
                }
                send(&mut write, event).await;
            }
            Command::Reconnect => {
                send(
                    &mut write,
                    WorkerEvent::ReconnectResult(ReconnectResult {
                        success: true,
                        message: Some("Connection is alive".into()),
                        error: None,
                    }),
                )
                .await;
            }
            Command::Close => {
                send(&mut write, WorkerEvent::CloseResult(CloseResult { success: true })).await;
                return;
            }
        }
    }
}

fn sleep_marker(sql: &str) -> Option<u64> {
    let rest = &sql[sql.find("SLEEP ")? + 6..];
    rest.split_whitespace().next()?.parse().ok()
}

fn execute(sql: &str, result_set_id: &str, tables: &mut HashMap<String, i64>) -> ExecuteResult {
    let words: Vec<&str> = sql.split_whitespace().collect();
    let upper: Vec<String> = words.iter().map(|w| w.to_uppercase()).collect();

    if sql.contains("FAIL") {
        let mut result = ExecuteResult::failure(result_set_id, "Parser Error: syntax error at or near \"FAIL\"");
        result.error_type = Some("syntax_error".into());
        result.error_details = Some(ErrorDetails {
            line: Some(1),
            position: Some(1),
            sql_snippet: Some(sql.to_string()),
            ..Default::default()
        });
        return result;
    }

    if words.len() >= 7 && upper[0] == "CREATE" && upper[1] == "TEMP" && upper[2] == "TABLE" {
        let value = words[6].trim_end_matches(';').parse().unwrap_or(0);
        tables.insert(words[3].to_string(), value);
        return ExecuteResult::statement_done(result_set_id, 1);
    }

    if words.len() >= 4 && upper[0] == "SELECT" && upper[1] == "*" && upper[2] == "FROM" {
        let name = words[3].trim_end_matches(';');
        return match tables.get(name) {
            Some(value) => {
                let mut row = Row::new();
                row.insert("col".into(), json!(value));
                ExecuteResult::with_rows(result_set_id, vec![ColumnInfo::new("col", "number")], vec![row])
            }
            None => ExecuteResult::failure(
                result_set_id,
                format!("Catalog Error: Table with name {} does not exist!", name),
            ),
        };
    }

    if upper.first().map(|w| w == "SELECT").unwrap_or(false) {
        let mut row = Row::new();
        row.insert("value".into(), json!(1));
        return ExecuteResult::with_rows(result_set_id, vec![ColumnInfo::new("value", "number")], vec![row]);
    }

    ExecuteResult::statement_done(result_set_id, 0)
}
