//! Run coordination
//!
//! A run is one user-triggered execution of an ordered list of statements
//! against one file's session. The whole run is queued on the session as
//! one batch, so another run on the same file cannot slip in between its
//! statements; the first failure cancels the rest of the run. Every
//! statement receives exactly one terminal event, delivered on the outward
//! `RunEvent` channel.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use sqlrun_common::{
    ColumnInfo, ErrorDetails, ExecuteResult, ReconnectResult, Result, Row, SqlRunError,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::queue::{BatchEntry, OnSettled, OnStarted};
use crate::registry::SessionRegistry;
use crate::splitter::ParsedStatement;

pub type RunId = String;

/// Why a statement never ran to completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// An earlier statement of the run failed
    BatchAborted,
    /// The user cancelled the run
    RunCancelled,
    /// No session could be obtained
    SessionUnavailable,
}

/// Single-row result reported for statements that return no rows
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageResult {
    pub columns: Vec<ColumnInfo>,
    pub rows: Vec<Row>,
}

impl MessageResult {
    pub fn new(message: &str) -> Self {
        let mut row = Row::new();
        row.insert("message".to_string(), serde_json::Value::from(message));
        Self {
            columns: vec![ColumnInfo::new("message", "string")],
            rows: vec![row],
        }
    }
}

/// Outward lifecycle events for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        file_key: String,
        statement_count: usize,
    },
    ResultPending {
        run_id: RunId,
        result_handle: String,
        statement_index: usize,
        sql: String,
    },
    ResultStarted {
        run_id: RunId,
        result_handle: String,
        statement_index: usize,
    },
    ResultSchema {
        run_id: RunId,
        result_handle: String,
        columns: Vec<ColumnInfo>,
    },
    ResultRows {
        run_id: RunId,
        result_handle: String,
        rows: Vec<Row>,
        truncated: bool,
    },
    ResultComplete {
        run_id: RunId,
        result_handle: String,
        statement_index: usize,
        row_count: Option<u64>,
        execution_time_ms: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<MessageResult>,
    },
    ResultError {
        run_id: RunId,
        result_handle: String,
        statement_index: usize,
        message: String,
        error_type: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        details: Option<ErrorDetails>,
    },
    ResultCancelled {
        run_id: RunId,
        result_handle: String,
        statement_index: usize,
        reason: CancelReason,
    },
    RunComplete {
        run_id: RunId,
        succeeded: usize,
        failed: usize,
        cancelled: usize,
    },
    RunError {
        run_id: RunId,
        message: String,
        code: String,
    },
    RunCancelled {
        run_id: RunId,
        session_state_lost: bool,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &str {
        match self {
            RunEvent::RunStarted { run_id, .. }
            | RunEvent::ResultPending { run_id, .. }
            | RunEvent::ResultStarted { run_id, .. }
            | RunEvent::ResultSchema { run_id, .. }
            | RunEvent::ResultRows { run_id, .. }
            | RunEvent::ResultComplete { run_id, .. }
            | RunEvent::ResultError { run_id, .. }
            | RunEvent::ResultCancelled { run_id, .. }
            | RunEvent::RunComplete { run_id, .. }
            | RunEvent::RunError { run_id, .. }
            | RunEvent::RunCancelled { run_id, .. } => run_id,
        }
    }

    /// Whether this event ends the run
    pub fn is_run_terminal(&self) -> bool {
        matches!(
            self,
            RunEvent::RunComplete { .. } | RunEvent::RunError { .. } | RunEvent::RunCancelled { .. }
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Every statement succeeded
    Completed,
    /// A statement failed and the rest were skipped
    Failed,
    /// Cancelled by the user
    Cancelled,
    /// No session could be obtained
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: RunId,
    pub status: RunStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

// ═══════════════════════════════════════════════════════════════════════════
// PER-RUN BOOKKEEPING
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct TrackerState {
    /// Statements without a terminal event yet, by position in the run
    outstanding: BTreeMap<usize, (String, usize)>,
    cancelled: bool,
    aborted: bool,
    unavailable: bool,
    finished: bool,
    succeeded: usize,
    failed: usize,
    skipped: usize,
}

/// Outstanding statements of one run. Events are sent while holding the
/// lock, so a statement's terminal event is emitted exactly once and never
/// after `RunCancelled`.
struct RunTracker {
    run_id: RunId,
    file_key: String,
    events: mpsc::UnboundedSender<RunEvent>,
    state: Mutex<TrackerState>,
}

impl RunTracker {
    fn emit(&self, event: RunEvent) {
        // A closed presenter is not a reason to stop executing
        let _ = self.events.send(event);
    }

    fn handle(&self, statement: &ParsedStatement) -> String {
        format!("{}:{}", self.run_id, statement.statement_index)
    }

    fn begin(&self, statements: &[ParsedStatement]) {
        let mut state = self.state.lock();
        self.emit(RunEvent::RunStarted {
            run_id: self.run_id.clone(),
            file_key: self.file_key.clone(),
            statement_count: statements.len(),
        });
        for (position, statement) in statements.iter().enumerate() {
            let handle = self.handle(statement);
            self.emit(RunEvent::ResultPending {
                run_id: self.run_id.clone(),
                result_handle: handle.clone(),
                statement_index: statement.statement_index,
                sql: statement.sql.clone(),
            });
            state
                .outstanding
                .insert(position, (handle, statement.statement_index));
        }
    }

    /// Queue entry whose hooks report back to this run
    fn batch_entry(self: &Arc<Self>, position: usize, statement: &ParsedStatement) -> BatchEntry {
        let on_started: OnStarted = {
            let tracker = self.clone();
            Box::new(move || tracker.started(position))
        };
        let on_settled: OnSettled = {
            let tracker = self.clone();
            Box::new(move |outcome: &Result<ExecuteResult>| tracker.settle(position, outcome))
        };
        BatchEntry {
            sql: statement.sql.clone(),
            result_handle: self.handle(statement),
            on_started,
            on_settled,
        }
    }

    /// True once nothing more should be sent to the session
    fn should_stop(&self) -> bool {
        let state = self.state.lock();
        state.cancelled || state.aborted
    }

    fn started(&self, position: usize) {
        let state = self.state.lock();
        if state.cancelled {
            return;
        }
        if let Some((handle, index)) = state.outstanding.get(&position) {
            self.emit(RunEvent::ResultStarted {
                run_id: self.run_id.clone(),
                result_handle: handle.clone(),
                statement_index: *index,
            });
        }
    }

    /// Translate one statement's outcome into events. Later calls for the
    /// same statement are ignored.
    fn settle(&self, position: usize, outcome: &Result<ExecuteResult>) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        let Some((result_handle, statement_index)) = state.outstanding.remove(&position) else {
            return;
        };
        let run_id = self.run_id.clone();

        match outcome {
            Ok(result) if result.success => {
                state.succeeded += 1;
                if result.returns_rows() {
                    self.emit(RunEvent::ResultSchema {
                        run_id: run_id.clone(),
                        result_handle: result_handle.clone(),
                        columns: result.columns.clone().unwrap_or_default(),
                    });
                    let rows = result.rows.clone().unwrap_or_default();
                    let row_count = result.row_count.unwrap_or(rows.len() as u64);
                    self.emit(RunEvent::ResultRows {
                        run_id: run_id.clone(),
                        result_handle: result_handle.clone(),
                        rows,
                        truncated: result.truncated.unwrap_or(false),
                    });
                    self.emit(RunEvent::ResultComplete {
                        run_id,
                        result_handle,
                        statement_index,
                        row_count: Some(row_count),
                        execution_time_ms: result.execution_time_ms,
                        message: None,
                    });
                } else {
                    let text = result
                        .message
                        .clone()
                        .unwrap_or_else(|| "Query executed successfully".to_string());
                    self.emit(RunEvent::ResultComplete {
                        run_id,
                        result_handle,
                        statement_index,
                        row_count: result.row_count,
                        execution_time_ms: result.execution_time_ms,
                        message: Some(MessageResult::new(&text)),
                    });
                }
            }
            Ok(result) => {
                state.failed += 1;
                state.aborted = true;
                let message = result.error_message();
                warn!(
                    run_id = %run_id,
                    result_handle = %result_handle,
                    statement_index,
                    error = %message,
                    "Statement failed; aborting run"
                );
                self.emit(RunEvent::ResultError {
                    run_id,
                    result_handle,
                    statement_index,
                    message,
                    error_type: result.error_type.clone(),
                    details: result.error_details.clone().filter(|d| !d.is_empty()),
                });
            }
            Err(SqlRunError::QueryCancelled) => {
                state.skipped += 1;
                state.aborted = true;
                self.emit(RunEvent::ResultCancelled {
                    run_id,
                    result_handle,
                    statement_index,
                    reason: CancelReason::BatchAborted,
                });
            }
            Err(e) => {
                state.failed += 1;
                state.aborted = true;
                warn!(
                    run_id = %run_id,
                    result_handle = %result_handle,
                    statement_index,
                    error = %e,
                    "Statement did not complete; aborting run"
                );
                self.emit(RunEvent::ResultError {
                    run_id,
                    result_handle,
                    statement_index,
                    message: e.to_string(),
                    error_type: Some(e.code().to_string()),
                    details: None,
                });
            }
        }
    }

    /// Report every outstanding statement as cancelled
    fn cancel_outstanding(&self, state: &mut TrackerState, reason: CancelReason) {
        for (_, (result_handle, statement_index)) in std::mem::take(&mut state.outstanding) {
            state.skipped += 1;
            self.emit(RunEvent::ResultCancelled {
                run_id: self.run_id.clone(),
                result_handle,
                statement_index,
                reason,
            });
        }
    }

    /// No session: cancel everything and end the run with `RunError`
    fn fail(&self, error: &SqlRunError) {
        let mut state = self.state.lock();
        if state.cancelled {
            return;
        }
        state.unavailable = true;
        self.cancel_outstanding(&mut state, CancelReason::SessionUnavailable);
        self.emit(RunEvent::RunError {
            run_id: self.run_id.clone(),
            message: error.to_string(),
            code: error.code().to_string(),
        });
    }

    /// First cancel wins; false if the run already ended
    fn mark_cancelled(&self) -> bool {
        let mut state = self.state.lock();
        if state.cancelled || state.finished {
            return false;
        }
        state.cancelled = true;
        true
    }

    fn announce_cancelled(&self) {
        let mut state = self.state.lock();
        self.cancel_outstanding(&mut state, CancelReason::RunCancelled);
        self.emit(RunEvent::RunCancelled {
            run_id: self.run_id.clone(),
            session_state_lost: true,
        });
    }

    fn finish(&self) -> RunSummary {
        let mut state = self.state.lock();
        state.finished = true;
        let status = if state.cancelled {
            RunStatus::Cancelled
        } else if state.unavailable {
            RunStatus::Error
        } else if state.failed > 0 || state.aborted {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        if matches!(status, RunStatus::Completed | RunStatus::Failed) {
            self.emit(RunEvent::RunComplete {
                run_id: self.run_id.clone(),
                succeeded: state.succeeded,
                failed: state.failed,
                cancelled: state.skipped,
            });
        }
        RunSummary {
            run_id: self.run_id.clone(),
            status,
            succeeded: state.succeeded,
            failed: state.failed,
            cancelled: state.skipped,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════

/// Turns user execute/cancel/reconnect intents into session calls and
/// lifecycle events
#[derive(Clone)]
pub struct RunCoordinator {
    registry: SessionRegistry,
    events: mpsc::UnboundedSender<RunEvent>,
    runs: Arc<DashMap<RunId, Arc<RunTracker>>>,
}

impl RunCoordinator {
    /// Create a coordinator and the receiving end of its event stream
    pub fn new(registry: SessionRegistry) -> (Self, mpsc::UnboundedReceiver<RunEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                registry,
                events,
                runs: Arc::new(DashMap::new()),
            },
            rx,
        )
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Start a run in the background; the id is usable for `cancel_run`
    /// immediately
    pub fn spawn_run(
        &self,
        file_key: &str,
        statements: Vec<ParsedStatement>,
    ) -> (RunId, JoinHandle<RunSummary>) {
        let tracker = self.track(file_key);
        let run_id = tracker.run_id.clone();
        let coordinator = self.clone();
        let task = tokio::spawn(async move { coordinator.drive(tracker, statements).await });
        (run_id, task)
    }

    /// Run to completion
    pub async fn execute_run(&self, file_key: &str, statements: Vec<ParsedStatement>) -> RunSummary {
        let tracker = self.track(file_key);
        self.drive(tracker, statements).await
    }

    /// Cancel a run destructively: its session's worker is killed and any
    /// temp tables are lost. Returns false for unknown or finished runs.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let Some(tracker) = self.runs.get(run_id).map(|entry| entry.value().clone()) else {
            return false;
        };
        if !tracker.mark_cancelled() {
            return false;
        }
        warn!(run_id = %run_id, session = %tracker.file_key, "Cancelling run; session state will be lost");
        self.registry.cancel(&tracker.file_key);
        tracker.announce_cancelled();
        true
    }

    /// Reconnect the file's session without discarding it
    pub async fn reconnect(&self, file_key: &str) -> Result<ReconnectResult> {
        self.registry.reconnect(file_key).await
    }

    /// Runs that have not finished yet
    pub fn active_runs(&self) -> Vec<RunId> {
        self.runs.iter().map(|entry| entry.key().clone()).collect()
    }

    fn track(&self, file_key: &str) -> Arc<RunTracker> {
        let tracker = Arc::new(RunTracker {
            run_id: Uuid::new_v4().to_string(),
            file_key: file_key.to_string(),
            events: self.events.clone(),
            state: Mutex::new(TrackerState::default()),
        });
        self.runs.insert(tracker.run_id.clone(), tracker.clone());
        tracker
    }

    async fn drive(&self, tracker: Arc<RunTracker>, statements: Vec<ParsedStatement>) -> RunSummary {
        info!(
            run_id = %tracker.run_id,
            session = %tracker.file_key,
            statements = statements.len(),
            "Run started"
        );
        tracker.begin(&statements);

        if !statements.is_empty() && !tracker.should_stop() {
            match self.registry.get_or_create(&tracker.file_key).await {
                Ok(session) => {
                    let batch: Vec<BatchEntry> = statements
                        .iter()
                        .enumerate()
                        .map(|(position, statement)| tracker.batch_entry(position, statement))
                        .collect();
                    debug!(
                        run_id = %tracker.run_id,
                        session = %tracker.file_key,
                        statements = batch.len(),
                        "Submitting run"
                    );
                    // Executed statements settle from the queue before the
                    // next one starts; this picks up the ones rejected
                    // without running
                    let completions = session.submit_batch(batch);
                    for (position, completion) in completions.into_iter().enumerate() {
                        let outcome = completion.wait().await;
                        tracker.settle(position, &outcome);
                    }
                }
                Err(e) => {
                    warn!(run_id = %tracker.run_id, session = %tracker.file_key, error = %e, "No session for run");
                    tracker.fail(&e);
                }
            }
        }

        let summary = tracker.finish();
        self.runs.remove(&tracker.run_id);
        info!(
            run_id = %summary.run_id,
            status = ?summary.status,
            succeeded = summary.succeeded,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "Run finished"
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionOptions;
    use crate::testing::{FakeLauncher, FakeWorkerConfig};
    use serde_json::json;

    fn coordinator(launcher: &FakeLauncher) -> (RunCoordinator, mpsc::UnboundedReceiver<RunEvent>) {
        let registry = SessionRegistry::new(
            Arc::new(launcher.clone()),
            SessionOptions::default(),
            12,
        );
        RunCoordinator::new(registry)
    }

    fn statements(sqls: &[&str]) -> Vec<ParsedStatement> {
        sqls.iter()
            .enumerate()
            .map(|(i, sql)| ParsedStatement {
                sql: sql.to_string(),
                statement_index: i,
                span: 0..sql.len(),
            })
            .collect()
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RunEvent>) -> Vec<RunEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn terminal_count(events: &[RunEvent], index: usize) -> usize {
        events
            .iter()
            .filter(|e| match e {
                RunEvent::ResultComplete { statement_index, .. }
                | RunEvent::ResultError { statement_index, .. }
                | RunEvent::ResultCancelled { statement_index, .. } => *statement_index == index,
                _ => false,
            })
            .count()
    }

    #[tokio::test]
    async fn test_temp_table_run() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, mut rx) = coordinator(&launcher);

        let summary = coordinator
            .execute_run(
                "a.sql",
                statements(&["CREATE TEMP TABLE t AS SELECT 1", "SELECT * FROM t"]),
            )
            .await;
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.succeeded, 2);

        let events = drain(&mut rx);
        let run_id = summary.run_id.clone();
        let h0 = format!("{}:0", run_id);
        let h1 = format!("{}:1", run_id);

        assert!(matches!(&events[0], RunEvent::RunStarted { statement_count: 2, .. }));
        assert!(matches!(&events[1], RunEvent::ResultPending { result_handle, .. } if *result_handle == h0));
        assert!(matches!(&events[2], RunEvent::ResultPending { result_handle, .. } if *result_handle == h1));
        assert!(matches!(&events[3], RunEvent::ResultStarted { statement_index: 0, .. }));
        match &events[4] {
            RunEvent::ResultComplete {
                statement_index: 0,
                message: Some(message),
                ..
            } => {
                assert_eq!(message.columns, vec![ColumnInfo::new("message", "string")]);
                assert_eq!(message.rows.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&events[5], RunEvent::ResultStarted { statement_index: 1, .. }));
        match &events[6] {
            RunEvent::ResultSchema { columns, .. } => assert_eq!(columns.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
        match &events[7] {
            RunEvent::ResultRows { rows, .. } => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0]["col"], json!(1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&events[8], RunEvent::ResultComplete { statement_index: 1, message: None, .. }));
        assert!(matches!(&events[9], RunEvent::RunComplete { succeeded: 2, failed: 0, cancelled: 0, .. }));
        assert_eq!(events.len(), 10);

        // Same worker instance for both statements
        assert_eq!(launcher.spawn_count(), 1);
        assert!(launcher.executed().iter().all(|(instance, _)| *instance == 0));
    }

    #[tokio::test]
    async fn test_failure_aborts_rest_of_run() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, mut rx) = coordinator(&launcher);

        let summary = coordinator
            .execute_run("a.sql", statements(&["SELECT 1", "FAIL", "SELECT 3"]))
            .await;
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!((summary.succeeded, summary.failed, summary.cancelled), (1, 1, 1));
        assert_eq!(launcher.executed_sql(), vec!["SELECT 1", "FAIL"]);

        let events = drain(&mut rx);
        let error = events
            .iter()
            .find_map(|e| match e {
                RunEvent::ResultError {
                    statement_index: 1,
                    error_type,
                    details,
                    ..
                } => Some((error_type.clone(), details.clone())),
                _ => None,
            })
            .expect("error event for statement 1");
        assert_eq!(error.0.as_deref(), Some("syntax_error"));
        assert_eq!(error.1.unwrap().line, Some(1));

        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::ResultCancelled { statement_index: 2, reason: CancelReason::BatchAborted, .. }
        )));
        assert!(!events
            .iter()
            .any(|e| matches!(e, RunEvent::ResultStarted { statement_index: 2, .. })));
        for index in 0..3 {
            assert_eq!(terminal_count(&events, index), 1);
        }
        assert!(events.last().unwrap().is_run_terminal());

        // The session survives a statement failure
        assert_eq!(launcher.kill_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_run_kills_session() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, mut rx) = coordinator(&launcher);

        let (run_id, task) = coordinator.spawn_run(
            "a.sql",
            statements(&["CREATE TEMP TABLE t AS SELECT 1", "WAIT_GATE", "SELECT 3"]),
        );
        launcher.wait_for_executed(2).await;
        launcher.wait_for_in_flight(1).await;

        assert!(coordinator.cancel_run(&run_id));
        assert!(!coordinator.cancel_run(&run_id));

        let summary = task.await.unwrap();
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(launcher.kill_count(), 1);
        assert_eq!(launcher.executed().len(), 2);

        let events = drain(&mut rx);
        assert!(matches!(
            events.last(),
            Some(RunEvent::RunCancelled { session_state_lost: true, .. })
        ));
        for (index, reason) in [(1, CancelReason::RunCancelled), (2, CancelReason::RunCancelled)] {
            assert!(events.iter().any(|e| matches!(
                e,
                RunEvent::ResultCancelled { statement_index, reason: r, .. } if *statement_index == index && *r == reason
            )));
        }
        for index in 0..3 {
            assert_eq!(terminal_count(&events, index), 1);
        }
        assert!(!events.iter().any(|e| matches!(e, RunEvent::RunComplete { .. })));

        // Next run gets a fresh worker and the temp table is gone
        let summary = coordinator.execute_run("a.sql", statements(&["SELECT * FROM t"])).await;
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_session_unavailable() {
        let launcher = FakeLauncher::new(FakeWorkerConfig {
            connect_error: Some("Data source name not found".into()),
            ..Default::default()
        });
        let (coordinator, mut rx) = coordinator(&launcher);

        let summary = coordinator
            .execute_run("a.sql", statements(&["SELECT 1", "SELECT 2"]))
            .await;
        assert_eq!(summary.status, RunStatus::Error);
        assert_eq!(summary.cancelled, 2);

        let events = drain(&mut rx);
        let reasons: Vec<CancelReason> = events
            .iter()
            .filter_map(|e| match e {
                RunEvent::ResultCancelled { reason, .. } => Some(*reason),
                _ => None,
            })
            .collect();
        assert_eq!(reasons, vec![CancelReason::SessionUnavailable; 2]);
        match events.last() {
            Some(RunEvent::RunError { message, code, .. }) => {
                assert_eq!(code, "CONNECTION_ERROR");
                assert!(message.contains("Data source name not found"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(launcher.executed().is_empty());
    }

    #[tokio::test]
    async fn test_worker_crash_reports_error() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, mut rx) = coordinator(&launcher);

        let summary = coordinator
            .execute_run("a.sql", statements(&["FAKE_CRASH", "SELECT 2"]))
            .await;
        assert_eq!(summary.status, RunStatus::Failed);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::ResultError { statement_index: 0, error_type: Some(code), .. } if code == "WORKER_EXITED"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            RunEvent::ResultCancelled { statement_index: 1, reason: CancelReason::BatchAborted, .. }
        )));

        // The dead session is replaced on the next run
        let summary = coordinator.execute_run("a.sql", statements(&["SELECT 1"])).await;
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(launcher.spawn_count(), 2);
    }

    #[tokio::test]
    async fn test_runs_on_same_file_queue_behind_each_other() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, mut rx) = coordinator(&launcher);

        let (first_id, first) = coordinator.spawn_run("a.sql", statements(&["WAIT_GATE"]));
        launcher.wait_for_in_flight(1).await;
        let (second_id, second) = coordinator.spawn_run("a.sql", statements(&["SELECT 2"]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        // Second run's statement is queued but not started
        let events = drain(&mut rx);
        assert!(!events.iter().any(|e| matches!(
            e,
            RunEvent::ResultStarted { run_id, .. } if *run_id == second_id
        )));
        assert_eq!(coordinator.active_runs().len(), 2);

        launcher.open_gate(1);
        assert_eq!(first.await.unwrap().status, RunStatus::Completed);
        assert_eq!(second.await.unwrap().status, RunStatus::Completed);
        assert_eq!(launcher.max_in_flight(), 1);
        assert_eq!(launcher.spawn_count(), 1);
        assert_ne!(first_id, second_id);
        assert!(coordinator.active_runs().is_empty());
    }

    #[tokio::test]
    async fn test_run_statements_are_not_split_by_another_run() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, mut rx) = coordinator(&launcher);

        let (first_id, first) = coordinator.spawn_run(
            "f.sql",
            statements(&["WAIT_GATE", "CREATE TEMP TABLE t AS SELECT 1", "SELECT * FROM t"]),
        );
        launcher.wait_for_in_flight(1).await;
        let (second_id, second) = coordinator.spawn_run("f.sql", statements(&["SELECT 99"]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        launcher.open_gate(1);
        assert_eq!(first.await.unwrap().status, RunStatus::Completed);
        assert_eq!(second.await.unwrap().status, RunStatus::Completed);
        assert_eq!(
            launcher.executed_sql(),
            vec![
                "WAIT_GATE",
                "CREATE TEMP TABLE t AS SELECT 1",
                "SELECT * FROM t",
                "SELECT 99"
            ]
        );

        // The second run's statement starts only after the first run's last
        // statement has settled
        let events = drain(&mut rx);
        let first_done = events
            .iter()
            .position(|e| matches!(e, RunEvent::ResultComplete { run_id, statement_index: 2, .. } if *run_id == first_id))
            .unwrap();
        let second_started = events
            .iter()
            .position(|e| matches!(e, RunEvent::ResultStarted { run_id, .. } if *run_id == second_id))
            .unwrap();
        assert!(first_done < second_started);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_another_runs_statements() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, _rx) = coordinator(&launcher);

        let (_, first) = coordinator.spawn_run("f.sql", statements(&["WAIT_GATE", "FAIL", "SELECT 3"]));
        launcher.wait_for_in_flight(1).await;
        let (_, second) = coordinator.spawn_run("f.sql", statements(&["SELECT 2"]));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        launcher.open_gate(1);
        let first = first.await.unwrap();
        assert_eq!(first.status, RunStatus::Failed);
        assert_eq!((first.succeeded, first.failed, first.cancelled), (1, 1, 1));
        assert_eq!(second.await.unwrap().status, RunStatus::Completed);
        assert_eq!(launcher.executed_sql(), vec!["WAIT_GATE", "FAIL", "SELECT 2"]);
    }

    #[tokio::test]
    async fn test_empty_run_completes() {
        let launcher = FakeLauncher::new(FakeWorkerConfig::default());
        let (coordinator, mut rx) = coordinator(&launcher);

        let summary = coordinator.execute_run("a.sql", Vec::new()).await;
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(drain(&mut rx).len(), 2);
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[test]
    fn test_event_serialization() {
        let event = RunEvent::ResultCancelled {
            run_id: "r".into(),
            result_handle: "r:2".into(),
            statement_index: 2,
            reason: CancelReason::BatchAborted,
        };
        assert_eq!(
            serde_json::to_value(&event).unwrap(),
            json!({
                "event": "result_cancelled",
                "run_id": "r",
                "result_handle": "r:2",
                "statement_index": 2,
                "reason": "batch_aborted"
            })
        );
    }
}
