//! Per-session query queue
//!
//! Strict FIFO with exactly one statement in flight. A drain task is
//! started on demand when work arrives on an idle queue and exits as soon
//! as the queue is empty again. Pending entries can be cancelled without
//! touching the one in flight.
//!
//! A batch is enqueued contiguously, so nothing submitted later can run in
//! between its statements. When one of them fails, the drain task cancels
//! the batch's remaining entries before it dequeues anything else.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlrun_common::{ExecuteResult, Result, SqlRunError};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Runs one statement against the session's worker
#[async_trait]
pub trait StatementExecutor: Send + Sync + 'static {
    async fn execute(&self, sql: &str, result_handle: &str) -> Result<ExecuteResult>;
}

/// Fired once when an entry leaves the queue and starts executing
pub type OnStarted = Box<dyn FnOnce() + Send>;

/// Fired with an executed entry's outcome, before the next entry starts
pub type OnSettled = Box<dyn FnOnce(&Result<ExecuteResult>) + Send>;

/// One statement of a batch
pub struct BatchEntry {
    pub sql: String,
    pub result_handle: String,
    pub on_started: OnStarted,
    pub on_settled: OnSettled,
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE ENTRY
// ═══════════════════════════════════════════════════════════════════════════

struct QueuedQuery {
    sql: String,
    result_handle: String,
    on_started: OnStarted,
    on_settled: Option<OnSettled>,
    batch: Option<u64>,
    completion: oneshot::Sender<Result<ExecuteResult>>,
    enqueued_at: Instant,
}

impl QueuedQuery {
    fn reject(self, error: SqlRunError) {
        let _ = self.completion.send(Err(error));
    }
}

/// Settles when the entry completes or is cancelled
#[derive(Debug)]
pub struct Completion {
    rx: oneshot::Receiver<Result<ExecuteResult>>,
}

impl Completion {
    pub async fn wait(self) -> Result<ExecuteResult> {
        self.rx.await.unwrap_or(Err(SqlRunError::QueryCancelled))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// QUEUE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct QueueState {
    entries: VecDeque<QueuedQuery>,
    draining: bool,
    /// Held by a `QueueClaim`; nothing is dequeued meanwhile
    claimed: bool,
    in_flight: Option<String>,
    next_batch: u64,
    /// Once set, new entries are rejected with this error
    closed: Option<SqlRunError>,
}

impl QueueState {
    fn take_pending(&mut self, matches: impl Fn(&QueuedQuery) -> bool) -> Vec<QueuedQuery> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| matches(entry));
        self.entries = kept.into();
        taken
    }
}

/// FIFO, single-flight statement queue
pub struct QueryQueue<E: StatementExecutor> {
    label: Arc<str>,
    executor: Arc<E>,
    state: Arc<Mutex<QueueState>>,
}

impl<E: StatementExecutor> Clone for QueryQueue<E> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            executor: self.executor.clone(),
            state: self.state.clone(),
        }
    }
}

impl<E: StatementExecutor> QueryQueue<E> {
    pub fn new(label: &str, executor: E) -> Self {
        Self {
            label: Arc::from(label),
            executor: Arc::new(executor),
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// Append a statement and start draining if the queue was idle
    pub fn enqueue(&self, sql: &str, result_handle: &str, on_started: OnStarted) -> Completion {
        let (tx, rx) = oneshot::channel();
        let entry = QueuedQuery {
            sql: sql.to_string(),
            result_handle: result_handle.to_string(),
            on_started,
            on_settled: None,
            batch: None,
            completion: tx,
            enqueued_at: Instant::now(),
        };
        self.push(vec![entry]);
        Completion { rx }
    }

    /// Append statements back to back. The first failure among them
    /// cancels the ones still pending.
    pub fn enqueue_batch(&self, statements: Vec<BatchEntry>) -> Vec<Completion> {
        let batch = {
            let mut state = self.state.lock();
            state.next_batch += 1;
            state.next_batch
        };
        let now = Instant::now();
        let mut completions = Vec::with_capacity(statements.len());
        let entries = statements
            .into_iter()
            .map(|statement| {
                let (tx, rx) = oneshot::channel();
                completions.push(Completion { rx });
                QueuedQuery {
                    sql: statement.sql,
                    result_handle: statement.result_handle,
                    on_started: statement.on_started,
                    on_settled: Some(statement.on_settled),
                    batch: Some(batch),
                    completion: tx,
                    enqueued_at: now,
                }
            })
            .collect();
        self.push(entries);
        completions
    }

    fn push(&self, entries: Vec<QueuedQuery>) {
        if entries.is_empty() {
            return;
        }
        let start_drain = {
            let mut state = self.state.lock();
            if let Some(reason) = &state.closed {
                let reason = reason.clone();
                drop(state);
                for entry in entries {
                    entry.reject(reason.clone());
                }
                return;
            }
            let added = entries.len();
            state.entries.extend(entries);
            debug!(
                session = %self.label,
                added,
                queue_depth = state.entries.len(),
                "Queries enqueued"
            );
            !state.claimed && !std::mem::replace(&mut state.draining, true)
        };

        if start_drain {
            self.spawn_drain();
        }
    }

    fn spawn_drain(&self) {
        tokio::spawn(drain(
            self.label.clone(),
            self.executor.clone(),
            self.state.clone(),
        ));
    }

    /// Enqueue and wait for the outcome
    pub async fn execute(
        &self,
        sql: &str,
        result_handle: &str,
        on_started: OnStarted,
    ) -> Result<ExecuteResult> {
        self.enqueue(sql, result_handle, on_started).wait().await
    }

    /// Reject matching entries that have not started; returns how many
    pub fn cancel_pending(&self, result_handles: &HashSet<String>) -> usize {
        let cancelled = self
            .state
            .lock()
            .take_pending(|entry| result_handles.contains(&entry.result_handle));
        let count = cancelled.len();
        for entry in cancelled {
            debug!(session = %self.label, result_handle = %entry.result_handle, "Pending query cancelled");
            entry.reject(SqlRunError::QueryCancelled);
        }
        count
    }

    /// Take the worker for something other than a statement, if nothing is
    /// queued or running. Entries added meanwhile wait for the claim to be
    /// dropped.
    pub fn try_claim(&self) -> Option<QueueClaim<E>> {
        let mut state = self.state.lock();
        if state.claimed || state.in_flight.is_some() || !state.entries.is_empty() {
            return None;
        }
        state.claimed = true;
        Some(QueueClaim { queue: self.clone() })
    }

    /// Reject every pending entry and refuse new ones.
    ///
    /// The in-flight entry is not touched; it settles when its worker
    /// answers or dies.
    pub fn close(&self, reason: SqlRunError) -> usize {
        let cancelled: Vec<QueuedQuery> = {
            let mut state = self.state.lock();
            if state.closed.is_none() {
                state.closed = Some(reason);
            }
            state.entries.drain(..).collect()
        };
        let count = cancelled.len();
        if count > 0 {
            info!(session = %self.label, cancelled = count, "Rejected pending queries");
        }
        for entry in cancelled {
            entry.reject(SqlRunError::QueryCancelled);
        }
        count
    }

    /// Number of entries waiting to start
    pub fn pending(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Handle of the entry currently executing
    pub fn in_flight(&self) -> Option<String> {
        self.state.lock().in_flight.clone()
    }

    pub fn is_idle(&self) -> bool {
        let state = self.state.lock();
        state.entries.is_empty() && state.in_flight.is_none()
    }
}

/// Exclusive use of an idle queue's worker; see [`QueryQueue::try_claim`]
pub struct QueueClaim<E: StatementExecutor> {
    queue: QueryQueue<E>,
}

impl<E: StatementExecutor> Drop for QueueClaim<E> {
    fn drop(&mut self) {
        let resume = {
            let mut state = self.queue.state.lock();
            state.claimed = false;
            !state.entries.is_empty() && !std::mem::replace(&mut state.draining, true)
        };
        if resume {
            self.queue.spawn_drain();
        }
    }
}

async fn drain<E: StatementExecutor>(
    label: Arc<str>,
    executor: Arc<E>,
    state: Arc<Mutex<QueueState>>,
) {
    loop {
        let entry = {
            let mut state = state.lock();
            if state.claimed {
                state.draining = false;
                return;
            }
            match state.entries.pop_front() {
                Some(entry) => {
                    state.in_flight = Some(entry.result_handle.clone());
                    entry
                }
                None => {
                    state.draining = false;
                    state.in_flight = None;
                    return;
                }
            }
        };

        let QueuedQuery {
            sql,
            result_handle,
            on_started,
            on_settled,
            batch,
            completion,
            enqueued_at,
        } = entry;

        debug!(
            session = %label,
            result_handle = %result_handle,
            queue_wait_ms = enqueued_at.elapsed().as_millis() as u64,
            "Query started"
        );
        on_started();

        let result = executor.execute(&sql, &result_handle).await;
        if let Some(on_settled) = on_settled {
            on_settled(&result);
        }

        let failed = !matches!(&result, Ok(r) if r.success);
        let aborted = {
            let mut state = state.lock();
            state.in_flight = None;
            match batch {
                Some(batch) if failed => state.take_pending(|entry| entry.batch == Some(batch)),
                _ => Vec::new(),
            }
        };
        let _ = completion.send(result);
        if !aborted.is_empty() {
            debug!(
                session = %label,
                result_handle = %result_handle,
                cancelled = aborted.len(),
                "Statement failed; cancelling rest of batch"
            );
        }
        for entry in aborted {
            entry.reject(SqlRunError::QueryCancelled);
        }
    }
}
