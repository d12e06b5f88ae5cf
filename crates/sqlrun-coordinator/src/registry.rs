//! Session registry
//!
//! The single map from file key to live session. Creation is memoized per
//! key so concurrent callers share one spawn, and runs in its own task so
//! a caller giving up does not strand a half-started worker.

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sqlrun_common::{ReconnectResult, Result, SqlRunError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::launcher::WorkerLauncher;
use crate::session::{Session, SessionOptions};

type Creation = Shared<BoxFuture<'static, Result<Arc<Session>>>>;

enum Slot {
    Live(Arc<Session>),
    Pending { id: u64, creation: Creation },
}

struct RegistryInner {
    launcher: Arc<dyn WorkerLauncher>,
    options: SessionOptions,
    max_sessions: usize,
    slots: Mutex<HashMap<String, Slot>>,
    next_creation: AtomicU64,
    /// Creations dropped from the map that have not settled yet. Their
    /// workers are still starting, so they count against the ceiling.
    abandoned: AtomicUsize,
}

impl RegistryInner {
    fn abandon(&self, key: &str, slot: &Slot) {
        if let Slot::Pending { .. } = slot {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
            info!(session = %key, "Abandoned session creation");
        }
    }
}

/// File key to session map with a global ceiling
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(
        launcher: Arc<dyn WorkerLauncher>,
        options: SessionOptions,
        max_sessions: usize,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                launcher,
                options,
                max_sessions,
                slots: Mutex::new(HashMap::new()),
                next_creation: AtomicU64::new(0),
                abandoned: AtomicUsize::new(0),
            }),
        }
    }

    /// Return the healthy session for `key`, creating one if needed.
    ///
    /// Fails with `Capacity` instead of evicting another file's session.
    pub async fn get_or_create(&self, key: &str) -> Result<Arc<Session>> {
        let creation = {
            let mut slots = self.inner.slots.lock();
            prune(&mut slots);
            match slots.get(key) {
                Some(Slot::Live(session)) => return Ok(session.clone()),
                Some(Slot::Pending { creation, .. }) => {
                    debug!(session = %key, "Joining in-progress session creation");
                    creation.clone()
                }
                None => {
                    let starting = self.inner.abandoned.load(Ordering::SeqCst);
                    if slots.len() + starting >= self.inner.max_sessions {
                        warn!(
                            session = %key,
                            max_sessions = self.inner.max_sessions,
                            "Session limit reached"
                        );
                        return Err(SqlRunError::Capacity {
                            max: self.inner.max_sessions,
                        });
                    }
                    let id = self.inner.next_creation.fetch_add(1, Ordering::Relaxed);
                    let creation = start_creation(self.inner.clone(), key.to_string(), id);
                    slots.insert(
                        key.to_string(),
                        Slot::Pending {
                            id,
                            creation: creation.clone(),
                        },
                    );
                    creation
                }
            }
        };
        creation.await
    }

    /// Live session for `key`, without creating one
    pub fn get(&self, key: &str) -> Option<Arc<Session>> {
        match self.inner.slots.lock().get(key) {
            Some(Slot::Live(session)) if session.is_healthy() => Some(session.clone()),
            _ => None,
        }
    }

    /// Kill the session for `key` and forget it. A creation in progress is
    /// abandoned and its session discarded once it connects; until then it
    /// still counts against the ceiling.
    pub fn cancel(&self, key: &str) -> bool {
        let slot = self.take(key);
        match slot {
            Some(Slot::Live(session)) => {
                session.cancel();
                true
            }
            Some(Slot::Pending { .. }) => true,
            None => false,
        }
    }

    /// Orderly teardown of one session
    pub async fn close(&self, key: &str) -> bool {
        let slot = self.take(key);
        match slot {
            Some(Slot::Live(session)) => {
                session.close().await;
                true
            }
            Some(Slot::Pending { .. }) => true,
            None => false,
        }
    }

    /// Orderly teardown of every session
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .slots
            .lock()
            .drain()
            .filter_map(|(key, slot)| match slot {
                Slot::Live(session) => Some(session),
                pending => {
                    self.inner.abandon(&key, &pending);
                    None
                }
            })
            .collect();
        if sessions.is_empty() {
            return;
        }
        info!(count = sessions.len(), "Closing all sessions");
        futures::future::join_all(sessions.iter().map(|session| session.close())).await;
    }

    /// Reconnect the existing session, or start one if there is none
    pub async fn reconnect(&self, key: &str) -> Result<ReconnectResult> {
        match self.get(key) {
            Some(session) => session.reconnect().await,
            None => {
                self.get_or_create(key).await?;
                Ok(ReconnectResult {
                    success: true,
                    message: Some("Started a new session".to_string()),
                    error: None,
                })
            }
        }
    }

    /// Remove the slot for `key`, accounting for an abandoned creation
    fn take(&self, key: &str) -> Option<Slot> {
        let mut slots = self.inner.slots.lock();
        let slot = slots.remove(key)?;
        self.inner.abandon(key, &slot);
        Some(slot)
    }

    /// Sessions live or being created
    pub fn len(&self) -> usize {
        self.inner.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.slots.lock().contains_key(key)
    }

    pub fn max_sessions(&self) -> usize {
        self.inner.max_sessions
    }
}

/// Drop and kill sessions whose worker is gone
fn prune(slots: &mut HashMap<String, Slot>) {
    let dead: Vec<String> = slots
        .iter()
        .filter_map(|(key, slot)| match slot {
            Slot::Live(session) if !session.is_healthy() => Some(key.clone()),
            _ => None,
        })
        .collect();
    for key in dead {
        if let Some(Slot::Live(session)) = slots.remove(&key) {
            info!(session = %key, state = %session.state(), "Discarding dead session");
            session.cancel();
        }
    }
}

fn start_creation(inner: Arc<RegistryInner>, key: String, id: u64) -> Creation {
    let task = tokio::spawn(async move {
        let opened = Session::open(&key, inner.launcher.as_ref(), &inner.options).await;
        settle(&inner, &key, id, opened.map(Arc::new))
    });
    async move {
        task.await
            .unwrap_or_else(|e| Err(SqlRunError::internal(format!("session creation panicked: {}", e))))
    }
    .boxed()
    .shared()
}

/// Store the outcome if the pending slot is still ours
fn settle(
    inner: &RegistryInner,
    key: &str,
    id: u64,
    opened: Result<Arc<Session>>,
) -> Result<Arc<Session>> {
    let mut slots = inner.slots.lock();
    let current = matches!(slots.get(key), Some(Slot::Pending { id: pending, .. }) if *pending == id);
    if !current {
        inner.abandoned.fetch_sub(1, Ordering::SeqCst);
    }
    match opened {
        Ok(session) if current => {
            slots.insert(key.to_string(), Slot::Live(session.clone()));
            Ok(session)
        }
        Ok(session) => {
            drop(slots);
            info!(session = %key, "Discarding session created after cancel");
            session.cancel();
            Err(SqlRunError::SessionTerminated)
        }
        Err(e) => {
            if current {
                slots.remove(key);
            }
            Err(e)
        }
    }
}
