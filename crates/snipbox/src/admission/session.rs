//! Per-session execution exclusivity and the streaming worker pool

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument};

use crate::admission::AdmissionError;
use crate::runner::{FrameSink, OutputFrame};

/// Message published when dispatched work faults
pub const INTERNAL_ERROR: &str = "Internal error";

/// Identifies one logical session on one transport connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    connection_id: String,
    session_id: String,
}

impl SessionKey {
    pub fn new(connection_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            connection_id: connection_id.into(),
            session_id: session_id.into(),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.connection_id, self.session_id)
    }
}

/// Exclusive execution rights for one session
///
/// The session lock is released when the lease is dropped.
#[derive(Debug)]
pub struct SessionLease {
    locks: Arc<DashMap<SessionKey, ()>>,
    key: SessionKey,
}

impl SessionLease {
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Release the session lock now
    pub fn release(self) {}
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.locks.remove(&self.key);
        debug!(session = %self.key, "session released");
    }
}

/// Serializes executions per session and bounds total parallelism
#[derive(Debug, Clone)]
pub struct SessionGuard {
    locks: Arc<DashMap<SessionKey, ()>>,
    workers: Arc<Semaphore>,
    worker_count: usize,
}

impl SessionGuard {
    /// Create a guard dispatching onto `workers` concurrent executions
    pub fn new(workers: usize) -> Self {
        let worker_count = workers.max(1);
        Self {
            locks: Arc::new(DashMap::new()),
            workers: Arc::new(Semaphore::new(worker_count)),
            worker_count,
        }
    }

    /// Lock `key` if no execution holds it
    pub fn try_acquire(&self, key: SessionKey) -> Option<SessionLease> {
        match self.locks.entry(key) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let key = slot.key().clone();
                slot.insert(());
                Some(SessionLease {
                    locks: Arc::clone(&self.locks),
                    key,
                })
            }
        }
    }

    pub fn is_active(&self, key: &SessionKey) -> bool {
        self.locks.contains_key(key)
    }

    /// Number of sessions with an execution queued or running
    pub fn active_sessions(&self) -> usize {
        self.locks.len()
    }

    /// Workers not currently running an execution
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Run `work` for `key` on the worker pool
    ///
    /// If the session already has an execution in flight, one error frame is
    /// published to `frames` and nothing is dispatched. Otherwise the work
    /// waits for a free worker; the session stays locked until it finishes,
    /// panics included.
    #[instrument(skip(self, frames, work), fields(session = %key))]
    pub async fn dispatch<F, Fut>(
        &self,
        key: SessionKey,
        frames: FrameSink,
        work: F,
    ) -> Result<JoinHandle<()>, AdmissionError>
    where
        F: FnOnce(FrameSink) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let Some(lease) = self.try_acquire(key) else {
            let err = AdmissionError::SessionBusy;
            debug!("session busy");
            frames.emit(OutputFrame::error(err.to_string())).await;
            return Err(err);
        };

        let workers = Arc::clone(&self.workers);
        Ok(tokio::spawn(async move {
            let Ok(_permit) = workers.acquire_owned().await else {
                return;
            };

            let sink = frames.clone();
            let outcome = AssertUnwindSafe(async move { work(sink).await })
                .catch_unwind()
                .await;

            if outcome.is_err() {
                error!(session = %lease.key(), "dispatched execution panicked");
                frames.emit(OutputFrame::error(INTERNAL_ERROR)).await;
            }
            lease.release();
        }))
    }
}
