// Pending-result registry
//
// Bridges callers blocked waiting for a job result with the webhook handlers
// that deliver it. Every waiter is finalized exactly once, by resolve,
// resolve_any, cancel, timeout or sweep, and the entry is removed under the
// same lock that publishes the final state. A key present in the map is
// therefore always unresolved.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DocflowError, Result};
use crate::model::ProcessedResult;

/// Correlation key of a waiter
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WaitKey {
    /// Waiting for a specific job id
    Job(String),
    /// Waiting for whichever result arrives without a correlation id
    Any,
}

impl fmt::Display for WaitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitKey::Job(id) => f.write_str(id),
            WaitKey::Any => f.write_str("any"),
        }
    }
}

impl From<&str> for WaitKey {
    fn from(job_id: &str) -> Self {
        WaitKey::Job(job_id.to_string())
    }
}

impl From<String> for WaitKey {
    fn from(job_id: String) -> Self {
        WaitKey::Job(job_id)
    }
}

/// State published on a waiter's channel
#[derive(Debug, Clone)]
pub enum WaiterState {
    Pending,
    Resolved(ProcessedResult),
    Cancelled(String),
    TimedOut,
}

impl WaiterState {
    fn is_settled(&self) -> bool {
        !matches!(self, WaiterState::Pending)
    }
}

struct Entry {
    id: u64,
    registered_at: Instant,
    tx: watch::Sender<WaiterState>,
}

impl Entry {
    fn finalize(self, state: WaiterState) {
        self.tx.send_replace(state);
    }
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    entries: HashMap<WaitKey, Entry>,
}

/// Handle to a registered waiter
///
/// Registering the same unresolved key twice yields handles to the same
/// logical waiter; all of them observe its single final state.
#[derive(Debug, Clone)]
pub struct WaiterHandle {
    key: WaitKey,
    id: u64,
    registered_at: Instant,
    rx: watch::Receiver<WaiterState>,
}

impl WaiterHandle {
    pub fn key(&self) -> &WaitKey {
        &self.key
    }

    /// Registration sequence number; lower means registered earlier
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn registered_at(&self) -> Instant {
        self.registered_at
    }

    /// Current state without waiting
    pub fn state(&self) -> WaiterState {
        self.rx.borrow().clone()
    }
}

/// Registry of single-resolution waiters keyed by job id (or "any")
#[derive(Default)]
pub struct PendingResults {
    inner: Mutex<Inner>,
}

impl PendingResults {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `key`, or return the existing unresolved one
    pub fn register(&self, key: impl Into<WaitKey>) -> WaiterHandle {
        let key = key.into();
        let mut inner = self.inner.lock();

        if let Some(entry) = inner.entries.get(&key) {
            return WaiterHandle {
                key,
                id: entry.id,
                registered_at: entry.registered_at,
                rx: entry.tx.subscribe(),
            };
        }

        inner.next_id += 1;
        let id = inner.next_id;
        let registered_at = Instant::now();
        let (tx, rx) = watch::channel(WaiterState::Pending);
        inner.entries.insert(
            key.clone(),
            Entry {
                id,
                registered_at,
                tx,
            },
        );
        tracing::debug!(key = %key, waiter_id = id, "waiter registered");

        WaiterHandle {
            key,
            id,
            registered_at,
            rx,
        }
    }

    /// Resolve and remove the waiter for `key`
    ///
    /// Returns false (no-op) when no waiter is registered under `key`.
    pub fn resolve(&self, key: impl Into<WaitKey>, result: ProcessedResult) -> bool {
        let key = key.into();
        let removed = self.inner.lock().entries.remove(&key).map(|entry| {
            let id = entry.id;
            entry.finalize(WaiterState::Resolved(result));
            id
        });

        match removed {
            Some(id) => {
                tracing::debug!(key = %key, waiter_id = id, "waiter resolved");
                true
            }
            None => {
                tracing::debug!(key = %key, "no pending waiter to resolve");
                false
            }
        }
    }

    /// Resolve the oldest registered waiter, whatever its key
    ///
    /// Only correct when at most one result is awaited without a correlation
    /// id at a time. Returns the key that was resolved.
    pub fn resolve_any(&self, result: ProcessedResult) -> Option<WaitKey> {
        let mut inner = self.inner.lock();
        let oldest = inner
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.id)
            .map(|(key, _)| key.clone());

        let Some(key) = oldest else {
            tracing::debug!("no pending waiter to resolve");
            return None;
        };
        if let Some(entry) = inner.entries.remove(&key) {
            entry.finalize(WaiterState::Resolved(result));
        }
        if !inner.entries.is_empty() {
            tracing::warn!(
                key = %key,
                remaining = inner.entries.len(),
                "resolved oldest waiter without correlation id while others are pending"
            );
        }
        Some(key)
    }

    /// Cancel and remove the waiter for `key`; in-flight waits fail with `Cancelled`
    pub fn cancel(&self, key: impl Into<WaitKey>) -> bool {
        let key = key.into();
        match self.inner.lock().entries.remove(&key) {
            Some(entry) => {
                entry.finalize(WaiterState::Cancelled(format!("waiter for {key} cancelled")));
                tracing::debug!(key = %key, "waiter cancelled");
                true
            }
            None => false,
        }
    }

    /// Register (if needed) and wait up to `timeout` for the result of `key`
    pub async fn wait(&self, key: impl Into<WaitKey>, timeout: Duration) -> Result<ProcessedResult> {
        let handle = self.register(key);
        self.wait_handle(&handle, timeout, &CancellationToken::new())
            .await
    }

    /// [`wait`](Self::wait) that also gives up when `cancel` fires
    pub async fn wait_cancellable(
        &self,
        key: impl Into<WaitKey>,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessedResult> {
        let handle = self.register(key);
        self.wait_handle(&handle, timeout, cancel).await
    }

    /// Wait on an already registered waiter
    ///
    /// On timeout or cancellation the waiter is removed, unless another
    /// finalizer got there first, in which case its outcome is returned.
    pub async fn wait_handle(
        &self,
        handle: &WaiterHandle,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ProcessedResult> {
        let mut rx = handle.rx.clone();

        let outcome = tokio::select! {
            settled = rx.wait_for(WaiterState::is_settled) => match settled {
                Ok(state) => state.clone(),
                Err(_) => WaiterState::Cancelled("registry dropped".to_string()),
            },
            _ = tokio::time::sleep(timeout) => {
                self.finalize_if_pending(handle, WaiterState::TimedOut)
            }
            _ = cancel.cancelled() => {
                self.finalize_if_pending(
                    handle,
                    WaiterState::Cancelled(format!("wait for {} cancelled", handle.key)),
                )
            }
        };

        match outcome {
            WaiterState::Resolved(result) => Ok(result),
            WaiterState::Cancelled(reason) => Err(DocflowError::Cancelled(reason)),
            WaiterState::TimedOut => Err(DocflowError::WaitTimeout {
                key: handle.key.to_string(),
                waited: timeout,
            }),
            WaiterState::Pending => Err(DocflowError::Internal(format!(
                "waiter for {} settled without a final state",
                handle.key
            ))),
        }
    }

    fn finalize_if_pending(&self, handle: &WaiterHandle, state: WaiterState) -> WaiterState {
        let mut inner = self.inner.lock();
        let ours = inner
            .entries
            .get(&handle.key)
            .is_some_and(|entry| entry.id == handle.id);

        if ours {
            if let Some(entry) = inner.entries.remove(&handle.key) {
                entry.finalize(state.clone());
            }
            tracing::debug!(key = %handle.key, waiter_id = handle.id, ?state, "waiter finalized by waiting side");
            state
        } else {
            // Finalized elsewhere; the channel already holds the final state
            handle.rx.borrow().clone()
        }
    }

    /// Cancel every waiter registered more than `max_age` ago
    pub fn sweep_older_than(&self, max_age: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let stale: Vec<WaitKey> = inner
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.registered_at) >= max_age)
            .map(|(key, _)| key.clone())
            .collect();

        for key in &stale {
            if let Some(entry) = inner.entries.remove(key) {
                entry.finalize(WaiterState::Cancelled(format!(
                    "waiter for {key} abandoned for over {max_age:?}"
                )));
            }
        }
        if !stale.is_empty() {
            tracing::info!(swept = stale.len(), "cancelled abandoned waiters");
        }
        stale.len()
    }

    /// Run [`sweep_older_than`](Self::sweep_older_than) every `interval` until `shutdown` fires
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::debug!("waiter sweeper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        registry.sweep_older_than(max_age);
                    }
                }
            }
        })
    }

    pub fn contains(&self, key: &WaitKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}
