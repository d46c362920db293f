//! Correlated async values.
//!
//! A [`Deferred`] is a single-resolution value shared by every clone: the
//! first `resolve`/`reject` wins, later ones are ignored and report `false`.
//! Any number of tasks may `wait()` on it concurrently and all observe the
//! same outcome.
//!
//! With a deadline ([`Deferred::with_timeout`]) the value rejects itself with
//! [`DeferredError::Timeout`] if nobody settled it in time. That timer is the
//! only cancellation mechanism: a caller that stops caring simply drops its
//! clone and the operation still runs to completion or timeout.
//!
//! Built on a `tokio::sync::watch` channel holding `Option<Result<T, _>>`.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;

/// Why a deferred value did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeferredError {
    /// The deadline elapsed while the value was still pending.
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    /// Explicitly rejected by the owning operation.
    #[error("{0}")]
    Rejected(String),
    /// Every settling handle went away without settling.
    #[error("abandoned before settling")]
    Abandoned,
}

impl DeferredError {
    /// Whether this is a deadline expiry rather than a remote rejection.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

type Slot<T> = Option<Result<T, DeferredError>>;

/// A single-resolution, optionally deadline-bound, shareable async value.
pub struct Deferred<T> {
    tx: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.tx.borrow() {
            None => "pending",
            Some(Ok(_)) => "resolved",
            Some(Err(_)) => "rejected",
        };
        f.debug_struct("Deferred").field("state", &state).finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Deferred<T> {
    /// Create a pending value with no deadline.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Create a pending value that rejects itself after `timeout`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn with_timeout(timeout: Duration) -> Self {
        let deferred = Self::new();
        let weak: Weak<watch::Sender<Slot<T>>> = Arc::downgrade(&deferred.tx);
        let mut settled = deferred.tx.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(timeout) => {
                    if let Some(tx) = weak.upgrade() {
                        if settle(&tx, Err(DeferredError::Timeout(timeout))) {
                            log::debug!("Deferred value timed out after {timeout:?}");
                        }
                    }
                }
                // Settled early, or every handle dropped.
                _ = settled.wait_for(Option::is_some) => {}
            }
        });

        deferred
    }

    /// Settle with a value. Returns `false` if already settled.
    pub fn resolve(&self, value: T) -> bool {
        settle(&self.tx, Ok(value))
    }

    /// Settle with a rejection reason. Returns `false` if already settled.
    pub fn reject(&self, reason: impl Into<String>) -> bool {
        settle(&self.tx, Err(DeferredError::Rejected(reason.into())))
    }

    /// Settle with an explicit result. Returns `false` if already settled.
    pub fn settle(&self, result: Result<T, DeferredError>) -> bool {
        settle(&self.tx, result)
    }

    /// Whether the value has been resolved or rejected.
    pub fn is_settled(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The settled outcome, if any, without waiting.
    pub fn peek(&self) -> Option<Result<T, DeferredError>> {
        self.tx.borrow().clone()
    }

    /// Whether two handles refer to the same underlying value.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.tx, &other.tx)
    }

    /// Wait for the value to settle.
    pub async fn wait(&self) -> Result<T, DeferredError> {
        let mut rx = self.tx.subscribe();
        let slot = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DeferredError::Abandoned)?;
        (*slot).clone().unwrap_or(Err(DeferredError::Abandoned))
    }
}

fn settle<T>(tx: &watch::Sender<Slot<T>>, result: Result<T, DeferredError>) -> bool {
    tx.send_if_modified(|slot| {
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        true
    })
}
