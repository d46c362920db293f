//! Single-flight `getProjects` round trips over the IPC channel.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::deferred::{Deferred, DeferredError};
use crate::handshake::Outbox;
use crate::message::MessageBody;

/// At most one outstanding `getProjects` per process. Callers that arrive
/// while a request is in flight wait on the same value.
pub struct ProjectRequests {
    outbox: Outbox,
    timeout: Duration,
    inflight: Mutex<Option<Deferred<Vec<String>>>>,
}

impl ProjectRequests {
    pub fn new(outbox: Outbox, timeout: Duration) -> Self {
        Self {
            outbox,
            timeout,
            inflight: Mutex::new(None),
        }
    }

    fn inflight(&self) -> MutexGuard<'_, Option<Deferred<Vec<String>>>> {
        self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_pending(&self) -> bool {
        self.inflight().as_ref().is_some_and(|d| !d.is_settled())
    }

    /// Ask the peer for its project ids.
    pub async fn request(&self) -> Result<Vec<String>, DeferredError> {
        let (pending, owner) = {
            let mut inflight = self.inflight();
            match inflight.as_ref() {
                Some(d) if !d.is_settled() => (d.clone(), false),
                _ => {
                    let d = Deferred::with_timeout(self.timeout);
                    *inflight = Some(d.clone());
                    (d, true)
                }
            }
        };

        if owner {
            match self.outbox.send(MessageBody::GetProjects) {
                Ok(true) => log::debug!("Requested project list from peer"),
                Ok(false) => {
                    pending.reject("handshake not complete");
                }
                Err(e) => {
                    pending.reject(e.to_string());
                }
            }
        } else {
            log::debug!("Joining in-flight project request");
        }

        let result = pending.wait().await;
        let mut inflight = self.inflight();
        if inflight.as_ref().is_some_and(|d| d.same_as(&pending)) {
            *inflight = None;
        }
        result
    }

    /// Settle the outstanding request with the peer's answer.
    pub fn resolve(&self, projects: Vec<String>) -> bool {
        match self.inflight().take() {
            Some(pending) => pending.resolve(projects),
            None => {
                log::debug!("Ignoring unsolicited projectResults");
                false
            }
        }
    }

    /// Reject the outstanding request, e.g. because the peer went away.
    pub fn abandon(&self, reason: &str) -> bool {
        self.inflight().take().is_some_and(|pending| pending.reject(reason))
    }
}
