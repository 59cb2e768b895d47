use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::sync::oneshot::{Receiver as OneShotReceiver, Sender as OneShotSender};

use crate::error::CallError;

pub type CallOutcome = Result<Value, CallError>;
pub type Responder = OneShotSender<CallOutcome>;

/// Continuations for calls that have been sent but not answered, keyed by request id.
/// Every entry leaves the map exactly once: answered, cancelled, or failed.
#[derive(Clone, Default)]
pub struct PendingCalls {
    responders: Arc<DashMap<u64, Responder>>,
}

impl PendingCalls {
    pub fn new() -> PendingCalls {
        Self::default()
    }

    pub fn register(&self, id: u64) -> OneShotReceiver<CallOutcome> {
        let (tx, rx) = oneshot::channel::<CallOutcome>();
        let _ = self.responders.insert(id, tx);
        rx
    }

    /// Deliver `outcome` to the call registered under `id`. Returns `false` when no such
    /// call is pending, which covers late answers to cancelled calls.
    pub fn resolve(&self, id: u64, outcome: CallOutcome) -> bool {
        match self.responders.remove(&id) {
            Some((_, responder)) => {
                // the caller may have stopped waiting; that is not our failure
                let _ = responder.send(outcome);
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, id: u64) -> bool {
        self.resolve(id, Err(CallError::Cancelled))
    }

    /// Drop the entry without notifying anyone. Used when the waiting side is gone.
    pub fn forget(&self, id: u64) -> bool {
        self.responders.remove(&id).is_some()
    }

    /// Fail every pending call with a clone of `err`, returning how many were failed.
    pub fn fail_all(&self, err: CallError) -> usize {
        let ids: Vec<u64> = self.responders.iter().map(|e| *e.key()).collect();
        ids.into_iter()
            .filter(|id| self.resolve(*id, Err(err.clone())))
            .count()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: u64) -> bool {
        self.responders.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.responders.len()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.responders.is_empty()
    }
}

/// A call in flight. Resolves to the peer's result or the reason it never came;
/// dropping it before then removes the pending entry.
pub struct CallHandle {
    id: u64,
    response_rx: OneShotReceiver<CallOutcome>,
    pending: PendingCalls,
    finished: bool,
}

impl CallHandle {
    pub(crate) fn new(
        id: u64,
        response_rx: OneShotReceiver<CallOutcome>,
        pending: PendingCalls,
    ) -> CallHandle {
        Self {
            id,
            response_rx,
            pending,
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Stop waiting. The handle resolves to `CallError::Cancelled` if polled again.
    pub fn cancel(&self) -> bool {
        self.pending.cancel(self.id)
    }
}

impl Future for CallHandle {
    type Output = CallOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let outcome = match Pin::new(&mut self.response_rx).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Ok(outcome)) => outcome,
            // responder dropped unsent: the transport went away with the call still open
            Poll::Ready(Err(_)) => Err(CallError::TransportClosed),
        };
        self.finished = true;
        Poll::Ready(outcome)
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if !self.finished {
            self.pending.forget(self.id);
        }
    }
}
