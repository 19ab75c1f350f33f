//! One-shot rendezvous for outstanding call responses.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;

use crate::LinkError;
use crate::signal::SignalOnce;

/// The successful payload of a resolved call: the response object from the
/// callee's `response` frame.
pub type CallReply = serde_json::Map<String, Value>;

/// A single-shot rendezvous handed out by `invoke`.
///
/// Resolution is idempotent (the first resolve wins) and sticky: callers may
/// wait any number of times, before or after resolution, and always observe
/// the same result.  A deadline wait that gives up leaves the waiter
/// registered, so a late response lands in the already-resolved slot instead
/// of hitting a dead channel.
#[derive(Clone, Debug)]
pub struct Waiter {
    inner: Arc<WaiterInner>,
}

#[derive(Debug)]
struct WaiterInner {
    done: SignalOnce,
    slot: Mutex<Option<Result<CallReply, LinkError>>>,
}

impl Waiter {
    pub fn new() -> Waiter {
        Waiter {
            inner: Arc::new(WaiterInner {
                done: SignalOnce::new(),
                slot: Mutex::new(None),
            }),
        }
    }

    /// Resolve with a result.  Returns `false` (and changes nothing) if the
    /// waiter was already resolved.
    pub async fn resolve(&self, result: Result<CallReply, LinkError>) -> bool {
        let mut slot = self.inner.slot.lock().await;
        if slot.is_some() {
            return false;
        }
        *slot = Some(result);
        drop(slot);
        self.inner.done.fire();
        true
    }

    pub fn is_resolved(&self) -> bool {
        self.inner.done.is_fired()
    }

    /// Wait for resolution.
    pub async fn wait(&self) -> Result<CallReply, LinkError> {
        self.inner.done.fired().await;
        match &*self.inner.slot.lock().await {
            Some(result) => result.clone(),
            // Unreachable: the slot is filled before the signal fires.
            None => Err(LinkError::NilConnection),
        }
    }

    /// Wait for resolution with a deadline.  On timeout the waiter stays
    /// pending and registered; a later resolve still lands (and is observable
    /// through another `wait`).
    pub async fn wait_for(&self, timeout: Duration) -> Result<CallReply, LinkError> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        }
    }
}

impl Default for Waiter {
    fn default() -> Self {
        Waiter::new()
    }
}
