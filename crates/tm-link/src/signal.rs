//! One-shot signals with idempotent fire semantics.
//!
//! Shutdown, schema-arrival and supervisor-exit conditions are all
//! "happened exactly once" facts.  Modeling them as a dedicated type keeps
//! the teardown paths free of flag-and-lock bookkeeping.

use tokio::sync::watch;

/// A signal that can be fired at most once and awaited any number of times,
/// before or after the fire.
#[derive(Debug)]
pub struct SignalOnce {
    tx: watch::Sender<bool>,
}

impl SignalOnce {
    pub fn new() -> SignalOnce {
        SignalOnce {
            tx: watch::channel(false).0,
        }
    }

    /// Fire the signal.  Returns `true` only for the first caller; later
    /// calls are no-ops.
    pub fn fire(&self) -> bool {
        self.tx.send_if_modified(|fired| {
            if *fired {
                false
            } else {
                *fired = true;
                true
            }
        })
    }

    pub fn is_fired(&self) -> bool {
        *self.tx.borrow()
    }

    /// Wait until the signal fires.  Returns immediately if it already has.
    pub async fn fired(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in self, so wait_for cannot observe a closed
        // channel while we hold the borrow.
        let _ = rx.wait_for(|fired| *fired).await;
    }
}

impl Default for SignalOnce {
    fn default() -> Self {
        SignalOnce::new()
    }
}
