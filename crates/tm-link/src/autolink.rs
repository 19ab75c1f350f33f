//! Auto-reconnect supervisor.
//!
//! Wraps an outbound [`Connection`] and re-dials it when it drops.  The
//! supervisor's *desired* subscription sets are the source of truth: after
//! every successful (re)connection they are replayed as two `set` frames
//! before user operations can see the new connection, restoring the peer's
//! view to equivalence.

use std::collections::HashSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tm_meta::Meta;

use crate::conn::{ConnOptions, Connection, EventHandler, StateHandler};
use crate::model::Model;
use crate::signal::SignalOnce;
use crate::waiter::{CallReply, Waiter};
use crate::LinkError;

/// When to stop re-dialing.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Give up after this many consecutive failures.
    pub max_attempts: u32,
    /// Never give up; supersedes `max_attempts`.
    pub forever: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            forever: false,
        }
    }
}

/// Reports every dial attempt: `(attempt, ok)`.
pub type ReconnectHook = Arc<dyn Fn(u32, bool) + Send + Sync>;

#[derive(Clone)]
pub struct AutoLinkOptions {
    pub state_capacity: usize,
    pub event_capacity: usize,
    pub on_state: Option<StateHandler>,
    pub on_event: Option<EventHandler>,
    pub policy: RetryPolicy,
    pub on_reconnect: Option<ReconnectHook>,
    /// Pause between failed attempts.
    pub retry_delay: Duration,
}

impl Default for AutoLinkOptions {
    fn default() -> Self {
        AutoLinkOptions {
            state_capacity: 0,
            event_capacity: 0,
            on_state: None,
            on_event: None,
            policy: RetryPolicy::default(),
            on_reconnect: None,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// A durable client-side peer link.
///
/// Exposes the same operation surface as a [`Connection`]; while no live
/// connection exists, subscription mutations still update the desired sets
/// but every operation reports `"nil connection"`.
#[derive(Clone)]
pub struct AutoLink {
    inner: Arc<AutoInner>,
}

struct AutoInner {
    model: Model,
    addr: String,
    opts: AutoLinkOptions,
    st: Mutex<AutoState>,
    exit: SignalOnce,
}

#[derive(Default)]
struct AutoState {
    conn: Option<Connection>,
    want_states: HashSet<String>,
    want_events: HashSet<String>,
}

impl AutoLink {
    /// Dial `addr` immediately, retrying per policy.  The supervisor is
    /// returned even if every attempt failed: bookkeeping stays usable and a
    /// peer-triggered close is not the only way back (see [`AutoLink::redial`]).
    pub async fn connect(model: &Model, addr: &str, opts: AutoLinkOptions) -> AutoLink {
        let link = AutoLink {
            inner: Arc::new(AutoInner {
                model: model.clone(),
                addr: addr.to_owned(),
                opts,
                st: Mutex::new(AutoState::default()),
                exit: SignalOnce::new(),
            }),
        };
        link.reconnect_loop().await;
        link
    }

    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    /// Whether a live connection currently backs this supervisor.
    pub async fn is_connected(&self) -> bool {
        self.inner.st.lock().await.conn.is_some()
    }

    /// Re-run the dial loop if no live connection exists.
    pub async fn redial(&self) {
        if self.inner.exit.is_fired() || self.is_connected().await {
            return;
        }
        self.reconnect_loop().await;
    }

    /// Shut the supervisor down: no further reconnect attempts, and the
    /// live connection (if any) is closed.
    pub async fn close(&self) {
        if !self.inner.exit.fire() {
            return;
        }
        let conn = self.inner.st.lock().await.conn.take();
        if let Some(conn) = conn {
            conn.close().await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.exit.is_fired()
    }

    // -----------------------------------------------------------------------
    // Reconnect machinery
    // -----------------------------------------------------------------------

    async fn reconnect_loop(&self) {
        let mut attempt = 0u32;
        loop {
            // Exit is only honored at iteration boundaries; an in-flight
            // dial runs to completion.
            if self.inner.exit.is_fired() {
                return;
            }
            attempt += 1;
            let dialed = self.dial_once().await;
            let ok = dialed.is_ok();
            if let Some(hook) = &self.inner.opts.on_reconnect {
                hook(attempt, ok);
            }
            match dialed {
                Ok(conn) => {
                    let mut st = self.inner.st.lock().await;
                    if self.inner.exit.is_fired() {
                        // close() won the race while we were dialing.
                        drop(st);
                        conn.close().await;
                        return;
                    }
                    // Replay the desired sets (set semantics, not add)
                    // before any user operation can reach the connection.
                    let _ = conn.sub_state(st.want_states.iter().cloned()).await;
                    let _ = conn.sub_event(st.want_events.iter().cloned()).await;
                    st.conn = Some(conn);
                    info!(addr = %self.inner.addr, attempt, "peer link established");
                    return;
                }
                Err(e) => {
                    warn!(addr = %self.inner.addr, attempt, error = %e, "dial failed");
                    let policy = self.inner.opts.policy;
                    if !policy.forever && attempt >= policy.max_attempts {
                        info!(addr = %self.inner.addr, attempt, "giving up");
                        return;
                    }
                    tokio::time::sleep(self.inner.opts.retry_delay).await;
                }
            }
        }
    }

    async fn dial_once(&self) -> Result<Connection, LinkError> {
        let weak = Arc::downgrade(&self.inner);
        let opts = ConnOptions {
            state_capacity: self.inner.opts.state_capacity,
            event_capacity: self.inner.opts.event_capacity,
            on_state: self.inner.opts.on_state.clone(),
            on_event: self.inner.opts.on_event.clone(),
            on_close: Some(Box::new(move |reason: &str| {
                on_underlying_close(&weak, reason);
            })),
            ..ConnOptions::default()
        };
        self.inner.model.dial(&self.inner.addr, opts).await
    }

    // -----------------------------------------------------------------------
    // Subscription bookkeeping (desired sets are the source of truth)
    // -----------------------------------------------------------------------

    pub async fn sub_state<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        let mut st = self.inner.st.lock().await;
        st.want_states = names.clone();
        match &st.conn {
            Some(conn) => conn.sub_state(names).await,
            None => Err(LinkError::NilConnection),
        }
    }

    pub async fn add_sub_state<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut st = self.inner.st.lock().await;
        st.want_states.extend(names.iter().cloned());
        match &st.conn {
            Some(conn) => conn.add_sub_state(names).await,
            None => Err(LinkError::NilConnection),
        }
    }

    /// Cancel the given state subscriptions.  An empty list cancels all,
    /// matching the wire collapse of `remove` to `clear`.
    pub async fn cancel_sub_state<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut st = self.inner.st.lock().await;
        if names.is_empty() {
            st.want_states.clear();
        } else {
            for n in &names {
                st.want_states.remove(n);
            }
        }
        match &st.conn {
            Some(conn) => conn.cancel_sub_state(names).await,
            None => Err(LinkError::NilConnection),
        }
    }

    pub async fn cancel_all_sub_state(&self) -> Result<(), LinkError> {
        let mut st = self.inner.st.lock().await;
        st.want_states.clear();
        match &st.conn {
            Some(conn) => conn.cancel_all_sub_state().await,
            None => Err(LinkError::NilConnection),
        }
    }

    pub async fn sub_event<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let names: HashSet<String> = names.into_iter().map(Into::into).collect();
        let mut st = self.inner.st.lock().await;
        st.want_events = names.clone();
        match &st.conn {
            Some(conn) => conn.sub_event(names).await,
            None => Err(LinkError::NilConnection),
        }
    }

    pub async fn add_sub_event<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut st = self.inner.st.lock().await;
        st.want_events.extend(names.iter().cloned());
        match &st.conn {
            Some(conn) => conn.add_sub_event(names).await,
            None => Err(LinkError::NilConnection),
        }
    }

    pub async fn cancel_sub_event<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let mut st = self.inner.st.lock().await;
        if names.is_empty() {
            st.want_events.clear();
        } else {
            for n in &names {
                st.want_events.remove(n);
            }
        }
        match &st.conn {
            Some(conn) => conn.cancel_sub_event(names).await,
            None => Err(LinkError::NilConnection),
        }
    }

    pub async fn cancel_all_sub_event(&self) -> Result<(), LinkError> {
        let mut st = self.inner.st.lock().await;
        st.want_events.clear();
        match &st.conn {
            Some(conn) => conn.cancel_all_sub_event().await,
            None => Err(LinkError::NilConnection),
        }
    }

    /// The current desired state-subscription set.
    pub async fn desired_states(&self) -> HashSet<String> {
        self.inner.st.lock().await.want_states.clone()
    }

    pub async fn desired_events(&self) -> HashSet<String> {
        self.inner.st.lock().await.want_events.clone()
    }

    // -----------------------------------------------------------------------
    // Delegated operations
    // -----------------------------------------------------------------------

    async fn live(&self) -> Result<Connection, LinkError> {
        self.inner
            .st
            .lock()
            .await
            .conn
            .clone()
            .ok_or(LinkError::NilConnection)
    }

    pub async fn invoke(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Waiter, LinkError> {
        self.live().await?.invoke(full_name, args).await
    }

    pub async fn invoke_cb<F>(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        on_resp: F,
    ) -> Result<(), LinkError>
    where
        F: FnOnce(Result<CallReply, LinkError>) + Send + 'static,
    {
        self.live().await?.invoke_cb(full_name, args, on_resp).await
    }

    pub async fn invoke_for<F>(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        timeout: Duration,
        on_resp: F,
    ) -> Result<(), LinkError>
    where
        F: FnOnce(Result<CallReply, LinkError>) + Send + 'static,
    {
        self.live()
            .await?
            .invoke_for(full_name, args, timeout, on_resp)
            .await
    }

    pub async fn call(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<CallReply, LinkError> {
        self.live().await?.call(full_name, args).await
    }

    pub async fn call_for(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        timeout: Duration,
    ) -> Result<CallReply, LinkError> {
        self.live().await?.call_for(full_name, args, timeout).await
    }

    pub async fn peer_meta(&self) -> Result<Arc<Meta>, LinkError> {
        self.live().await?.peer_meta().await
    }
}

/// Close callback installed on every underlying connection: clear the slot
/// and, unless the supervisor is exiting, start a fresh dial loop.
fn on_underlying_close(weak: &Weak<AutoInner>, reason: &str) {
    let Some(inner) = weak.upgrade() else {
        return;
    };
    debug!(addr = %inner.addr, reason, "underlying connection closed");
    let link = AutoLink { inner };
    tokio::spawn(async move {
        link.inner.st.lock().await.conn = None;
        if !link.inner.exit.is_fired() {
            link.reconnect_loop().await;
        }
    });
}
