//! The per-peer connection state machine.
//!
//! Each connection owns three long-running tasks: the *reader* (pulls frames
//! off the transport and dispatches them), and one consumer per bounded
//! broadcast channel (states, events) invoking the user handlers in arrival
//! order.  `call` frames are dispatched on a fresh task each so a slow
//! method handler cannot head-of-line-block the reader.
//!
//! Shutdown is driven by one-shot signals: whoever fires `closed` first
//! wins, wakes every registered waiter with the close reason, fires the
//! schema signal if it never arrived, closes the transport and runs the
//! close callback exactly once.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use tm_meta::Meta;
use tm_protocol::{
    CallPayload, DecodeError, EventPayload, Frame, ResponsePayload, StatePayload, SubOp,
    split_full_name,
};

use crate::model::Model;
use crate::signal::SignalOnce;
use crate::transport::{Transport, TransportReader, TransportWriter};
use crate::waiter::{CallReply, Waiter};
use crate::LinkError;

/// Default capacity of the state and event broadcast channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Handler payloads and callback types
// ---------------------------------------------------------------------------

/// A state broadcast delivered to the subscriber's handler.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    /// The model prefix of the fully-qualified name.
    pub model: String,
    /// The local state name (after the last `/`).
    pub name: String,
    pub full_name: String,
    pub data: Value,
}

/// An event broadcast delivered to the subscriber's handler.
#[derive(Debug, Clone)]
pub struct EventNotice {
    pub model: String,
    pub name: String,
    pub full_name: String,
    pub args: serde_json::Map<String, Value>,
}

/// An inbound method invocation handed to the host's `on_call` dispatcher.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// The local method name (model prefix already matched).
    pub name: String,
    pub args: serde_json::Map<String, Value>,
}

pub type StateHandler = Arc<dyn Fn(StateUpdate) -> BoxFuture<'static, ()> + Send + Sync>;
pub type EventHandler = Arc<dyn Fn(EventNotice) -> BoxFuture<'static, ()> + Send + Sync>;
pub type CloseHandler = Box<dyn FnOnce(&str) + Send>;
/// Observes publish-set changes; receives a snapshot of the new set.
pub type SubUpdateHandler = Arc<dyn Fn(SubChange) + Send + Sync>;
/// Routes `call` frames whose model prefix is not the local model.  The
/// router owns the obligation to eventually answer on the origin connection.
pub type CallRouterFn = Arc<dyn Fn(Connection, CallPayload) + Send + Sync>;
/// Taps every raw frame moving through the connection.
pub type FrameTap = Arc<dyn Fn(FrameDirection, &str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubKind {
    State,
    Event,
}

/// Snapshot of a publish set after a subscription-update frame applied.
#[derive(Debug, Clone)]
pub struct SubChange {
    pub kind: SubKind,
    pub names: HashSet<String>,
}

fn noop_state_handler() -> StateHandler {
    Arc::new(|_| async {}.boxed())
}

fn noop_event_handler() -> EventHandler {
    Arc::new(|_| async {}.boxed())
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-connection configuration.  All handlers default to no-ops.
pub struct ConnOptions {
    /// Bounded state-channel capacity; zero falls back to the default.
    pub state_capacity: usize,
    /// Bounded event-channel capacity; zero falls back to the default.
    pub event_capacity: usize,
    pub on_state: Option<StateHandler>,
    pub on_event: Option<EventHandler>,
    /// Invoked exactly once with the close reason.
    pub on_close: Option<CloseHandler>,
    pub on_sub_update: Option<SubUpdateHandler>,
    pub call_router: Option<CallRouterFn>,
    pub frame_tap: Option<FrameTap>,
}

impl Default for ConnOptions {
    fn default() -> Self {
        ConnOptions {
            state_capacity: DEFAULT_CHANNEL_CAPACITY,
            event_capacity: DEFAULT_CHANNEL_CAPACITY,
            on_state: None,
            on_event: None,
            on_close: None,
            on_sub_update: None,
            call_router: None,
            frame_tap: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

/// One live peer link.  Cheap to clone; all clones share the same state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnInner>,
}

struct ConnInner {
    model: Model,
    peer: String,

    /// Exclusive writer: at most one encoder touches the transport at a time.
    writer: Mutex<Option<TransportWriter>>,

    /// What the remote peer asked us to publish.
    pub_states: RwLock<HashSet<String>>,
    pub_events: RwLock<HashSet<String>>,

    /// Outstanding calls by UUID; resolution removes the entry.
    waiters: Mutex<HashMap<String, Waiter>>,

    /// Peer schema: slot + one-shot, honoring only the first `meta-info`.
    meta_slot: Mutex<Option<Result<Arc<Meta>, LinkError>>>,
    meta_got: SignalOnce,
    meta_queried: AtomicBool,

    closed: SignalOnce,
    close_reason: Mutex<String>,
    on_close: Mutex<Option<CloseHandler>>,

    on_state: StateHandler,
    on_event: EventHandler,
    on_sub_update: Option<SubUpdateHandler>,
    call_router: Option<CallRouterFn>,
    frame_tap: Option<FrameTap>,

    /// Senders for the bounded broadcast channels; taken (= closed) by the
    /// reader on exit so the consumers drain and stop.
    state_tx: Mutex<Option<mpsc::Sender<StateUpdate>>>,
    event_tx: Mutex<Option<mpsc::Sender<EventNotice>>>,
}

impl Connection {
    /// Wrap a transport and start the reader and consumer tasks.
    pub fn attach(transport: Transport, model: &Model, opts: ConnOptions) -> Connection {
        let peer = transport.peer_addr().to_owned();
        let (reader, writer) = transport.split();
        Connection::attach_parts(reader, writer, peer, model, opts, Vec::new(), None)
    }

    /// Wrap pre-split transport halves.
    ///
    /// `backlog` frames are dispatched, in order, before the first transport
    /// read; `peer_meta` pre-resolves the schema signal when the schema was
    /// already obtained out-of-band (proxy admission).
    pub fn attach_parts(
        reader: TransportReader,
        writer: TransportWriter,
        peer: String,
        model: &Model,
        opts: ConnOptions,
        backlog: Vec<String>,
        peer_meta: Option<Arc<Meta>>,
    ) -> Connection {
        let state_capacity = if opts.state_capacity == 0 {
            DEFAULT_CHANNEL_CAPACITY
        } else {
            opts.state_capacity
        };
        let event_capacity = if opts.event_capacity == 0 {
            DEFAULT_CHANNEL_CAPACITY
        } else {
            opts.event_capacity
        };
        let (state_tx, state_rx) = mpsc::channel(state_capacity);
        let (event_tx, event_rx) = mpsc::channel(event_capacity);

        let meta_got = SignalOnce::new();
        if peer_meta.is_some() {
            meta_got.fire();
        }

        let conn = Connection {
            inner: Arc::new(ConnInner {
                model: model.clone(),
                peer,
                writer: Mutex::new(Some(writer)),
                pub_states: RwLock::new(HashSet::new()),
                pub_events: RwLock::new(HashSet::new()),
                waiters: Mutex::new(HashMap::new()),
                meta_slot: Mutex::new(peer_meta.map(Ok)),
                meta_got,
                meta_queried: AtomicBool::new(false),
                closed: SignalOnce::new(),
                close_reason: Mutex::new(String::new()),
                on_close: Mutex::new(opts.on_close),
                on_state: opts.on_state.unwrap_or_else(noop_state_handler),
                on_event: opts.on_event.unwrap_or_else(noop_event_handler),
                on_sub_update: opts.on_sub_update,
                call_router: opts.call_router,
                frame_tap: opts.frame_tap,
                state_tx: Mutex::new(Some(state_tx)),
                event_tx: Mutex::new(Some(event_tx)),
            }),
        };

        model.register(conn.clone());

        let state_task = tokio::spawn(consume_states(state_rx, conn.inner.on_state.clone()));
        let event_task = tokio::spawn(consume_events(event_rx, conn.inner.on_event.clone()));
        tokio::spawn(reader_loop(conn.clone(), reader, backlog, state_task, event_task));

        conn
    }

    pub fn peer_addr(&self) -> &str {
        &self.inner.peer
    }

    /// Identity comparison: do two handles refer to the same connection?
    pub fn ptr_eq(a: &Connection, b: &Connection) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_fired()
    }

    /// Wait until the connection has shut down.
    pub async fn wait_closed(&self) {
        self.inner.closed.fired().await;
    }

    pub async fn close_reason(&self) -> String {
        self.inner.close_reason.lock().await.clone()
    }

    // -----------------------------------------------------------------------
    // Subscription operations
    // -----------------------------------------------------------------------

    /// Replace the peer-side subscription set for our state stream.
    pub async fn sub_state<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.send_sub(SubKind::State, SubOp::Set, collect_names(names)).await
    }

    pub async fn add_sub_state<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.send_sub(SubKind::State, SubOp::Add, collect_names(names)).await
    }

    pub async fn cancel_sub_state<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.send_sub(SubKind::State, SubOp::Remove, collect_names(names)).await
    }

    pub async fn cancel_all_sub_state(&self) -> Result<(), LinkError> {
        self.send_sub(SubKind::State, SubOp::Clear, Vec::new()).await
    }

    pub async fn sub_event<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.send_sub(SubKind::Event, SubOp::Set, collect_names(names)).await
    }

    pub async fn add_sub_event<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.send_sub(SubKind::Event, SubOp::Add, collect_names(names)).await
    }

    pub async fn cancel_sub_event<I>(&self, names: I) -> Result<(), LinkError>
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.send_sub(SubKind::Event, SubOp::Remove, collect_names(names)).await
    }

    pub async fn cancel_all_sub_event(&self) -> Result<(), LinkError> {
        self.send_sub(SubKind::Event, SubOp::Clear, Vec::new()).await
    }

    async fn send_sub(
        &self,
        kind: SubKind,
        mut op: SubOp,
        names: Vec<String>,
    ) -> Result<(), LinkError> {
        self.ensure_open()?;
        // Removing nothing means removing everything on the wire.
        if op == SubOp::Remove && names.is_empty() {
            op = SubOp::Clear;
        }
        let frame = match kind {
            SubKind::State => Frame::SubscribeState { op, names },
            SubKind::Event => Frame::SubscribeEvent { op, names },
        };
        self.send_frame(&frame).await
    }

    // -----------------------------------------------------------------------
    // Calls
    // -----------------------------------------------------------------------

    /// Send a `call` frame and return the waiter for its response.
    ///
    /// On send failure the waiter is deregistered and the error returned.
    pub async fn invoke(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<Waiter, LinkError> {
        self.ensure_open()?;
        let uuid = Uuid::new_v4().to_string();
        let waiter = Waiter::new();
        self.inner
            .waiters
            .lock()
            .await
            .insert(uuid.clone(), waiter.clone());
        let frame = Frame::Call(CallPayload {
            name: full_name.to_owned(),
            uuid: uuid.clone(),
            args,
        });
        if let Err(e) = self.send_frame(&frame).await {
            self.inner.waiters.lock().await.remove(&uuid);
            return Err(e);
        }
        Ok(waiter)
    }

    /// `invoke`, then deliver the response to `on_resp` from a background
    /// task.
    pub async fn invoke_cb<F>(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        on_resp: F,
    ) -> Result<(), LinkError>
    where
        F: FnOnce(Result<CallReply, LinkError>) + Send + 'static,
    {
        let waiter = self.invoke(full_name, args).await?;
        tokio::spawn(async move {
            on_resp(waiter.wait().await);
        });
        Ok(())
    }

    /// As `invoke_cb` with a deadline.  On timeout `on_resp` receives the
    /// `"timeout"` error; the waiter stays registered so a late response is
    /// silently absorbed.
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
        let waiter = self.invoke(full_name, args).await?;
        tokio::spawn(async move {
            on_resp(waiter.wait_for(timeout).await);
        });
        Ok(())
    }

    /// Synchronous form: invoke and wait.
    pub async fn call(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<CallReply, LinkError> {
        self.invoke(full_name, args).await?.wait().await
    }

    /// Synchronous form with a deadline.
    pub async fn call_for(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
        timeout: Duration,
    ) -> Result<CallReply, LinkError> {
        self.invoke(full_name, args).await?.wait_for(timeout).await
    }

    // -----------------------------------------------------------------------
    // Peer schema
    // -----------------------------------------------------------------------

    /// Fetch the peer's schema, querying it over the wire at most once per
    /// connection.  Concurrent and repeated callers share the same result.
    pub async fn peer_meta(&self) -> Result<Arc<Meta>, LinkError> {
        if self.inner.meta_got.is_fired() {
            return self.meta_result().await;
        }
        self.ensure_open()?;
        if !self.inner.meta_queried.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.send_frame(&Frame::QueryMeta).await {
                self.inner.meta_queried.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }
        self.inner.meta_got.fired().await;
        self.meta_result().await
    }

    async fn meta_result(&self) -> Result<Arc<Meta>, LinkError> {
        match &*self.inner.meta_slot.lock().await {
            Some(result) => result.clone(),
            None => Err(LinkError::NilConnection),
        }
    }

    // -----------------------------------------------------------------------
    // Publish-set queries and raw sends (broadcast + routing paths)
    // -----------------------------------------------------------------------

    pub async fn publishes_state(&self, full_name: &str) -> bool {
        self.inner.pub_states.read().await.contains(full_name)
    }

    pub async fn publishes_event(&self, full_name: &str) -> bool {
        self.inner.pub_events.read().await.contains(full_name)
    }

    pub async fn pub_states(&self) -> HashSet<String> {
        self.inner.pub_states.read().await.clone()
    }

    pub async fn pub_events(&self) -> HashSet<String> {
        self.inner.pub_events.read().await.clone()
    }

    /// Send a `state` frame to this peer.
    pub async fn send_state(&self, full_name: &str, data: Value) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.send_frame(&Frame::State(StatePayload {
            name: full_name.to_owned(),
            data,
        }))
        .await
    }

    /// Send an `event` frame to this peer.
    pub async fn send_event(
        &self,
        full_name: &str,
        args: serde_json::Map<String, Value>,
    ) -> Result<(), LinkError> {
        self.ensure_open()?;
        self.send_frame(&Frame::Event(EventPayload {
            name: full_name.to_owned(),
            args,
        }))
        .await
    }

    /// Send a `response` frame to this peer (routing and dispatch paths).
    pub async fn send_response(
        &self,
        uuid: &str,
        error: &str,
        response: CallReply,
    ) -> Result<(), LinkError> {
        self.send_frame(&Frame::Response(ResponsePayload {
            uuid: uuid.to_owned(),
            error: error.to_owned(),
            response: Value::Object(response),
        }))
        .await
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Close the connection.  Idempotent.
    pub async fn close(&self) {
        self.shutdown("active close").await;
    }

    async fn shutdown(&self, reason: &str) {
        if !self.inner.closed.fire() {
            return;
        }
        *self.inner.close_reason.lock().await = reason.to_owned();
        debug!(peer = %self.inner.peer, reason, "connection shutting down");

        // Wake every pending waiter with the close reason.
        let drained: Vec<Waiter> = {
            let mut waiters = self.inner.waiters.lock().await;
            waiters.drain().map(|(_, w)| w).collect()
        };
        for waiter in drained {
            waiter
                .resolve(Err(LinkError::Closed(reason.to_owned())))
                .await;
        }

        // Anyone blocked on the schema gets the same verdict.
        {
            let mut slot = self.inner.meta_slot.lock().await;
            if slot.is_none() {
                *slot = Some(Err(LinkError::Closed(reason.to_owned())));
            }
            self.inner.meta_got.fire();
        }

        if let Some(mut writer) = self.inner.writer.lock().await.take() {
            writer.close().await;
        }

        self.inner.model.detach(self);

        if let Some(cb) = self.inner.on_close.lock().await.take() {
            cb(reason);
        }
    }

    fn ensure_open(&self) -> Result<(), LinkError> {
        if self.inner.closed.is_fired() {
            Err(LinkError::NilConnection)
        } else {
            Ok(())
        }
    }

    async fn send_frame(&self, frame: &Frame) -> Result<(), LinkError> {
        let text = frame.encode().map_err(|e| LinkError::Encode(e.to_string()))?;
        let mut guard = self.inner.writer.lock().await;
        let writer = guard.as_mut().ok_or(LinkError::NilConnection)?;
        if let Some(tap) = &self.inner.frame_tap {
            tap(FrameDirection::Outbound, &text);
        }
        writer.write_message(&text).await
    }

    // -----------------------------------------------------------------------
    // Inbound dispatch
    // -----------------------------------------------------------------------

    /// Dispatch one raw frame.  Returns the close reason when the frame is
    /// fatal to the connection (envelope-level decode failure).
    async fn dispatch_text(&self, text: &str) -> Option<String> {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(err @ DecodeError::Envelope(_)) => return Some(err.to_string()),
            Err(err) => {
                debug!(peer = %self.inner.peer, error = %err, "dropping frame");
                return None;
            }
        };
        match frame {
            Frame::SubscribeState { op, names } => self.apply_sub(SubKind::State, op, names).await,
            Frame::SubscribeEvent { op, names } => self.apply_sub(SubKind::Event, op, names).await,
            Frame::State(payload) => self.enqueue_state(payload).await,
            Frame::Event(payload) => self.enqueue_event(payload).await,
            Frame::Call(payload) => {
                let conn = self.clone();
                tokio::spawn(async move { conn.handle_call(payload).await });
            }
            Frame::Response(payload) => self.handle_response(payload).await,
            Frame::QueryMeta => self.handle_query_meta().await,
            Frame::MetaInfo(doc) => self.handle_meta_info(doc).await,
        }
        None
    }

    async fn apply_sub(&self, kind: SubKind, op: SubOp, names: Vec<String>) {
        let table = match kind {
            SubKind::State => &self.inner.pub_states,
            SubKind::Event => &self.inner.pub_events,
        };
        let snapshot = {
            let mut set = table.write().await;
            match op {
                SubOp::Set => {
                    set.clear();
                    set.extend(names);
                }
                SubOp::Add => set.extend(names),
                SubOp::Remove => {
                    for name in &names {
                        set.remove(name);
                    }
                }
                SubOp::Clear => set.clear(),
            }
            set.clone()
        };
        if let Some(cb) = &self.inner.on_sub_update {
            cb(SubChange {
                kind,
                names: snapshot,
            });
        }
    }

    async fn enqueue_state(&self, payload: StatePayload) {
        let name = payload.name.trim();
        if name.is_empty() || payload.data.is_null() {
            return;
        }
        let Some((model, local)) = split_full_name(name) else {
            return;
        };
        let update = StateUpdate {
            model: model.to_owned(),
            name: local.to_owned(),
            full_name: name.to_owned(),
            data: payload.data,
        };
        let tx = self.inner.state_tx.lock().await.clone();
        if let Some(tx) = tx {
            // A full channel blocks the reader: backpressure to the peer.
            let _ = tx.send(update).await;
        }
    }

    async fn enqueue_event(&self, payload: EventPayload) {
        let name = payload.name.trim();
        if name.is_empty() {
            return;
        }
        let Some((model, local)) = split_full_name(name) else {
            return;
        };
        let notice = EventNotice {
            model: model.to_owned(),
            name: local.to_owned(),
            full_name: name.to_owned(),
            args: payload.args,
        };
        let tx = self.inner.event_tx.lock().await.clone();
        if let Some(tx) = tx {
            let _ = tx.send(notice).await;
        }
    }

    async fn handle_call(&self, payload: CallPayload) {
        let uuid = payload.uuid.trim().to_owned();
        if uuid.is_empty() {
            return;
        }
        let Some((model_name, method)) = split_full_name(&payload.name) else {
            self.respond_call(&uuid, "fullName is invalid format", CallReply::new())
                .await;
            return;
        };

        let host = &self.inner.model;
        if model_name != host.name() {
            if let Some(router) = &self.inner.call_router {
                router(self.clone(), payload);
                return;
            }
            self.respond_call(
                &uuid,
                &format!("modelName {model_name:?}: unmatched"),
                CallReply::new(),
            )
            .await;
            return;
        }

        if let Err(e) = host.meta().verify_method_args(method, &payload.args) {
            self.respond_call(&uuid, &e.to_string(), CallReply::new()).await;
            return;
        }

        let Some(handler) = host.on_call() else {
            self.respond_call(&uuid, "NO callback", CallReply::new()).await;
            return;
        };

        let request = CallRequest {
            name: method.to_owned(),
            args: payload.args,
        };
        let response = match AssertUnwindSafe(handler(request)).catch_unwind().await {
            Ok(response) => response,
            Err(_) => {
                error!(peer = %self.inner.peer, method, "method handler panicked");
                self.respond_call(&uuid, "method handler panicked", CallReply::new())
                    .await;
                return;
            }
        };

        if host.verify_resp() {
            if let Err(e) = host.meta().verify_method_resp(method, &response) {
                self.respond_call(&uuid, &e.to_string(), CallReply::new()).await;
                return;
            }
        }

        self.respond_call(&uuid, "", response).await;
    }

    async fn respond_call(&self, uuid: &str, error: &str, response: CallReply) {
        if let Err(e) = self.send_response(uuid, error, response).await {
            debug!(peer = %self.inner.peer, error = %e, "call response send failed");
        }
    }

    async fn handle_response(&self, payload: ResponsePayload) {
        let uuid = payload.uuid.trim();
        if uuid.is_empty() {
            return;
        }
        let Value::Object(response) = payload.response else {
            return;
        };
        // Atomic remove-on-resolve: a late duplicate finds nothing.
        let Some(waiter) = self.inner.waiters.lock().await.remove(uuid) else {
            return;
        };
        let error = payload.error.trim();
        if error.is_empty() {
            waiter.resolve(Ok(response)).await;
        } else {
            waiter.resolve(Err(LinkError::Remote(error.to_owned()))).await;
        }
    }

    async fn handle_query_meta(&self) {
        let doc = self.inner.model.meta_json();
        if let Err(e) = self.send_frame(&Frame::MetaInfo(doc)).await {
            debug!(peer = %self.inner.peer, error = %e, "meta-info reply failed");
        }
    }

    async fn handle_meta_info(&self, doc: Value) {
        let mut slot = self.inner.meta_slot.lock().await;
        if self.inner.meta_got.is_fired() {
            // Only the first meta-info is honored.
            return;
        }
        *slot = Some(Meta::parse(&doc).map(Arc::new).map_err(LinkError::from));
        self.inner.meta_got.fire();
    }
}

fn collect_names<I>(names: I) -> Vec<String>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    names.into_iter().map(Into::into).collect()
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn reader_loop(
    conn: Connection,
    mut reader: TransportReader,
    backlog: Vec<String>,
    state_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
) {
    let reason: String = 'run: {
        // Frames buffered before this connection existed (proxy admission)
        // are replayed first, preserving per-connection arrival order.
        for text in backlog {
            if let Some(reason) = conn.dispatch_text(&text).await {
                break 'run reason;
            }
        }
        loop {
            tokio::select! {
                biased;
                _ = conn.inner.closed.fired() => break 'run "active close".to_owned(),
                msg = reader.read_message() => match msg {
                    Ok(Some(text)) => {
                        if let Some(tap) = &conn.inner.frame_tap {
                            tap(FrameDirection::Inbound, &text);
                        }
                        if let Some(reason) = conn.dispatch_text(&text).await {
                            break 'run reason;
                        }
                    }
                    Ok(None) => break 'run "EOF".to_owned(),
                    Err(e) => break 'run e.to_string(),
                },
            }
        }
    };

    // Close both broadcast channels and wait for the consumers to drain
    // before completing shutdown, so the user handlers never run against a
    // connection that has already finished closing.
    drop(conn.inner.state_tx.lock().await.take());
    drop(conn.inner.event_tx.lock().await.take());
    let _ = state_task.await;
    let _ = event_task.await;

    conn.shutdown(&reason).await;
}

async fn consume_states(mut rx: mpsc::Receiver<StateUpdate>, handler: StateHandler) {
    while let Some(update) = rx.recv().await {
        if AssertUnwindSafe(handler(update)).catch_unwind().await.is_err() {
            warn!("state handler panicked");
        }
    }
}

async fn consume_events(mut rx: mpsc::Receiver<EventNotice>, handler: EventHandler) {
    while let Some(notice) = rx.recv().await {
        if AssertUnwindSafe(handler(notice)).catch_unwind().await.is_err() {
            warn!("event handler panicked");
        }
    }
}
