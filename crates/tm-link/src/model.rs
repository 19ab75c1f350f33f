//! The thing-model host: local schema, attached connections, broadcast
//! fan-out, and the accept loops that grow the connection set.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use tm_meta::Meta;

use crate::conn::{CallRequest, ConnOptions, Connection};
use crate::transport::Transport;
use crate::waiter::CallReply;
use crate::LinkError;

/// The host's method dispatcher.  Invoked on a fresh task per inbound call;
/// returns the response object (verified against the schema when the host
/// has `verify_resp` set).
pub type CallHandler = Arc<dyn Fn(CallRequest) -> BoxFuture<'static, CallReply> + Send + Sync>;

/// Host-level configuration.
#[derive(Default)]
pub struct ModelOptions {
    pub on_call: Option<CallHandler>,
    /// Verify method responses against the schema before sending.
    pub verify_resp: bool,
}

/// A named actor owning a schema and a set of peer connections.
///
/// Cheap to clone; all clones share the connection set.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

struct ModelInner {
    meta: Arc<Meta>,
    on_call: Option<CallHandler>,
    verify_resp: bool,
    conns: Mutex<Vec<Connection>>,
}

impl Model {
    pub fn new(meta: Meta, opts: ModelOptions) -> Model {
        Model {
            inner: Arc::new(ModelInner {
                meta: Arc::new(meta),
                on_call: opts.on_call,
                verify_resp: opts.verify_resp,
                conns: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.meta.name()
    }

    pub fn meta(&self) -> &Meta {
        &self.inner.meta
    }

    /// The raw schema document, as answered to `query-meta`.
    pub fn meta_json(&self) -> Value {
        self.inner.meta.to_json().clone()
    }

    pub(crate) fn on_call(&self) -> Option<CallHandler> {
        self.inner.on_call.clone()
    }

    pub(crate) fn verify_resp(&self) -> bool {
        self.inner.verify_resp
    }

    /// Snapshot of the currently attached connections.
    pub fn connections(&self) -> Vec<Connection> {
        self.lock_conns().clone()
    }

    pub(crate) fn register(&self, conn: Connection) {
        self.lock_conns().push(conn);
    }

    pub(crate) fn detach(&self, conn: &Connection) {
        self.lock_conns().retain(|c| !Connection::ptr_eq(c, conn));
    }

    fn lock_conns(&self) -> std::sync::MutexGuard<'_, Vec<Connection>> {
        self.inner
            .conns
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Broadcasts
    // -----------------------------------------------------------------------

    /// Publish a state value to every attached peer that subscribed to it.
    ///
    /// With `verify` set, the value is checked against the declared state
    /// type first; a verification error aborts the whole push.
    pub async fn push_state(&self, name: &str, data: Value, verify: bool) -> Result<(), LinkError> {
        if verify {
            self.inner.meta.verify_state(name, &data)?;
        }
        let full = format!("{}/{}", self.name(), name);
        for conn in self.connections() {
            if conn.publishes_state(&full).await {
                if let Err(e) = conn.send_state(&full, data.clone()).await {
                    debug!(peer = %conn.peer_addr(), error = %e, "state push failed");
                }
            }
        }
        Ok(())
    }

    /// Publish an event to every attached peer that subscribed to it.
    pub async fn push_event(
        &self,
        name: &str,
        args: serde_json::Map<String, Value>,
        verify: bool,
    ) -> Result<(), LinkError> {
        if verify {
            self.inner.meta.verify_event_args(name, &args)?;
        }
        let full = format!("{}/{}", self.name(), name);
        for conn in self.connections() {
            if conn.publishes_event(&full).await {
                if let Err(e) = conn.send_event(&full, args.clone()).await {
                    debug!(peer = %conn.peer_addr(), error = %e, "event push failed");
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Outbound and inbound links
    // -----------------------------------------------------------------------

    /// Open a transport to a peer and attach it.
    pub async fn dial(&self, addr: &str, opts: ConnOptions) -> Result<Connection, LinkError> {
        let transport = Transport::dial(addr).await?;
        Ok(Connection::attach(transport, self, opts))
    }
}

// ---------------------------------------------------------------------------
// Accept loops
// ---------------------------------------------------------------------------

/// A TCP accept loop attaching every inbound peer to `model`.
pub struct TcpServer {
    listener: TcpListener,
    addr: SocketAddr,
    model: Model,
}

impl TcpServer {
    /// Bind the listener (use port 0 to let the OS choose).
    pub async fn bind(model: &Model, addr: &str) -> std::io::Result<TcpServer> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, model = %model.name(), "tcp listener bound");
        Ok(TcpServer {
            listener,
            addr,
            model: model.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Run the accept loop.  Consumes `self`; runs until the listener errors.
    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    debug!(%peer, "peer connected");
                    let transport = Transport::accept_tcp(stream, peer);
                    Connection::attach(transport, &self.model, ConnOptions::default());
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }
}

/// A WebSocket accept loop attaching every inbound peer to `model`.
pub struct WsServer {
    listener: TcpListener,
    addr: SocketAddr,
    model: Model,
}

impl WsServer {
    pub async fn bind(model: &Model, addr: &str) -> std::io::Result<WsServer> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        info!(%addr, model = %model.name(), "ws listener bound");
        Ok(WsServer {
            listener,
            addr,
            model: model.clone(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let model = self.model.clone();
                    // The WS handshake can stall; keep it off the accept path.
                    tokio::spawn(async move {
                        match Transport::accept_ws(stream, peer).await {
                            Ok(transport) => {
                                Connection::attach(transport, &model, ConnOptions::default());
                            }
                            Err(e) => warn!(%peer, error = %e, "ws handshake failed"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }
}
