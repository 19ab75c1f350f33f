// tm-link: Core fabric — connections, hosts, and the reconnect supervisor.

pub mod autolink;
pub mod conn;
pub mod error;
pub mod model;
pub mod peer;
pub mod signal;
pub mod transport;
pub mod waiter;

pub use autolink::{AutoLink, AutoLinkOptions, ReconnectHook, RetryPolicy};
pub use conn::{
    CallRequest, CallRouterFn, CloseHandler, ConnOptions, Connection, EventHandler, EventNotice,
    FrameDirection, FrameTap, StateHandler, StateUpdate, SubChange, SubKind, SubUpdateHandler,
    DEFAULT_CHANNEL_CAPACITY,
};
pub use error::LinkError;
pub use model::{CallHandler, Model, ModelOptions, TcpServer, WsServer};
pub use peer::PeerOps;
pub use signal::SignalOnce;
pub use transport::{Transport, TransportReader, TransportWriter};
pub use waiter::{CallReply, Waiter};
