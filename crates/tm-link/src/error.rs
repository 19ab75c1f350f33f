use tm_meta::MetaError;

/// Errors surfaced by connection and supervisor operations.
///
/// Display strings are part of the protocol surface: peers and callers match
/// on `"nil connection"`, `"timeout"` and the `"connection closed for:"`
/// prefix.
#[derive(Debug, Clone, thiserror::Error)]
pub enum LinkError {
    /// No live connection to operate on (closed, or never established).
    #[error("nil connection")]
    NilConnection,
    /// A deadline elapsed before the peer answered.
    #[error("timeout")]
    Timeout,
    /// The connection shut down; the reason is the close reason.
    #[error("connection closed for: {0}")]
    Closed(String),
    #[error("connect {addr}: {detail}")]
    Connect { addr: String, detail: String },
    #[error("transport: {0}")]
    Transport(String),
    #[error("encode json: {0}")]
    Encode(String),
    /// The peer answered a call with a non-empty error string.
    #[error("{0}")]
    Remote(String),
    /// Local schema verification failed.
    #[error(transparent)]
    Meta(#[from] MetaError),
}
