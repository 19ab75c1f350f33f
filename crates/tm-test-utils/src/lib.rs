// tm-test-utils: A scriptable mock peer for integration testing.
//
// Binds a length-framed TCP listener on a random port and hands each
// accepted connection to the test as a MockConn: receive frames with a
// timeout, send raw or typed frames, or drop the link to simulate a
// transport failure.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc, watch};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use tm_protocol::Frame;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A mock protocol peer for integration testing.
///
/// Each test spins up its own isolated instance on port 0.  When built with
/// [`MockPeer::start_with_meta`], every connection auto-answers `query-meta`
/// with the given schema document; all other inbound frames are surfaced to
/// the test through [`MockConn`].
pub struct MockPeer {
    addr: SocketAddr,
    incoming: Mutex<mpsc::UnboundedReceiver<MockConn>>,
    task: tokio::task::JoinHandle<()>,
}

impl MockPeer {
    pub async fn start() -> MockPeer {
        MockPeer::start_inner(None).await
    }

    pub async fn start_with_meta(meta: Value) -> MockPeer {
        MockPeer::start_inner(Some(meta)).await
    }

    async fn start_inner(meta: Option<Value>) -> MockPeer {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(accept_loop(listener, conn_tx, meta));
        MockPeer {
            addr,
            incoming: Mutex::new(conn_rx),
            task,
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// The `host:port` dial target for this peer.
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }

    /// Wait for the next inbound connection (5 s limit).
    pub async fn accept(&self) -> MockConn {
        tokio::time::timeout(RECV_TIMEOUT, self.incoming.lock().await.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("accept loop stopped")
    }

    /// Like [`MockPeer::accept`], but gives up after `wait` instead of
    /// panicking.  Used to assert that *no* connection arrives.
    pub async fn try_accept(&self, wait: Duration) -> Option<MockConn> {
        tokio::time::timeout(wait, self.incoming.lock().await.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for MockPeer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One accepted connection, driven from the test.
///
/// Dropping the handle closes the link, as does [`MockConn::drop_link`].
pub struct MockConn {
    out_tx: mpsc::UnboundedSender<String>,
    in_rx: mpsc::UnboundedReceiver<String>,
    shutdown: watch::Sender<bool>,
}

impl MockConn {
    /// Queue raw text to be sent as one frame.
    pub fn send_raw(&self, text: impl Into<String>) {
        let _ = self.out_tx.send(text.into());
    }

    pub fn send_frame(&self, frame: &Frame) {
        self.send_raw(frame.encode().expect("frame encode"));
    }

    /// Next raw inbound frame, or `None` if the link closed or 5 s elapsed.
    pub async fn recv_raw(&mut self) -> Option<String> {
        tokio::time::timeout(RECV_TIMEOUT, self.in_rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next inbound frame, decoded.  Panics on undecodable input -- the
    /// mock's callers always speak the protocol.
    pub async fn recv_frame(&mut self) -> Option<Frame> {
        self.recv_raw()
            .await
            .map(|text| Frame::decode(&text).expect("frame decode"))
    }

    /// Tear the transport down, as a network failure would.
    pub fn drop_link(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    conn_tx: mpsc::UnboundedSender<MockConn>,
    meta: Option<Value>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                let conn_tx = conn_tx.clone();
                let meta = meta.clone();
                tokio::spawn(async move {
                    serve_conn(stream, &conn_tx, meta).await;
                });
            }
            Err(_) => break,
        }
    }
}

async fn serve_conn(
    stream: TcpStream,
    conn_tx: &mpsc::UnboundedSender<MockConn>,
    meta: Option<Value>,
) {
    let framed = Framed::new(stream, LengthDelimitedCodec::new());
    let (mut sink, mut frames) = framed.split();

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    if conn_tx
        .send(MockConn {
            out_tx,
            in_rx,
            shutdown: shutdown_tx,
        })
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() { break; }
            }
            out = out_rx.recv() => match out {
                Some(text) => {
                    if sink.send(Bytes::from(text)).await.is_err() { break; }
                }
                // The test dropped its MockConn: close the link.
                None => break,
            },
            inbound = frames.next() => match inbound {
                Some(Ok(buf)) => {
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    let is_query = matches!(Frame::decode(&text), Ok(Frame::QueryMeta));
                    match (&meta, is_query) {
                        (Some(doc), true) => {
                            let reply = Frame::MetaInfo(doc.clone())
                                .encode()
                                .expect("meta-info encode");
                            if sink.send(Bytes::from(reply)).await.is_err() { break; }
                        }
                        _ => {
                            let _ = in_tx.send(text);
                        }
                    }
                }
                _ => break,
            },
        }
    }
    // Dropping the sink half closes the socket.
}
