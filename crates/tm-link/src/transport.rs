//! Framed peer transports.
//!
//! Two interchangeable carriers, both moving one JSON frame per transport
//! message: raw TCP with length-prefixed packets, and WebSocket text
//! messages.  A [`Transport`] splits into a reader half (owned by the
//! connection's reader task) and a writer half (behind the connection's
//! write lock), so a frame can never be interleaved with another.

use std::net::SocketAddr;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::LinkError;

type TcpFramed = Framed<TcpStream, LengthDelimitedCodec>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One peer link, before it is handed to a connection.
pub struct Transport {
    kind: TransportKind,
    peer: String,
}

enum TransportKind {
    Tcp(TcpFramed),
    Ws(Box<WsStream>),
}

impl Transport {
    /// Dial by address: `ws://` / `wss://` URLs go over WebSocket, anything
    /// else is treated as a `host:port` TCP target.
    pub async fn dial(addr: &str) -> Result<Transport, LinkError> {
        if addr.starts_with("ws://") || addr.starts_with("wss://") {
            Transport::dial_ws(addr).await
        } else {
            Transport::dial_tcp(addr).await
        }
    }

    pub async fn dial_tcp(addr: &str) -> Result<Transport, LinkError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| LinkError::Connect {
                addr: addr.to_owned(),
                detail: e.to_string(),
            })?;
        Ok(Transport {
            kind: TransportKind::Tcp(Framed::new(stream, LengthDelimitedCodec::new())),
            peer: addr.to_owned(),
        })
    }

    pub async fn dial_ws(url: &str) -> Result<Transport, LinkError> {
        let (ws, _response) =
            tokio_tungstenite::connect_async(url)
                .await
                .map_err(|e| LinkError::Connect {
                    addr: url.to_owned(),
                    detail: e.to_string(),
                })?;
        Ok(Transport {
            kind: TransportKind::Ws(Box::new(ws)),
            peer: url.to_owned(),
        })
    }

    /// Wrap an accepted TCP stream.
    pub fn accept_tcp(stream: TcpStream, peer: SocketAddr) -> Transport {
        Transport {
            kind: TransportKind::Tcp(Framed::new(stream, LengthDelimitedCodec::new())),
            peer: peer.to_string(),
        }
    }

    /// Perform the server side of the WebSocket handshake on an accepted
    /// TCP stream.
    pub async fn accept_ws(stream: TcpStream, peer: SocketAddr) -> Result<Transport, LinkError> {
        let ws = tokio_tungstenite::accept_async(MaybeTlsStream::Plain(stream))
            .await
            .map_err(|e| LinkError::Connect {
                addr: peer.to_string(),
                detail: e.to_string(),
            })?;
        Ok(Transport {
            kind: TransportKind::Ws(Box::new(ws)),
            peer: peer.to_string(),
        })
    }

    /// The remote address (or URL) this transport is linked to.
    pub fn peer_addr(&self) -> &str {
        &self.peer
    }

    pub fn split(self) -> (TransportReader, TransportWriter) {
        match self.kind {
            TransportKind::Tcp(framed) => {
                let (sink, stream) = framed.split();
                (TransportReader::Tcp(stream), TransportWriter::Tcp(sink))
            }
            TransportKind::Ws(ws) => {
                let (sink, stream) = (*ws).split();
                (TransportReader::Ws(stream), TransportWriter::Ws(sink))
            }
        }
    }
}

/// Receiving half; exactly one task may read at a time.
pub enum TransportReader {
    Tcp(SplitStream<TcpFramed>),
    Ws(SplitStream<WsStream>),
}

impl TransportReader {
    /// Pull the next text frame.  `Ok(None)` means the peer closed cleanly
    /// (EOF or a WebSocket close frame).
    pub async fn read_message(&mut self) -> Result<Option<String>, LinkError> {
        match self {
            TransportReader::Tcp(stream) => match stream.next().await {
                None => Ok(None),
                Some(Err(e)) => Err(LinkError::Transport(e.to_string())),
                Some(Ok(buf)) => String::from_utf8(buf.to_vec())
                    .map(Some)
                    .map_err(|e| LinkError::Transport(format!("invalid utf-8 frame: {e}"))),
            },
            TransportReader::Ws(stream) => loop {
                match stream.next().await {
                    None => return Ok(None),
                    Some(Err(e)) => return Err(LinkError::Transport(e.to_string())),
                    Some(Ok(Message::Text(text))) => return Ok(Some(text.as_str().to_owned())),
                    Some(Ok(Message::Close(_))) => return Ok(None),
                    // Pings are answered by the protocol layer on the next
                    // flush; binary frames are not part of this protocol.
                    Some(Ok(_)) => continue,
                }
            },
        }
    }
}

/// Sending half; serialized behind the connection's write lock.
pub enum TransportWriter {
    Tcp(SplitSink<TcpFramed, Bytes>),
    Ws(SplitSink<WsStream, Message>),
}

impl TransportWriter {
    pub async fn write_message(&mut self, text: &str) -> Result<(), LinkError> {
        match self {
            TransportWriter::Tcp(sink) => sink
                .send(Bytes::copy_from_slice(text.as_bytes()))
                .await
                .map_err(|e| LinkError::Transport(e.to_string())),
            TransportWriter::Ws(sink) => sink
                .send(Message::Text(text.to_owned().into()))
                .await
                .map_err(|e| LinkError::Transport(e.to_string())),
        }
    }

    pub async fn close(&mut self) {
        match self {
            TransportWriter::Tcp(sink) => {
                let _ = SinkExt::close(sink).await;
            }
            TransportWriter::Ws(sink) => {
                let _ = SinkExt::close(sink).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn tcp_frames_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            Transport::dial_tcp(&addr.to_string()).await.unwrap()
        });
        let (stream, peer) = listener.accept().await.unwrap();
        let server = Transport::accept_tcp(stream, peer);
        let client = client.await.unwrap();

        let (mut crd, mut cwr) = client.split();
        let (mut srd, mut swr) = server.split();

        cwr.write_message(r#"{"type":"query-meta","payload":{}}"#)
            .await
            .unwrap();
        let got = srd.read_message().await.unwrap().unwrap();
        assert_eq!(got, r#"{"type":"query-meta","payload":{}}"#);

        swr.write_message("pong").await.unwrap();
        assert_eq!(crd.read_message().await.unwrap().unwrap(), "pong");

        // Closing the writer surfaces EOF on the other side.
        cwr.close().await;
        assert!(srd.read_message().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ws_frames_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            Transport::accept_ws(stream, peer).await.unwrap()
        });
        let client = Transport::dial_ws(&format!("ws://{addr}")).await.unwrap();
        let server = server.await.unwrap();

        let (_crd, mut cwr) = client.split();
        let (mut srd, _swr) = server.split();

        cwr.write_message("hello").await.unwrap();
        assert_eq!(srd.read_message().await.unwrap().unwrap(), "hello");

        cwr.close().await;
        assert!(srd.read_message().await.unwrap().is_none());
    }
}
