//! The single authenticated WebSocket connecting this process to the relay.
//!
//! Grounded in `sshx::transport::WebSocketTransport`: a `connect_async`
//! handshake, a split sink/stream pair where the write half is held behind a
//! mutex for serialization, and a background reader task that demultiplexes
//! incoming frames onto an mpsc channel the rest of the crate drains.

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};

/// A single logical frame delivered over the tunnel, tagged with its kind so
/// the RPC peer and the stream mux can each claim the frames meant for them
/// without parsing the other's payload.
#[derive(Debug, Clone)]
pub enum Frame {
    /// A UTF-8 JSON-RPC 2.0 envelope.
    Rpc(Bytes),
    /// A binary stream data frame: `(stream_id, sequence, payload)`. An empty
    /// `payload` signals EOF/close for that stream.
    Stream(u32, u32, Bytes),
}

const TAG_RPC: u8 = 0x01;
const TAG_STREAM: u8 = 0x02;

impl Frame {
    /// Encode this frame as the bytes of a WebSocket binary message.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Rpc(payload) => {
                let mut buf = Vec::with_capacity(1 + payload.len());
                buf.push(TAG_RPC);
                buf.extend_from_slice(payload);
                buf
            }
            Frame::Stream(id, seq, payload) => {
                let mut buf = Vec::with_capacity(9 + payload.len());
                buf.push(TAG_STREAM);
                buf.extend_from_slice(&id.to_le_bytes());
                buf.extend_from_slice(&seq.to_le_bytes());
                buf.extend_from_slice(payload);
                buf
            }
        }
    }

    /// Decode the bytes of a WebSocket binary message into a frame.
    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        let (&tag, rest) = bytes
            .split_first()
            .ok_or_else(|| Error::Protocol("empty frame".into()))?;
        match tag {
            TAG_RPC => Ok(Frame::Rpc(Bytes::copy_from_slice(rest))),
            TAG_STREAM => {
                if rest.len() < 8 {
                    return Err(Error::Protocol("stream frame too short".into()));
                }
                let id = u32::from_le_bytes(rest[0..4].try_into().unwrap());
                let seq = u32::from_le_bytes(rest[4..8].try_into().unwrap());
                let payload = Bytes::copy_from_slice(&rest[8..]);
                Ok(Frame::Stream(id, seq, payload))
            }
            other => Err(Error::Protocol(format!("unknown frame tag {other}"))),
        }
    }
}

/// Initial handshake frame, sent once immediately after the WebSocket opens.
#[derive(Serialize, Deserialize)]
struct AuthFrame {
    session_id: String,
    session_token: String,
}

#[derive(Serialize, Deserialize)]
struct AuthAck {
    ok: bool,
    #[serde(default)]
    reason: Option<String>,
}

type WsSink = futures_util::stream::SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// The authenticated WebSocket tunnel to the relay.
///
/// `Send`/`Recv` preserve frame boundaries and FIFO ordering in each
/// direction; `Close` is idempotent and unblocks any in-flight `Recv` with
/// [`Error::Closed`].
pub struct Tunnel {
    write: Mutex<Option<WsSink>>,
    inbound: Mutex<mpsc::Receiver<Result<Frame>>>,
    reader_task: tokio::task::JoinHandle<()>,
}

impl Tunnel {
    /// Dial the relay for `connection`, perform the auth handshake, and
    /// return a ready-to-use tunnel.
    pub async fn dial(connection: &Connection) -> Result<Self> {
        let url = connection
            .uri("connect")
            .map_err(|e| Error::Dial(e.to_string()))?;
        Self::dial_url(&url, connection).await
    }

    /// Dial a specific WebSocket `url` directly, skipping the RelayURI
    /// derivation in [`Tunnel::dial`]. Used by tests to connect to a loopback
    /// relay stand-in; `connection` still supplies the auth frame's
    /// credentials.
    pub(crate) async fn dial_url(url: &str, connection: &Connection) -> Result<Self> {
        debug!(%url, "dialing relay tunnel");
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;

        let (mut write, mut read) = ws.split();

        let auth = AuthFrame {
            session_id: connection.session_id().to_string(),
            session_token: connection.session_token().to_string(),
        };
        let auth_json = serde_json::to_vec(&auth).map_err(|e| Error::Dial(e.to_string()))?;
        write
            .send(Message::Binary(Frame::Rpc(Bytes::from(auth_json)).encode()))
            .await
            .map_err(|e| Error::Dial(e.to_string()))?;

        let ack_msg = read
            .next()
            .await
            .ok_or_else(|| Error::Dial("relay closed before acknowledging auth".into()))?
            .map_err(|e| Error::Dial(e.to_string()))?;
        let ack_bytes = match ack_msg {
            Message::Binary(b) => b,
            Message::Close(_) => return Err(Error::Auth("relay closed during handshake".into())),
            other => return Err(Error::Dial(format!("unexpected handshake message: {other:?}"))),
        };
        let ack: AuthAck = match Frame::decode(&ack_bytes)? {
            Frame::Rpc(payload) => {
                serde_json::from_slice(&payload).map_err(|e| Error::Auth(e.to_string()))?
            }
            Frame::Stream(..) => {
                return Err(Error::Auth("expected auth ack, got stream frame".into()))
            }
        };
        if !ack.ok {
            return Err(Error::Auth(ack.reason.unwrap_or_else(|| "rejected".into())));
        }

        let (tx, rx) = mpsc::channel(256);
        let reader_task = tokio::spawn(reader_loop(read, tx));

        Ok(Self {
            write: Mutex::new(Some(write)),
            inbound: Mutex::new(rx),
            reader_task,
        })
    }

    /// Send one logical frame. Blocks only on flow control.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        let mut guard = self.write.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(Error::Closed);
        };
        sink.send(Message::Binary(frame.encode()))
            .await
            .map_err(|e| Error::Protocol(e.to_string()))
    }

    /// Receive one logical frame. Returns [`Error::Closed`] once the peer
    /// closes or the tunnel is closed locally.
    pub async fn recv(&self) -> Result<Frame> {
        let mut guard = self.inbound.lock().await;
        match guard.recv().await {
            Some(frame) => frame,
            None => Err(Error::Closed),
        }
    }

    /// Idempotent close: drops the write half and aborts the reader task, so
    /// any in-flight `recv` unblocks with [`Error::Closed`].
    pub async fn close(&self) {
        self.write.lock().await.take();
        self.reader_task.abort();
    }
}

async fn reader_loop(
    mut read: futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    tx: mpsc::Sender<Result<Frame>>,
) {
    while let Some(msg) = read.next().await {
        match msg {
            Ok(Message::Binary(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => {
                    if tx.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed frame");
                }
            },
            Ok(Message::Close(_)) => {
                debug!("relay closed the tunnel");
                break;
            }
            Ok(_) => {} // text/ping/pong frames are not used on this wire
            Err(e) => {
                warn!(error = %e, "tunnel read error");
                break;
            }
        }
    }
    // Closing the sender causes subsequent `recv` calls to observe `Error::Closed`.
    drop(tx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrips_rpc() {
        let original = Frame::Rpc(Bytes::from_static(b"{\"jsonrpc\":\"2.0\"}"));
        let encoded = original.encode();
        match Frame::decode(&encoded).unwrap() {
            Frame::Rpc(payload) => assert_eq!(&payload[..], b"{\"jsonrpc\":\"2.0\"}"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn frame_roundtrips_stream_with_sequence() {
        let original = Frame::Stream(7, 42, Bytes::from_static(b"payload"));
        let encoded = original.encode();
        match Frame::decode(&encoded).unwrap() {
            Frame::Stream(id, seq, payload) => {
                assert_eq!(id, 7);
                assert_eq!(seq, 42);
                assert_eq!(&payload[..], b"payload");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn empty_stream_payload_is_eof_marker() {
        let original = Frame::Stream(1, 0, Bytes::new());
        let encoded = original.encode();
        match Frame::decode(&encoded).unwrap() {
            Frame::Stream(_, _, payload) => assert!(payload.is_empty()),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decode_rejects_empty_bytes() {
        assert!(Frame::decode(&[]).is_err());
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        assert!(Frame::decode(&[0xFF, 1, 2, 3]).is_err());
    }

    #[test]
    fn decode_rejects_truncated_stream_frame() {
        assert!(Frame::decode(&[TAG_STREAM, 1, 2, 3]).is_err());
    }
}
