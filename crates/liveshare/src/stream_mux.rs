//! Named binary sub-channels opened on demand over the tunnel.
//!
//! Grounded in `sshx::transport::WebSocketTransport::channel`'s
//! stream-forwarding plumbing (`mpsc` channel per logical stream, fed by a
//! single shared reader), generalized from one fixed terminal channel to
//! arbitrarily many independently named streams.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::rpc::RpcPeer;
use crate::tunnel::{Frame, Tunnel};

const MAX_FRAME_PAYLOAD: usize = 16 * 1024;

/// Per-stream inbound buffering. `Delivery::Eof` signals a clean close; the
/// channel's sender being dropped without one (`reset_all`, on tunnel
/// failure) signals an abnormal reset.
enum Delivery {
    Data(Bytes),
    Eof,
}

struct StreamEntry {
    /// Unbounded: handing a frame off here from the shared reader task must
    /// never block, or one slow stream would starve every other stream
    /// sharing the tunnel.
    inbound_tx: mpsc::UnboundedSender<Delivery>,
}

/// Opens and demultiplexes named binary sub-channels over a single
/// [`Tunnel`].
pub struct StreamMux {
    tunnel: Arc<Tunnel>,
    streams: DashMap<u32, StreamEntry>,
    next_stream_id: AtomicU32,
}

#[derive(Serialize)]
struct GetStreamParams<'a> {
    name: &'a str,
    condition: &'a str,
}

impl StreamMux {
    pub fn new(tunnel: Arc<Tunnel>) -> Self {
        Self {
            tunnel,
            streams: DashMap::new(),
            next_stream_id: AtomicU32::new(1),
        }
    }

    /// Open a new binary stream by issuing `streamManager.getStream` over
    /// `rpc`, then registering a local demultiplexer entry keyed by the
    /// locally assigned stream id (the wire protocol addresses stream frames
    /// by this id directly).
    pub async fn open_stream(
        self: &Arc<Self>,
        rpc: &RpcPeer,
        name: &str,
        condition: &str,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<Stream> {
        let id: serde_json::Value = rpc
            .call(
                "streamManager.getStream",
                GetStreamParams { name, condition },
                cancel,
            )
            .await?;
        let _remote_stream_id = id;

        let local_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Delivery>();
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        self.streams.insert(local_id, StreamEntry { inbound_tx: raw_tx });

        // Applies real backpressure to this one stream's sender (the relay,
        // via its own flow control) without ever blocking the shared reader
        // task that feeds `raw_tx` for every other stream too.
        tokio::spawn(async move {
            while let Some(delivery) = raw_rx.recv().await {
                if inbound_tx.send(delivery).await.is_err() {
                    break;
                }
            }
        });

        Ok(Stream {
            id: local_id,
            tunnel: self.tunnel.clone(),
            mux: self.clone(),
            inbound_rx,
            read_buf: BytesMut::new(),
            write_seq: 0,
            eof: false,
            pending_write: None,
            pending_close: None,
        })
    }

    /// Route a frame observed by the RPC peer's reader task to the stream it
    /// addresses. Unknown stream ids are logged and dropped.
    pub(crate) fn dispatch(&self, stream_id: u32, _seq: u32, payload: Bytes) {
        let Some(entry) = self.streams.get(&stream_id) else {
            tracing::debug!(stream_id, "frame for unknown stream, dropping");
            return;
        };
        let delivery = if payload.is_empty() {
            Delivery::Eof
        } else {
            Delivery::Data(payload)
        };
        // Never blocks: the per-stream forwarding task applies backpressure
        // downstream of this unbounded hand-off.
        let _ = entry.inbound_tx.send(delivery);
    }

    /// Abnormally terminate every open stream (tunnel failure). Dropping each
    /// sender causes the corresponding `Stream::poll_read` to observe
    /// [`Error::StreamReset`].
    pub(crate) fn reset_all(&self) {
        self.streams.clear();
    }

    /// Gracefully terminate every open stream for an intentional, orderly
    /// session close: deliver a clean EOF to each stream's local reader and
    /// send its close frame to the peer, instead of severing it the way
    /// [`StreamMux::reset_all`] does for a broken tunnel.
    pub(crate) async fn close_all(&self) {
        let ids: Vec<u32> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, entry)) = self.streams.remove(&id) {
                let _ = entry.inbound_tx.send(Delivery::Eof);
            }
            let _ = self.tunnel.send(Frame::Stream(id, 0, Bytes::new())).await;
        }
    }

    pub(crate) fn forget(&self, id: u32) {
        self.streams.remove(&id);
    }
}

/// A named bidirectional byte pipe carried over the tunnel.
///
/// Implements `AsyncRead`/`AsyncWrite` so callers can `tokio::io::copy` it
/// against a local TCP socket, exactly as [`crate::forwarder::PortForwarder`]
/// does.
pub struct Stream {
    id: u32,
    tunnel: Arc<Tunnel>,
    mux: Arc<StreamMux>,
    inbound_rx: mpsc::Receiver<Delivery>,
    read_buf: BytesMut,
    write_seq: u32,
    eof: bool,
    /// An in-flight `tunnel.send` for a write, kept alive across polls so a
    /// `Pending` result doesn't abandon bytes that may already be queued in
    /// the tunnel's sink, which would otherwise risk a duplicate send on
    /// retry. Cleared, and `write_seq`/the byte count committed, only once
    /// the future resolves.
    pending_write: Option<(usize, PendingSend)>,
    /// Same in-flight-future discipline as `pending_write`, for the
    /// zero-length close frame `poll_shutdown` sends.
    pending_close: Option<PendingSend>,
}

type PendingSend = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

impl Stream {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Idempotent close: sends a close frame (empty payload), releases the
    /// local demultiplexer entry, and stops accepting further reads.
    pub async fn close(&mut self) -> Result<()> {
        if self.eof {
            return Ok(());
        }
        self.eof = true;
        self.mux.forget(self.id);
        self.tunnel
            .send(Frame::Stream(self.id, self.write_seq, Bytes::new()))
            .await
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        self.mux.forget(self.id);
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if !self.read_buf.is_empty() {
            let n = self.read_buf.len().min(buf.remaining());
            let chunk = self.read_buf.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        if self.eof {
            return Poll::Ready(Ok(()));
        }

        match self.inbound_rx.poll_recv(cx) {
            Poll::Ready(Some(Delivery::Data(bytes))) => {
                self.read_buf.extend_from_slice(&bytes);
                let n = self.read_buf.len().min(buf.remaining());
                let chunk = self.read_buf.split_to(n);
                buf.put_slice(&chunk);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Some(Delivery::Eof)) => {
                self.eof = true;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(None) => {
                // Sender dropped without a clean EOF: abnormal reset.
                self.eof = true;
                Poll::Ready(Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    Error::StreamReset,
                )))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();

        if this.pending_write.is_none() {
            let chunk_len = buf.len().min(MAX_FRAME_PAYLOAD);
            let chunk = Bytes::copy_from_slice(&buf[..chunk_len]);
            let seq = this.write_seq;
            this.write_seq = this.write_seq.wrapping_add(1);
            let tunnel = this.tunnel.clone();
            let id = this.id;
            this.pending_write = Some((
                chunk_len,
                Box::pin(async move { tunnel.send(Frame::Stream(id, seq, chunk)).await }),
            ));
        }

        let (chunk_len, fut) = this.pending_write.as_mut().unwrap();
        match fut.as_mut().poll(cx) {
            Poll::Ready(Ok(())) => {
                let chunk_len = *chunk_len;
                this.pending_write = None;
                Poll::Ready(Ok(chunk_len))
            }
            Poll::Ready(Err(e)) => {
                this.pending_write = None;
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.eof {
            return Poll::Ready(Ok(()));
        }

        if this.pending_close.is_none() {
            let tunnel = this.tunnel.clone();
            let id = this.id;
            let seq = this.write_seq;
            this.pending_close =
                Some(Box::pin(async move { tunnel.send(Frame::Stream(id, seq, Bytes::new())).await }));
        }

        match this.pending_close.as_mut().unwrap().as_mut().poll(cx) {
            Poll::Ready(Ok(())) => {
                this.eof = true;
                this.pending_close = None;
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.pending_close = None;
                Poll::Ready(Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
