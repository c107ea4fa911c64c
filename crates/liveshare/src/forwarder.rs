//! Bidirectional TCP proxy: accepts local connections and pumps bytes to a
//! freshly opened streaming sub-channel for each one.
//!
//! Uses a first-error-wins channel and scoped cleanup on exit, structurally
//! grounded in `sshx::transport`'s habit of spawning one task per logical
//! duplex connection.

use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::session::{SharedPort, Session};

/// Presents a local TCP endpoint whose traffic is transparently bridged to a
/// remote container port.
///
/// Holds only a [`Weak`] reference to its [`Session`]: a forwarder never
/// closes the session it rides on.
pub struct PortForwarder {
    session: Weak<Session>,
    protocol: String,
    remote_port: u16,
}

impl PortForwarder {
    /// Construct a forwarder for `remote_port`, sharing it under the given
    /// `protocol` name (e.g. `"ssh"`) the first time it is used.
    pub fn new(session: &Arc<Session>, protocol: impl Into<String>, remote_port: u16) -> Self {
        Self {
            session: Arc::downgrade(session),
            protocol: protocol.into(),
            remote_port,
        }
    }

    fn upgrade(&self) -> Result<Arc<Session>> {
        self.session.upgrade().ok_or(Error::Closed)
    }

    /// Single-connection variant: share the port (once) and bridge exactly
    /// one already-accepted duplex connection until it completes.
    pub async fn forward<C>(&self, conn: C, cancel: &CancellationToken) -> Result<()>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let session = self.upgrade()?;
        let (_channel_id, shared) = session
            .start_sharing(&self.protocol, self.remote_port, cancel)
            .await?;
        handle_connection(&session, &shared, conn, cancel).await
    }

    /// Listen on `0.0.0.0:local_port` and bridge every accepted connection to
    /// the shared remote port until the first error, or until `cancel` fires.
    ///
    /// Always returns an error: either the first connection/listener failure,
    /// or [`Error::Cancelled`].
    pub async fn forward_to_local_port(&self, local_port: u16, cancel: &CancellationToken) -> Result<()> {
        let session = self.upgrade()?;
        let (_channel_id, shared) = session
            .start_sharing(&self.protocol, self.remote_port, cancel)
            .await?;

        let listener = TcpListener::bind(("0.0.0.0", local_port))
            .await
            .map_err(Error::Listen)?;
        info!(local_port, remote_port = self.remote_port, "forwarding port");

        // Capacity-1, non-blocking: the first connection error wins, every
        // later one is silently dropped rather than stalling a handler.
        let (err_tx, mut err_rx) = mpsc::channel::<Error>(1);
        let mut connections = JoinSet::new();

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(Error::Cancelled),
                Some(err) = err_rx.recv() => break Err(err),
                accept = listener.accept() => {
                    match accept {
                        Ok((conn, peer)) => {
                            debug!(%peer, "accepted local connection");
                            let session = session.clone();
                            let shared = shared.clone();
                            let err_tx = err_tx.clone();
                            let conn_cancel = cancel.child_token();
                            connections.spawn(async move {
                                if let Err(e) = handle_connection(&session, &shared, conn, &conn_cancel).await {
                                    if !matches!(e, Error::Cancelled) {
                                        let _ = err_tx.try_send(e);
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            let _ = err_tx.try_send(Error::Io(e));
                        }
                    }
                }
            }
        };

        // Dropping the listener here (end of scope) frees the local port
        // immediately; aborting every in-flight handler task drops its TCP
        // socket and stream, unblocking any read that was still pending.
        drop(listener);
        connections.shutdown().await;
        result
    }
}

/// Open a streaming channel for one accepted connection and pump bytes both
/// ways until EOF or failure. Each direction runs as its own `tokio::io::copy`
/// future so a stall in one does not starve the other.
async fn handle_connection<C>(
    session: &Session,
    shared: &SharedPort,
    conn: C,
    cancel: &CancellationToken,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let stream = session
        .open_streaming_channel(&shared.stream_name, &shared.stream_condition, cancel)
        .await?;

    let (mut local_read, mut local_write) = tokio::io::split(conn);
    let (mut remote_read, mut remote_write) = tokio::io::split(stream);

    let local_to_remote = async {
        let result = tokio::io::copy(&mut local_read, &mut remote_write).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut remote_write).await;
        result
    };
    let remote_to_local = async {
        let result = tokio::io::copy(&mut remote_read, &mut local_write).await;
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut local_write).await;
        result
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            warn!("forwarded connection cancelled");
            Err(Error::Cancelled)
        }
        result = async { tokio::try_join!(local_to_remote, remote_to_local) } => {
            result.map(|_| ()).map_err(Error::Io)
        }
    }
}
