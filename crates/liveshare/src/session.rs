//! Public façade over the [`Tunnel`], [`RpcPeer`], and [`StreamMux`].
//!
//! Grounded in `sshx::connection::connect_with_fallback` for the join
//! sequence and in the `Controller` shape `sshx::main` drives (dial, call
//! server methods, clean up on exit).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::rpc::RpcPeer;
use crate::stream_mux::{Stream, StreamMux};
use crate::tunnel::Tunnel;

/// The server-assigned identifier returned by `serverSharing.startSharing`,
/// used to locate the stream corresponding to a shared port.
///
/// Modeled as a newtype around the untyped JSON value the server returns
/// (string or integer depending on server version) so callers can round-trip
/// it without this crate guessing a fixed shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelID(serde_json::Value);

impl std::fmt::Display for ChannelID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.0 {
            serde_json::Value::String(s) => write!(f, "{s}"),
            other => write!(f, "{other}"),
        }
    }
}

/// A port the host has shared through this session.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedPort {
    pub source_port: u16,
    pub destination_port: u16,
    pub session_name: String,
    pub stream_name: String,
    pub stream_condition: String,
    #[serde(rename = "browseURL")]
    pub browse_url: String,
    pub is_public: bool,
}

/// Reply from `ISshServerHostService.startRemoteServer`. Exposed as a thin
/// passthrough: the forwarder itself never calls this, but a caller
/// provisioning an SSH endpoint inside the container needs the resulting
/// port before constructing a [`crate::forwarder::PortForwarder`].
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteServerInfo {
    pub result: bool,
    pub server_port: String,
    pub user: String,
    pub message: String,
}

#[derive(Serialize)]
struct UpdateVisibilityParams(u16, bool);

/// A joined, authenticated collaborative workspace connection, multiplexing
/// RPC and streams over a single [`Tunnel`].
///
/// There is no way to observe a `Session` before it is joined:
/// [`Session::join`] performs the whole bootstrap, and the internal `closed`
/// flag tracks whether it has since been torn down.
pub struct Session {
    connection: Connection,
    tunnel: Arc<Tunnel>,
    rpc: Arc<RpcPeer>,
    mux: Arc<StreamMux>,
    sharing_in_flight: DashSet<(String, u16)>,
    closed: AtomicBool,
}

impl Session {
    /// Dial the tunnel for `connection`, start the RPC peer, and return a
    /// joined session.
    pub async fn join(connection: Connection, cancel: &CancellationToken) -> Result<Self> {
        let tunnel = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = Tunnel::dial(&connection) => Arc::new(result?),
        };
        let mux = Arc::new(StreamMux::new(tunnel.clone()));
        let rpc = RpcPeer::start(tunnel.clone(), mux.clone());
        info!(session_id = connection.session_id(), "joined live share session");

        Ok(Self {
            connection,
            tunnel,
            rpc,
            mux,
            sharing_in_flight: DashSet::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// The [`Connection`] this session was joined with.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(Error::Closed)
        } else {
            Ok(())
        }
    }

    /// Share a remote TCP port, obtaining the [`ChannelID`] and [`SharedPort`]
    /// description the server assigns. At most one call per `(protocol,
    /// port)` pair may be outstanding at a time.
    pub async fn start_sharing(
        &self,
        protocol: &str,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> Result<(ChannelID, SharedPort)> {
        self.check_open()?;

        let key = (protocol.to_string(), remote_port);
        if !self.sharing_in_flight.insert(key.clone()) {
            return Err(Error::AlreadySharing {
                protocol: protocol.to_string(),
                port: remote_port,
            });
        }
        let result = self.start_sharing_inner(protocol, remote_port, cancel).await;
        self.sharing_in_flight.remove(&key);
        result
    }

    async fn start_sharing_inner(
        &self,
        protocol: &str,
        remote_port: u16,
        cancel: &CancellationToken,
    ) -> Result<(ChannelID, SharedPort)> {
        let shared: SharedPort = self
            .rpc
            .call(
                "serverSharing.startSharing",
                (remote_port, protocol, ""),
                cancel,
            )
            .await?;
        let channel_id = ChannelID(serde_json::json!(shared.stream_name));
        Ok((channel_id, shared))
    }

    /// List every port currently shared in this session.
    pub async fn get_shared_servers(&self, cancel: &CancellationToken) -> Result<Vec<SharedPort>> {
        self.check_open()?;
        self.rpc
            .call("serverSharing.getSharedServers", (), cancel)
            .await
    }

    /// Flip a shared port's public/private visibility.
    pub async fn update_shared_visibility(
        &self,
        port: u16,
        is_public: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.check_open()?;
        self.rpc
            .call(
                "serverSharing.updateSharedServerVisibility",
                UpdateVisibilityParams(port, is_public),
                cancel,
            )
            .await
    }

    /// Provision an SSH endpoint inside the container. A thin passthrough the
    /// forwarder itself never calls.
    pub async fn start_remote_server(&self, cancel: &CancellationToken) -> Result<RemoteServerInfo> {
        self.check_open()?;
        self.rpc
            .call("ISshServerHostService.startRemoteServer", (), cancel)
            .await
    }

    /// Open a named binary sub-channel.
    pub async fn open_streaming_channel(
        &self,
        name: &str,
        condition: &str,
        cancel: &CancellationToken,
    ) -> Result<Stream> {
        self.check_open()?;
        self.mux.open_stream(&self.rpc, name, condition, cancel).await
    }

    /// Idempotent: gracefully closes all open streams, then the RPC peer,
    /// then the tunnel, in that order. Streams still open at close time see
    /// a clean EOF locally and a close frame sent to the peer, not an
    /// abnormal reset (that's reserved for an actual tunnel failure).
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.mux.close_all().await;
        self.rpc.shutdown();
        self.tunnel.close().await;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::Acquire) {
            warn!("session dropped without an explicit close");
        }
    }
}

#[cfg(any(test, feature = "test-support"))]
impl Session {
    /// Build a `Session` around an already-dialed tunnel/rpc/mux triple,
    /// bypassing `Session::join`'s dial step. Used by this crate's own tests
    /// and by integration tests that script a loopback relay directly.
    pub fn join_for_test(
        connection: Connection,
        tunnel: Arc<Tunnel>,
        rpc: Arc<RpcPeer>,
        mux: Arc<StreamMux>,
    ) -> Self {
        Self {
            connection,
            tunnel,
            rpc,
            mux,
            sharing_in_flight: DashSet::new(),
            closed: AtomicBool::new(false),
        }
    }
}
