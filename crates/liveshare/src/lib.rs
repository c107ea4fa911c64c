//! Client runtime for joining a Live Share-style collaborative workspace
//! session and forwarding a TCP port that lives inside its remote container.
//!
//! This crate is a *join-only* client: it does not host sessions, and it does
//! not implement the remote SSH daemon. The public surface is [`Session`],
//! reached through [`LiveShare::connect`], plus [`forwarder::PortForwarder`]
//! for bridging local TCP traffic to a shared remote port.

pub mod connection;
pub mod discovery;
pub mod error;
pub mod forwarder;
pub mod relay;
pub mod rpc;
pub mod session;
pub mod stream_mux;
pub mod tunnel;

#[cfg(any(test, feature = "test-support"))]
pub mod tunnel_test_support;

pub use connection::Connection;
pub use discovery::{Discovery, HttpDiscovery};
pub use error::{Error, Result, RpcError};
pub use forwarder::PortForwarder;
pub use session::{ChannelID, Session, SharedPort};

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How to obtain the [`Connection`] this session joins with: either a
/// pre-built connection, or credentials to resolve one via [`Discovery`].
/// Exactly one variant is ever constructed.
enum ConnectionSource {
    Direct(Connection),
    Discover {
        user_token: String,
        workspace_id: String,
        discovery_base_url: Option<String>,
    },
}

/// Configuration for [`LiveShare::new`].
///
/// Exactly one of [`Options::connection`] or [`Options::discover`] must be
/// used to build this value; logging has no handle here because this crate
/// logs through the ambient `tracing` subscriber the process installs, the
/// same way `sshx::main` installs one global subscriber and every module
/// logs through it.
pub struct Options {
    source: ConnectionSource,
}

impl Options {
    /// Join using an already-known [`Connection`].
    pub fn connection(connection: Connection) -> Self {
        Self {
            source: ConnectionSource::Direct(connection),
        }
    }

    /// Join by resolving `workspace_id` through [`HttpDiscovery`] using
    /// `user_token`, against the default control-plane base URL.
    pub fn discover(user_token: impl Into<String>, workspace_id: impl Into<String>) -> Self {
        Self {
            source: ConnectionSource::Discover {
                user_token: user_token.into(),
                workspace_id: workspace_id.into(),
                discovery_base_url: None,
            },
        }
    }

    /// Override the control-plane base URL used when discovering a
    /// connection. No-op when this `Options` was built with
    /// [`Options::connection`].
    pub fn with_discovery_base_url(mut self, base_url: impl Into<String>) -> Self {
        if let ConnectionSource::Discover {
            discovery_base_url, ..
        } = &mut self.source
        {
            *discovery_base_url = Some(base_url.into());
        }
        self
    }
}

/// Entry point: resolves a [`Connection`] (directly or via discovery) and
/// joins a [`Session`] from it.
pub struct LiveShare {
    options: Options,
}

impl LiveShare {
    /// Build a client from `options`. Does not perform any I/O; call
    /// [`LiveShare::connect`] to actually join.
    pub fn new(options: Options) -> Self {
        Self { options }
    }

    /// Resolve a connection (if needed) and join a session.
    pub async fn connect(self, cancel: &CancellationToken) -> Result<Session> {
        let connection = match self.options.source {
            ConnectionSource::Direct(connection) => connection,
            ConnectionSource::Discover {
                user_token,
                workspace_id,
                discovery_base_url,
            } => {
                let discovery = match discovery_base_url {
                    Some(base_url) => HttpDiscovery::with_base_url(user_token, base_url),
                    None => HttpDiscovery::new(user_token),
                };
                debug!(%workspace_id, "resolving connection via discovery");
                discovery.resolve(&workspace_id).await?
            }
        };
        Session::join(connection, cancel).await
    }
}
