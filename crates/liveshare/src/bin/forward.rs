//! Minimal CLI consumer of the `liveshare` library: join a workspace and
//! forward one remote port to a local one.
//!
//! Reduced from `sshx::main`'s shape (`clap::Parser`, a
//! `tracing_subscriber::fmt().with_env_filter(...)` init, and a
//! `tokio::signal::ctrl_c()` race) to the minimum an outer command-line
//! utility needs: connect, forward, and stop cleanly on Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use liveshare::{Connection, LiveShare, Options, PortForwarder};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::error;

/// Join a Live Share workspace and forward a remote container port to a
/// local one.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Already-issued session id (use with --session-token/--relay-sas/--relay-endpoint).
    #[clap(long, env = "LIVESHARE_SESSION_ID", requires_all = ["session_token", "relay_sas", "relay_endpoint"])]
    session_id: Option<String>,

    #[clap(long, env = "LIVESHARE_SESSION_TOKEN")]
    session_token: Option<String>,

    #[clap(long, env = "LIVESHARE_RELAY_SAS")]
    relay_sas: Option<String>,

    #[clap(long, env = "LIVESHARE_RELAY_ENDPOINT")]
    relay_endpoint: Option<String>,

    /// User token and workspace id, used instead of a pre-built connection.
    #[clap(long, env = "LIVESHARE_USER_TOKEN", requires = "workspace_id")]
    user_token: Option<String>,

    #[clap(long, env = "LIVESHARE_WORKSPACE_ID")]
    workspace_id: Option<String>,

    /// Protocol name the remote port is shared under (e.g. "ssh").
    #[clap(long, default_value = "ssh")]
    protocol: String,

    /// Port inside the remote container to share.
    #[clap(long)]
    remote_port: u16,

    /// Local port to listen on.
    #[clap(long)]
    local_port: u16,
}

fn build_options(args: &Args) -> anyhow::Result<Options> {
    if let (Some(session_id), Some(session_token), Some(relay_sas), Some(relay_endpoint)) = (
        &args.session_id,
        &args.session_token,
        &args.relay_sas,
        &args.relay_endpoint,
    ) {
        let connection = Connection::new(session_id, session_token, relay_sas, relay_endpoint)?;
        return Ok(Options::connection(connection));
    }
    if let (Some(user_token), Some(workspace_id)) = (&args.user_token, &args.workspace_id) {
        return Ok(Options::discover(user_token, workspace_id));
    }
    anyhow::bail!("either --session-id/--session-token/--relay-sas/--relay-endpoint or --user-token/--workspace-id must be provided");
}

#[tokio::main]
async fn run(args: Args) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let options = build_options(&args)?;

    let session = Arc::new(LiveShare::new(options).connect(&cancel).await?);
    let forwarder = PortForwarder::new(&session, &args.protocol, args.remote_port);

    let local_port = args.local_port;
    let forward_cancel = cancel.clone();
    let forward = tokio::spawn(async move { forwarder.forward_to_local_port(local_port, &forward_cancel).await });

    tokio::select! {
        result = forward => {
            if let Ok(Err(e)) = result {
                error!(error = %e, "forwarding stopped");
            }
        }
        _ = signal::ctrl_c() => {
            cancel.cancel();
        }
    }

    session.close().await;
    Ok(())
}

fn main() -> ExitCode {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
