//! A JSON-RPC 2.0 peer bound to the [`Tunnel`](crate::tunnel::Tunnel).
//!
//! Grounded in `sshx::transport::WebSocketTransport::send_request`'s
//! correlation-id + oneshot-channel pattern, generalized from a single fixed
//! CLI protocol to arbitrary JSON-RPC methods, concurrent calls, and
//! server-to-client notifications.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Error, Result, RpcError};
use crate::stream_mux::StreamMux;
use crate::tunnel::{Frame, Tunnel};

#[derive(Serialize)]
struct RequestEnvelope<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Serialize)]
struct NotificationEnvelope<'a, P> {
    jsonrpc: &'static str,
    method: &'a str,
    params: P,
}

#[derive(Deserialize)]
struct ErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorObject>,
}

type Waiter = oneshot::Sender<std::result::Result<Value, RpcError>>;
type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// A JSON-RPC 2.0 peer: request/response matching, notification dispatch,
/// cancellation, and support for arbitrarily many concurrent outstanding
/// calls.
pub struct RpcPeer {
    tunnel: Arc<Tunnel>,
    next_id: AtomicU64,
    pending: DashMap<u64, Waiter>,
    handlers: DashMap<String, Handler>,
    reader_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl RpcPeer {
    /// Start the peer's reader task over `tunnel`. Stream frames observed on
    /// the tunnel are forwarded to `mux` so a single reader task serves both
    /// the RPC layer and the stream multiplexer.
    pub fn start(tunnel: Arc<Tunnel>, mux: Arc<StreamMux>) -> Arc<Self> {
        let peer = Arc::new(Self {
            tunnel: tunnel.clone(),
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            handlers: DashMap::new(),
            reader_task: std::sync::Mutex::new(None),
        });

        let reader_peer = peer.clone();
        let task = tokio::spawn(async move {
            loop {
                match tunnel.recv().await {
                    Ok(Frame::Rpc(bytes)) => reader_peer.handle_frame(&bytes),
                    Ok(Frame::Stream(id, seq, payload)) => mux.dispatch(id, seq, payload),
                    Err(Error::Closed) => break,
                    Err(e) => {
                        warn!(error = %e, "tunnel recv error in rpc reader");
                        break;
                    }
                }
            }
            reader_peer.fail_all_pending();
            mux.reset_all();
        });
        *peer.reader_task.lock().unwrap() = Some(task);

        peer
    }

    fn handle_frame(&self, bytes: &[u8]) {
        let envelope: IncomingEnvelope = match serde_json::from_slice(bytes) {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "dropping malformed rpc frame");
                return;
            }
        };

        match (envelope.id, envelope.method) {
            (Some(id), None) => {
                // Response.
                if let Some((_, waiter)) = self.pending.remove(&id) {
                    let outcome = if let Some(err) = envelope.error {
                        Err(RpcError {
                            code: err.code,
                            message: err.message,
                            data: err.data,
                        })
                    } else {
                        Ok(envelope.result.unwrap_or(Value::Null))
                    };
                    let _ = waiter.send(outcome);
                } else {
                    debug!(id, "response for unknown or already-resolved request id");
                }
            }
            (None, Some(method)) => {
                // Notification.
                if let Some(handler) = self.handlers.get(&method).map(|h| h.clone()) {
                    handler(envelope.params.unwrap_or(Value::Null));
                } else {
                    debug!(%method, "no handler registered for notification");
                }
            }
            _ => warn!("dropping frame that is neither a response nor a notification"),
        }
    }

    fn fail_all_pending(&self) {
        let ids: Vec<u64> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, waiter)) = self.pending.remove(&id) {
                let _ = waiter.send(Err(RpcError {
                    code: 0,
                    message: "connection closed".into(),
                    data: None,
                }));
            }
        }
    }

    /// Issue a JSON-RPC call and await its matching response, or
    /// [`Error::Cancelled`] if `cancel` fires first. On cancellation the
    /// waiter is deregistered, but the server-side effect may already have
    /// occurred (best-effort cancel only).
    pub async fn call<P, R>(&self, method: &str, params: P, cancel: &CancellationToken) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        let envelope = RequestEnvelope {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| Error::Protocol(e.to_string()))?;

        if let Err(e) = self.tunnel.send(Frame::Rpc(bytes.into())).await {
            self.pending.remove(&id);
            return Err(e);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.pending.remove(&id);
                Err(Error::Cancelled)
            }
            result = rx => {
                match result {
                    Ok(Ok(value)) => serde_json::from_value(value).map_err(|e| Error::Protocol(e.to_string())),
                    Ok(Err(rpc_err)) => Err(Error::Rpc(rpc_err)),
                    Err(_recv_error) => Err(Error::Closed),
                }
            }
        }
    }

    /// Send a one-way notification (no response expected).
    pub async fn notify<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        let envelope = NotificationEnvelope {
            jsonrpc: "2.0",
            method,
            params,
        };
        let bytes = serde_json::to_vec(&envelope).map_err(|e| Error::Protocol(e.to_string()))?;
        self.tunnel.send(Frame::Rpc(bytes.into())).await
    }

    /// Register a handler for server-to-client notifications of the given
    /// `method`. Re-entrant `call`/`notify` from within a handler is
    /// permitted since no lock is held while the handler runs; re-entrant
    /// *registration* from within a handler is not supported.
    pub fn on(&self, method: impl Into<String>, handler: impl Fn(Value) + Send + Sync + 'static) {
        self.handlers.insert(method.into(), Arc::new(handler));
    }

    /// Stop the reader task and fail every pending call with
    /// [`Error::Closed`].
    pub fn shutdown(&self) {
        if let Some(task) = self.reader_task.lock().unwrap().take() {
            task.abort();
        }
        self.fail_all_pending();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel_test_support::LoopbackTunnelPair;

    #[tokio::test]
    async fn concurrent_calls_receive_matching_responses_no_cross_talk() {
        let (client_tunnel, server) = LoopbackTunnelPair::connect().await;
        let mux = Arc::new(StreamMux::new(client_tunnel.clone()));
        let peer = RpcPeer::start(client_tunnel, mux);

        // Server echoes back `{"echo": params}` for every request id it sees.
        let server_task = server.spawn_echo_server();

        let cancel = CancellationToken::new();
        let mut handles = Vec::new();
        for i in 0..16u64 {
            let peer = peer.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let result: Value = peer
                    .call("echo", serde_json::json!({ "n": i }), &cancel)
                    .await
                    .unwrap();
                (i, result)
            }));
        }

        for handle in handles {
            let (i, result) = handle.await.unwrap();
            assert_eq!(result["echo"]["n"], i);
        }

        server_task.abort();
    }

    #[tokio::test]
    async fn cancellation_deregisters_waiter_without_hanging() {
        let (client_tunnel, _server) = LoopbackTunnelPair::connect().await;
        let mux = Arc::new(StreamMux::new(client_tunnel.clone()));
        let peer = RpcPeer::start(client_tunnel, mux);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<Value> = peer.call("neverAnswered", serde_json::json!({}), &cancel).await;
        assert!(matches!(result, Err(Error::Cancelled)));
        assert!(peer.pending.is_empty());
    }
}
