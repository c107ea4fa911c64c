//! Test-only loopback relay stand-in: a real TCP listener speaking the exact
//! wire protocol [`Tunnel`] expects, so the RPC peer, stream mux, and
//! forwarder can be exercised end-to-end without a real relay.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::connection::Connection;
use crate::tunnel::{Frame, Tunnel};

/// A connected client [`Tunnel`] paired with a handle to the server side of
/// the same loopback socket, for scripting relay behavior in tests.
pub struct LoopbackTunnelPair;

impl LoopbackTunnelPair {
    /// Bind a loopback listener, dial it with a fresh client [`Tunnel`], and
    /// return the client tunnel alongside a [`ServerHandle`] for the other
    /// end.
    pub async fn connect() -> (Arc<Tunnel>, ServerHandle) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let accept_task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            // Perform the auth handshake the real relay would: read the auth
            // frame, unconditionally acknowledge it.
            let msg = ws.next().await.unwrap().unwrap();
            let Message::Binary(_auth_bytes) = msg else {
                panic!("expected binary auth frame");
            };
            let ack = Frame::Rpc(Bytes::from(
                serde_json::to_vec(&json!({ "ok": true })).unwrap(),
            ));
            ws.send(Message::Binary(ack.encode())).await.unwrap();

            ws
        });

        let connection = Connection::new("sess", "token", "sas", "sb://host.net/path/").unwrap();
        let url = format!("ws://127.0.0.1:{port}");
        let client = Tunnel::dial_url(&url, &connection).await.unwrap();

        let ws = accept_task.await.unwrap();
        (Arc::new(client), ServerHandle { ws })
    }
}

/// The server side of a loopback tunnel connection, with helpers to script
/// its behavior.
pub struct ServerHandle {
    ws: WebSocketStream<TcpStream>,
}

impl ServerHandle {
    /// Spawn a task that echoes every RPC request back as
    /// `{"echo": <params>}`.
    pub fn spawn_echo_server(self) -> tokio::task::JoinHandle<()> {
        let mut ws = self.ws;
        tokio::spawn(async move {
            while let Some(Ok(Message::Binary(bytes))) = ws.next().await {
                let Frame::Rpc(payload) = Frame::decode(&bytes).unwrap() else {
                    continue;
                };
                let req: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                let response = json!({
                    "jsonrpc": "2.0",
                    "id": req["id"],
                    "result": { "echo": req["params"] },
                });
                let frame = Frame::Rpc(Bytes::from(serde_json::to_vec(&response).unwrap()));
                if ws.send(Message::Binary(frame.encode())).await.is_err() {
                    break;
                }
            }
        })
    }

    /// Take the raw WebSocket stream for fully custom scripting.
    pub fn into_inner(self) -> WebSocketStream<TcpStream> {
        self.ws
    }
}
