//! End-to-end tests against a scripted loopback relay, mirroring the shape
//! of `sshx/tests/integration_test.rs`: spin up a fake server speaking the
//! exact wire protocol this crate expects, then drive the public API
//! (`Session`, `PortForwarder`) against it the way a real caller would.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use liveshare::rpc::RpcPeer;
use liveshare::stream_mux::StreamMux;
use liveshare::tunnel::Frame;
use liveshare::tunnel_test_support::LoopbackTunnelPair;
use liveshare::{Connection, Error, PortForwarder, Session};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

/// Drive the server side of a loopback tunnel as an echo relay: answers
/// `serverSharing.startSharing` and `streamManager.getStream` with canned
/// replies, then echoes every stream frame back on the same stream id. This
/// is exactly the shape every forwarded connection needs, whether there is
/// one or many of them.
async fn run_echo_relay(mut ws: WebSocketStream<TcpStream>) {
    while let Some(Ok(msg)) = ws.next().await {
        let Message::Binary(bytes) = msg else { continue };
        match Frame::decode(&bytes).unwrap() {
            Frame::Rpc(payload) => {
                let req: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                let response = match req["method"].as_str().unwrap() {
                    "serverSharing.startSharing" => json!({
                        "jsonrpc": "2.0",
                        "id": req["id"],
                        "result": {
                            "sourcePort": 80, "destinationPort": 8080, "sessionName": "sess",
                            "streamName": "S", "streamCondition": "C", "browseURL": "", "isPublic": false,
                        },
                    }),
                    "streamManager.getStream" => json!({
                        "jsonrpc": "2.0", "id": req["id"], "result": "stream",
                    }),
                    other => panic!("unscripted method: {other}"),
                };
                let frame = Frame::Rpc(serde_json::to_vec(&response).unwrap().into());
                if ws.send(Message::Binary(frame.encode())).await.is_err() {
                    break;
                }
            }
            Frame::Stream(id, seq, payload) => {
                let echo = Frame::Stream(id, seq, payload);
                if ws.send(Message::Binary(echo.encode())).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn joined_session() -> Arc<Session> {
    let (client_tunnel, server) = LoopbackTunnelPair::connect().await;
    let mux = Arc::new(StreamMux::new(client_tunnel.clone()));
    let rpc = RpcPeer::start(client_tunnel.clone(), mux.clone());
    let connection = Connection::new("s", "t", "sas", "sb://host.net/path/").unwrap();
    let session = Arc::new(Session::join_for_test(connection, client_tunnel, rpc, mux));
    tokio::spawn(run_echo_relay(server.into_inner()));
    session
}

#[tokio::test]
async fn forwarded_connection_exchanges_bytes_in_both_directions() {
    let session = joined_session().await;
    let forwarder = PortForwarder::new(&session, "ssh", 80);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cancel = CancellationToken::new();
    let forward_cancel = cancel.clone();
    let forward_task =
        tokio::spawn(async move { forwarder.forward_to_local_port(addr.port(), &forward_cancel).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(b"hello relay").await.unwrap();

    let mut buf = [0u8; 32];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello relay");

    drop(client);
    cancel.cancel();
    let _ = forward_task.await.unwrap();
}

#[tokio::test]
async fn cancellation_returns_promptly_and_frees_the_local_port() {
    let session = joined_session().await;
    let forwarder = PortForwarder::new(&session, "ssh", 80);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cancel = CancellationToken::new();
    let forward_cancel = cancel.clone();
    let forward_task =
        tokio::spawn(async move { forwarder.forward_to_local_port(addr.port(), &forward_cancel).await });

    // Let an in-flight connection get going before cancelling.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let _client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(1), forward_task)
        .await
        .expect("forward_to_local_port did not return within one second")
        .unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));

    // The listener must really be gone: a second bind to the same port
    // succeeds.
    TcpListener::bind(addr).await.expect("local port was not freed");
}

#[tokio::test]
async fn concurrent_connections_exchange_distinct_payloads_without_interleaving() {
    let session = joined_session().await;
    let forwarder = Arc::new(PortForwarder::new(&session, "ssh", 80));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cancel = CancellationToken::new();
    let forward_cancel = cancel.clone();
    let forward_task = tokio::spawn(async move {
        forwarder.forward_to_local_port(addr.port(), &forward_cancel).await
    });

    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut handles = Vec::new();
    for i in 0..32u8 {
        handles.push(tokio::spawn(async move {
            let mut client = TcpStream::connect(addr).await.unwrap();
            let payload: Vec<u8> = (0..4096).map(|b| (b as u8).wrapping_add(i)).collect();
            client.write_all(&payload).await.unwrap();

            let mut received = vec![0u8; payload.len()];
            client.read_exact(&mut received).await.unwrap();
            assert_eq!(received, payload, "connection {i} saw cross-talk");
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    cancel.cancel();
    let _ = forward_task.await.unwrap();
}

#[tokio::test]
async fn connection_validation_names_the_first_empty_field() {
    let err = Connection::new("s", "t", "", "e").unwrap_err();
    match err {
        Error::InvalidConnection { field } => assert_eq!(field, "relaySAS"),
        other => panic!("unexpected error: {other:?}"),
    }
}
