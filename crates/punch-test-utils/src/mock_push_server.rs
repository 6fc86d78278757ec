// mock_push_server: a mock of the `wss://{fqdn}/np/pushNotification` endpoint.
//
// Accepts one connection, answers PING with PONG, and exposes a handle to
// push arbitrary JSON notification frames to the connected client and to
// drain frames the client sent back — its keepalive PINGs (forwarded here
// as `"PING"`) and any text frame, for tests that assert on client liveness
// rather than the auto-ack, which goes out over HTTP, not this socket.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock push-notification server for integration testing.
pub struct MockPushServer {
    addr: SocketAddr,
    to_client: mpsc::UnboundedSender<String>,
    from_client: mpsc::UnboundedReceiver<String>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockPushServer {
    /// Start the mock server, binding to a random available port.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock push server");
        let addr = listener.local_addr().expect("local_addr");

        let (to_client_tx, mut to_client_rx) = mpsc::unbounded_channel::<String>();
        let (from_client_tx, from_client_rx) = mpsc::unbounded_channel::<String>();

        let task = tokio::spawn(async move {
            let Ok((stream, _peer)) = listener.accept().await else { return };
            let Ok(ws) = tokio_tungstenite::accept_async(stream).await else { return };
            let (mut write, mut read) = ws.split();

            loop {
                tokio::select! {
                    outbound = to_client_rx.recv() => {
                        match outbound {
                            Some(text) => {
                                if write.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    incoming = read.next() => {
                        match incoming {
                            Some(Ok(Message::Ping(data))) => {
                                let _ = from_client_tx.send("PING".to_string());
                                let _ = write.send(Message::Pong(data)).await;
                            }
                            Some(Ok(Message::Text(text))) => {
                                let _ = from_client_tx.send(text.to_string());
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(_)) => break,
                            _ => {}
                        }
                    }
                }
            }
        });

        MockPushServer {
            addr,
            to_client: to_client_tx,
            from_client: from_client_rx,
            _task: task,
        }
    }

    /// `ws://` URL of this mock server's push endpoint.
    pub fn ws_url(&self) -> String {
        format!("ws://{}/np/pushNotification", self.addr)
    }

    /// Push a raw JSON text frame to the connected client.
    pub fn push_notification(&self, raw: impl Into<String>) {
        let _ = self.to_client.send(raw.into());
    }

    /// Await the next frame the client sent back over this socket — a
    /// keepalive PING (surfaced as `"PING"`) or a text frame, if the client
    /// ever sends one.
    pub async fn recv_from_client(&mut self) -> Option<String> {
        self.from_client.recv().await
    }
}
