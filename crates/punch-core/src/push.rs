//! The notification stream: the long-lived authenticated push channel.
//!
//! Grounded on `services/forwarder/src/uplink.rs` for the connect/send/recv
//! shape and on `services/receiver/src/session.rs::run_session_loop` for the
//! `tokio::select!`-driven cooperative loop with a cancellation signal —
//! here a `CancellationToken` standing in for a polled `should_stop`
//! boolean, with shutdown latency bounded by the PING/read timeout either
//! way.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec;
use crate::config::PunchConfig;
use crate::error::{CoreError, Result};
use crate::model::{Action, ConnectionRequest, NotificationKind, SessionMessage, State};
use crate::queue::{NotificationQueue, StateCell};
use crate::transport::SignalingTransport;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Required vendor headers for the push-stream handshake.
fn build_push_request(
    url: &str,
    token: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = url
        .into_client_request()
        .map_err(|e| CoreError::Network(format!("invalid push URL '{url}': {e}")))?;
    let headers = request.headers_mut();
    headers.insert(
        "Authorization",
        format!("Bearer {token}")
            .parse()
            .map_err(|_| CoreError::Network("invalid auth header".into()))?,
    );
    headers.insert("Sec-WebSocket-Protocol", "np-pushpacket".parse().unwrap());
    headers.insert("X-PSN-APP-TYPE", "REMOTE_PLAY".parse().unwrap());
    headers.insert("X-PSN-PROTOCOL-VERSION", "2.1".parse().unwrap());
    headers.insert("X-PSN-RECONNECTION", "false".parse().unwrap());
    Ok(request)
}

/// Handle to the running push-stream worker.
pub struct PushWorker {
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl PushWorker {
    /// Spawn the worker — one push worker per `Session`.
    ///
    /// `ws_url` is the full push endpoint URL (`wss://{fqdn}/np/pushNotification`
    /// in production; tests point this at a plaintext mock server instead —
    /// same `ws://` vs `wss://` flexibility this workspace's `UplinkConfig::server_url`
    /// already has).
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        ws_url: String,
        token: Arc<String>,
        session_id: Arc<Mutex<String>>,
        transport: Arc<SignalingTransport>,
        state: Arc<StateCell>,
        queue: Arc<NotificationQueue>,
        config: PunchConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let task = tokio::spawn(async move {
            run(ws_url, token, session_id, transport, state, queue, config, cancel_clone).await;
        });
        PushWorker { cancel, task }
    }

    /// `session_fini`'s worker-teardown half.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

async fn run(
    url: String,
    token: Arc<String>,
    session_id: Arc<Mutex<String>>,
    transport: Arc<SignalingTransport>,
    state: Arc<StateCell>,
    queue: Arc<NotificationQueue>,
    config: PunchConfig,
    cancel: CancellationToken,
) {
    let request = match build_push_request(&url, &token) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "push stream: bad request");
            return;
        }
    };
    let ws = match connect_async(request).await {
        Ok((ws, _)) => ws,
        Err(e) => {
            warn!(error = %e, "push stream: connect failed");
            return;
        }
    };
    info!("push stream connected");
    state.set(State::WS_OPEN).await;

    if let Err(e) = cooperative_loop(ws, token, session_id, transport, state, queue, config, cancel).await {
        warn!(error = %e, "push stream terminated");
    }
}

#[allow(clippy::too_many_arguments)]
async fn cooperative_loop(
    mut ws: WsStream,
    token: Arc<String>,
    session_id: Arc<Mutex<String>>,
    transport: Arc<SignalingTransport>,
    state: Arc<StateCell>,
    queue: Arc<NotificationQueue>,
    config: PunchConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut ping_interval = tokio::time::interval(config.ping_interval);
    let mut awaiting_pong = false;
    let mut pong_deadline = tokio::time::Instant::now() + config.pong_timeout;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                debug!("push stream: stop requested");
                return Ok(());
            }
            () = tokio::time::sleep_until(pong_deadline), if awaiting_pong => {
                return Err(CoreError::Timeout("PONG".into()));
            }
            _ = ping_interval.tick() => {
                ws.send(Message::Ping(Vec::new().into())).await?;
                awaiting_pong = true;
                pong_deadline = tokio::time::Instant::now() + config.pong_timeout;
            }
            msg = tokio::time::timeout(config.read_timeout, ws.next()) => {
                let msg = match msg {
                    Err(_) => continue, // read timeout is not fatal by itself; PING/PONG governs liveness
                    Ok(None) => return Ok(()),
                    Ok(Some(Err(e))) => return Err(e.into()),
                    Ok(Some(Ok(m))) => m,
                };
                match msg {
                    Message::Pong(_) => {
                        awaiting_pong = false;
                    }
                    Message::Ping(data) => {
                        ws.send(Message::Pong(data)).await?;
                    }
                    Message::Close(_) => return Ok(()),
                    Message::Text(text) => {
                        handle_frame(text.as_str(), &token, &session_id, &transport, &state, &queue).await;
                    }
                    Message::Binary(data) => {
                        if let Ok(text) = std::str::from_utf8(&data) {
                            handle_frame(text, &token, &session_id, &transport, &state, &queue).await;
                        }
                    }
                    _ => {}
                }
            }
        }
    }
}

async fn handle_frame(
    text: &str,
    token: &Arc<String>,
    session_id: &Arc<Mutex<String>>,
    transport: &Arc<SignalingTransport>,
    state: &Arc<StateCell>,
    queue: &Arc<NotificationQueue>,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "push stream: malformed JSON frame");
            return;
        }
    };
    let kind = value
        .get("dataType")
        .and_then(Value::as_str)
        .map(classify_kind)
        .unwrap_or(NotificationKind::Unknown);
    debug!(?kind, "push stream: notification received");

    // Opportunistic auto-ack for a stray OFFER. Evaluated under the state
    // mutex, then (if needed) the HTTP send happens outside any lock, then
    // the notification is enqueued for observability regardless of outcome.
    if kind == NotificationKind::SessionMessageCreated {
        if let Some(raw) = value.pointer("/body/data/payload").and_then(Value::as_str) {
            if let Ok(msg) = codec::decode_message(raw) {
                if msg.action == Action::Offer && should_auto_ack(state).await {
                    let ack = SessionMessage {
                        action: Action::Result,
                        req_id: msg.req_id,
                        error: 0,
                        conn_request: Some(ConnectionRequest::empty()),
                    };
                    let sid = session_id.lock().await.clone();
                    if !sid.is_empty() {
                        // Auto-ack failures are logged and dropped, never
                        // surfaced to the main flow.
                        if let Err(e) = transport.send_session_message(token, &sid, &ack).await {
                            warn!(error = %e, "auto-ack send failed");
                        } else {
                            info!(req_id = msg.req_id, "auto-acked stray OFFER");
                        }
                    }
                }
            }
        }
    }

    queue.push(kind, value, text.as_bytes().to_vec()).await;
}

/// Auto-ack predicate: `(CtrlOfferReceived ∧ ¬CtrlEstablished) ∨ DataOfferReceived`.
async fn should_auto_ack(state: &Arc<StateCell>) -> bool {
    let bits = state.get().await;
    (bits.contains(State::CTRL_OFFER_RECEIVED) && !bits.contains(State::CTRL_ESTABLISHED))
        || bits.contains(State::DATA_OFFER_RECEIVED)
}

fn classify_kind(data_type: &str) -> NotificationKind {
    match data_type {
        "psn:sessionManager:sessionCreated" | "sessionCreated" => NotificationKind::SessionCreated,
        "psn:sessionManager:sessionMemberCreated" | "memberCreated" => NotificationKind::MemberCreated,
        "psn:sessionManager:sessionMemberDeleted" | "memberDeleted" => NotificationKind::MemberDeleted,
        "psn:sessionManager:customData1Updated" | "customData1Updated" => {
            NotificationKind::CustomData1Updated
        }
        "psn:sessionManager:sessionMessageCreated" | "sessionMessageCreated" => {
            NotificationKind::SessionMessageCreated
        }
        _ => NotificationKind::Unknown,
    }
}

/// How long to treat a missed PONG as fatal; exposed for tests that want to
/// assert on the constant rather than `PunchConfig::default()`.
pub const DEFAULT_PONG_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_kind_accepts_both_short_and_vendor_prefixed_names() {
        assert_eq!(classify_kind("sessionCreated"), NotificationKind::SessionCreated);
        assert_eq!(
            classify_kind("psn:sessionManager:sessionCreated"),
            NotificationKind::SessionCreated
        );
        assert_eq!(
            classify_kind("psn:sessionManager:customData1Updated"),
            NotificationKind::CustomData1Updated
        );
    }

    #[test]
    fn classify_kind_falls_back_to_unknown() {
        assert_eq!(classify_kind("somethingElse"), NotificationKind::Unknown);
    }

    #[test]
    fn build_push_request_sets_vendor_headers() {
        let req = build_push_request("ws://127.0.0.1:9/np/pushNotification", "tok").unwrap();
        let headers = req.headers();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer tok");
        assert_eq!(headers.get("Sec-WebSocket-Protocol").unwrap(), "np-pushpacket");
        assert_eq!(headers.get("X-PSN-APP-TYPE").unwrap(), "REMOTE_PLAY");
    }

    #[test]
    fn build_push_request_rejects_invalid_url() {
        assert!(build_push_request("not a url", "tok").is_err());
    }

    #[tokio::test]
    async fn should_auto_ack_true_for_stray_ctrl_offer_before_established() {
        let state = Arc::new(StateCell::new());
        state.set(State::CTRL_OFFER_RECEIVED).await;
        assert!(should_auto_ack(&state).await);
    }

    #[tokio::test]
    async fn should_auto_ack_false_once_ctrl_established() {
        let state = Arc::new(StateCell::new());
        state.set(State::CTRL_OFFER_RECEIVED).await;
        state.set(State::CTRL_ESTABLISHED).await;
        assert!(!should_auto_ack(&state).await);
    }

    #[tokio::test]
    async fn should_auto_ack_true_for_any_data_offer() {
        let state = Arc::new(StateCell::new());
        state.set(State::DATA_OFFER_RECEIVED).await;
        assert!(should_auto_ack(&state).await);
    }

    #[tokio::test]
    async fn should_auto_ack_false_with_no_offer_bits() {
        let state = Arc::new(StateCell::new());
        assert!(!should_auto_ack(&state).await);
    }

    /// A peer that accepts the WS handshake and answers nothing
    /// else must cause `cooperative_loop` to return `Timeout("PONG")` once
    /// `pong_timeout` elapses with a PING outstanding, rather than hang.
    #[tokio::test]
    async fn cooperative_loop_times_out_when_pong_never_arrives() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            // Drain frames (including the client's PING) without ever
            // replying, so the client never sees a PONG.
            while ws.next().await.is_some() {}
        });

        let (client_ws, _) = connect_async(format!("ws://{addr}/np/pushNotification")).await.unwrap();

        let config = PunchConfig {
            ping_interval: Duration::from_millis(20),
            pong_timeout: Duration::from_millis(80),
            read_timeout: Duration::from_millis(20),
            ..PunchConfig::default()
        };
        let token = Arc::new("test-token".to_string());
        let session_id = Arc::new(Mutex::new(String::new()));
        let transport = Arc::new(
            SignalingTransport::new(
                crate::transport::Endpoints { base_url: "http://127.0.0.1:1".into() },
                Duration::from_millis(50),
            )
            .unwrap(),
        );
        let state = Arc::new(StateCell::new());
        let queue = Arc::new(NotificationQueue::new());
        let cancel = CancellationToken::new();

        let result = tokio::time::timeout(
            Duration::from_secs(2),
            cooperative_loop(client_ws, token, session_id, transport, state, queue, config, cancel),
        )
        .await
        .expect("cooperative_loop did not hang");

        assert!(matches!(result, Err(CoreError::Timeout(ref what)) if what == "PONG"));
        server.abort();
    }
}
