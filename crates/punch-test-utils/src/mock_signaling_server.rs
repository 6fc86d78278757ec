// mock_signaling_server: a minimal mock of the vendor REST endpoints used
// by `punch-core`'s Signaling Transport: device listing, session
// create/start, session-message relay, and push-FQDN resolution.
//
// Responses are scripted via a shared `Inner` behind a `Mutex`, mirroring
// this workspace's `server::AppState` — a cloneable handle wrapping shared
// state that axum handlers read/write through `State<...>`.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

struct Inner {
    devices: Vec<Value>,
    session_id: String,
    account_id: i64,
    fqdn: String,
    sent_messages: Vec<Value>,
}

type SharedState = Arc<Mutex<Inner>>;

/// A mock vendor signaling REST service for integration testing.
pub struct MockSignalingServer {
    addr: SocketAddr,
    state: SharedState,
    _task: tokio::task::JoinHandle<()>,
}

impl MockSignalingServer {
    /// Start the mock server with a default session id, account id 1, and
    /// no devices, bound to a random local port.
    pub async fn start() -> Self {
        let state = Arc::new(Mutex::new(Inner {
            devices: Vec::new(),
            session_id: "00000000-0000-4000-8000-000000000000".to_owned(),
            account_id: 1,
            fqdn: "127.0.0.1".to_owned(),
            sent_messages: Vec::new(),
        }));

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock signaling server");
        let addr = listener.local_addr().expect("local_addr");
        let router = build_router(state.clone());
        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        MockSignalingServer { addr, state, _task: task }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn set_devices(&self, devices: Vec<Value>) {
        self.state.lock().await.devices = devices;
    }

    pub async fn set_session(&self, session_id: impl Into<String>, account_id: i64) {
        let mut inner = self.state.lock().await;
        inner.session_id = session_id.into();
        inner.account_id = account_id;
    }

    pub async fn set_fqdn(&self, fqdn: impl Into<String>) {
        self.state.lock().await.fqdn = fqdn.into();
    }

    /// Snapshot of every `sessionMessage` body posted so far, in order.
    pub async fn sent_messages(&self) -> Vec<Value> {
        self.state.lock().await.sent_messages.clone()
    }
}

fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/users/me/clients", get(list_devices))
        .route("/remotePlaySessions", post(create_session))
        .route("/remotePlaySessions/{id}/start", post(start_session))
        .route("/remotePlaySessions/{id}/sessionMessage", post(session_message))
        .route("/np/serveraddr", get(push_fqdn))
        .with_state(state)
}

async fn list_devices(State(state): State<SharedState>, Query(_params): Query<Value>) -> Json<Value> {
    let inner = state.lock().await;
    Json(json!({ "devices": inner.devices }))
}

async fn create_session(State(state): State<SharedState>, Json(_body): Json<Value>) -> Json<Value> {
    let inner = state.lock().await;
    Json(json!({
        "remotePlaySessions": [{ "sessionId": inner.session_id }],
        "members": [{ "accountId": inner.account_id }],
    }))
}

async fn start_session(
    State(_state): State<SharedState>,
    Path(_id): Path<String>,
    Json(_body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({})))
}

async fn session_message(
    State(state): State<SharedState>,
    Path(_id): Path<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    state.lock().await.sent_messages.push(body);
    (StatusCode::OK, Json(json!({})))
}

async fn push_fqdn(State(state): State<SharedState>) -> Json<Value> {
    let inner = state.lock().await;
    Json(json!({ "fqdn": inner.fqdn }))
}
