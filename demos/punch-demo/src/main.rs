// punch-demo: drives punch-core's create -> start -> punch(CTRL) -> punch(DATA)
// phases either against a real vendor signaling endpoint, or (--mock) against
// an in-process scripted console peer built from punch-test-utils, so the
// whole flow can be exercised without any vendor account.
//
// Not part of the library surface — a thin harness for exercising it by hand.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use clap::Parser;
use punch_core::{
    Candidate, CandidateKind, Channel, ConsoleFamily, Endpoints, PunchConfig, Session,
    SignalingTransport,
};
use punch_test_utils::{MockProbePeer, MockPushServer, MockSignalingServer};
use serde_json::json;
use tracing::{error, info};

/// Drive a single remote-play hole-punch session against a signaling service.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Run entirely against an in-process scripted console peer instead of a
    /// real signaling endpoint.
    #[arg(long)]
    mock: bool,

    /// Bearer OAuth2 token for the signaling service (ignored with --mock).
    #[arg(long, env = "PUNCH_TOKEN", default_value = "")]
    token: String,

    /// Base URL of the signaling REST service (ignored with --mock).
    #[arg(long, default_value = "https://remoteplay.example.com")]
    base_url: String,

    /// 64-hex-char console device unique id (ignored with --mock, which
    /// generates one).
    #[arg(long)]
    console_uid: Option<String>,

    /// Console family.
    #[arg(long, value_enum, default_value_t = Family::Ps5)]
    family: Family,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum Family {
    Ps4,
    Ps5,
}

impl From<Family> for ConsoleFamily {
    fn from(f: Family) -> Self {
        match f {
            Family::Ps4 => ConsoleFamily::Ps4,
            Family::Ps5 => ConsoleFamily::Ps5,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "punch-demo starting");

    let result = if args.mock { run_mock(args).await } else { run_live(args).await };

    if let Err(e) = result {
        error!(error = %e, "punch-demo failed");
        std::process::exit(1);
    }
}

async fn run_live(args: Args) -> punch_core::Result<()> {
    let console_uid = parse_console_uid(args.console_uid.as_deref().unwrap_or_default())?;
    let endpoints = Endpoints { base_url: args.base_url };
    let config = PunchConfig::default();

    let session = Session::init(args.token, endpoints, config).await?;
    info!("session initialized, push stream connecting");
    drive(&session, console_uid, args.family.into()).await
}

fn parse_console_uid(s: &str) -> punch_core::Result<[u8; 32]> {
    let bytes = hex::decode(s).map_err(|e| {
        punch_core::CoreError::Schema(format!("--console-uid is not valid hex: {e}"))
    })?;
    bytes
        .try_into()
        .map_err(|_| punch_core::CoreError::Schema("--console-uid must decode to exactly 32 bytes".into()))
}

/// Shared CTRL+DATA drive sequence, used by both the live and mock paths.
async fn drive(session: &Session, console_uid: [u8; 32], family: ConsoleFamily) -> punch_core::Result<()> {
    session.create_session().await?;
    info!("session created");

    session.start_session(console_uid, family).await?;
    info!("console joined, customData1 received");

    let ctrl_socket = session.punch_hole(Channel::Ctrl).await?;
    info!(local_addr = ?ctrl_socket.local_addr(), "CTRL channel established");

    let data_socket = session.punch_hole(Channel::Data).await?;
    info!(local_addr = ?data_socket.local_addr(), "DATA channel established");

    session.close().await;
    info!("session closed");
    Ok(())
}

/// Runs the whole flow against an in-process mock signaling/push backend and
/// a scripted console peer, so `punch-demo --mock` works with no vendor
/// account. Mirrors `punch-core`'s own integration tests, just narrated at
/// `info!` instead of asserted.
async fn run_mock(args: Args) -> punch_core::Result<()> {
    info!("--mock: starting in-process signaling/push/probe doubles");
    let signaling = MockSignalingServer::start().await;
    signaling.set_session("11111111-1111-4111-8111-111111111111", 1).await;
    let push = MockPushServer::start().await;
    let ctrl_peer = MockProbePeer::start().await;
    let data_peer = MockProbePeer::start().await;

    let transport = SignalingTransport::new(
        Endpoints { base_url: signaling.base_url() },
        Duration::from_secs(5),
    )?;
    let session = Session::init_with_push_url("mock-token", push.ws_url(), transport, PunchConfig::default()).await?;
    session
        .set_static_candidate_override(Candidate {
            kind: CandidateKind::Static,
            addr: "203.0.113.1".into(),
            mapped_addr: "203.0.113.1".into(),
            port: 40000,
            mapped_port: 40000,
        })
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    push.push_notification(json!({"dataType": "sessionCreated", "body": {"data": {}}}).to_string());
    push.push_notification(
        json!({"dataType": "memberCreated", "body": {"data": {"members": [{"deviceUniqueId": "me"}]}}}).to_string(),
    );

    let console_uid = [0x42u8; 32];
    let console_hex = hex::encode(console_uid);
    let script = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        push.push_notification(
            json!({
                "dataType": "memberCreated",
                "body": {"data": {"members": [{"deviceUniqueId": console_hex}]}},
            })
            .to_string(),
        );
        push.push_notification(
            json!({
                "dataType": "customData1Updated",
                "body": {"data": {"customData1": B64.encode(B64.encode([0x11u8; 16]))}},
            })
            .to_string(),
        );

        for (peer, req_base) in [(&ctrl_peer, 10u16), (&data_peer, 20u16)] {
            tokio::time::sleep(Duration::from_millis(100)).await;
            push.push_notification(session_message_notification(offer_from(peer, req_base)));
            tokio::time::sleep(Duration::from_millis(150)).await;
            push.push_notification(session_message_notification(result_for(1)));
            tokio::time::sleep(Duration::from_millis(150)).await;
            push.push_notification(session_message_notification(accept_for(2)));
        }
    });

    let outcome = drive(&session, console_uid, args.family.into()).await;
    let _ = script.await;
    outcome
}

fn session_message_notification(inner: serde_json::Value) -> String {
    let payload = format!("ver=1.0, type=text, body={inner}");
    json!({"dataType": "sessionMessageCreated", "body": {"data": {"payload": payload}}}).to_string()
}

fn offer_from(peer: &MockProbePeer, req_id: u16) -> serde_json::Value {
    let addr = peer.addr();
    json!({
        "action": "OFFER",
        "reqId": req_id,
        "error": 0,
        "connRequest": {
            "sid": 4660,
            "peerSid": 0,
            "skey": "AAAAAAAAAAAAAAAAAAAAAA==",
            "natType": 2,
            "candidates": [{
                "type": "LOCAL",
                "addr": addr.ip().to_string(),
                "mappedAddr": "",
                "port": addr.port(),
                "mappedPort": 0,
            }],
            "defaultRouteMacAddr": "00:00:00:00:00:00",
            "localHashedId": "AQIDBAUGBwgJCgsMDQ4PEBESExQ=",
        },
    })
}

fn result_for(req_id: u16) -> serde_json::Value {
    json!({"action": "RESULT", "reqId": req_id, "error": 0, "connRequest": {}})
}

fn accept_for(req_id: u16) -> serde_json::Value {
    json!({"action": "ACCEPT", "reqId": req_id, "error": 0, "connRequest": {}})
}
