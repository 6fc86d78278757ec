//! Probe-timeout path: the peer's OFFER names a
//! candidate that never answers the challenge/response probe, so
//! `punch_hole` must return `Timeout` once `probe_timeout` elapses instead
//! of hanging.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use punch_core::{
    Candidate, CandidateKind, Channel, ConsoleFamily, CoreError, Endpoints, PunchConfig, Session,
    SignalingTransport,
};
use punch_test_utils::{MockProbePeer, MockPushServer, MockSignalingServer};
use serde_json::json;

fn fast_config() -> PunchConfig {
    PunchConfig {
        ping_interval: Duration::from_millis(200),
        pong_timeout: Duration::from_millis(500),
        read_timeout: Duration::from_millis(200),
        notification_timeout: Duration::from_secs(5),
        probe_timeout: Duration::from_millis(300),
        upnp_discovery_timeout: Duration::from_millis(100),
        http_timeout: Duration::from_secs(5),
    }
}

fn session_message_notification(inner: serde_json::Value) -> String {
    let payload = format!("ver=1.0, type=text, body={inner}");
    json!({
        "dataType": "sessionMessageCreated",
        "body": { "data": { "payload": payload } },
    })
    .to_string()
}

#[tokio::test]
async fn punch_hole_times_out_when_no_candidate_answers_the_probe() {
    let signaling = MockSignalingServer::start().await;
    signaling.set_session("11111111-1111-4111-8111-111111111111", 42).await;
    let push = MockPushServer::start().await;
    let silent_peer = MockProbePeer::start_silent().await;

    let transport =
        SignalingTransport::new(Endpoints { base_url: signaling.base_url() }, Duration::from_secs(5)).unwrap();
    let session = Session::init_with_push_url("test-token", push.ws_url(), transport, fast_config())
        .await
        .expect("session init");

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
    session.create_session().await.expect("create_session");

    let console_uid = [0xBBu8; 32];
    let custom_data1_wire = B64.encode(B64.encode([0x22u8; 16]));
    let console_hex = hex::encode(console_uid);
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
            "body": {"data": {"customData1": custom_data1_wire}},
        })
        .to_string(),
    );
    session
        .start_session(console_uid, ConsoleFamily::Ps5)
        .await
        .expect("start_session");

    // The peer's only candidate is a responder that never replies.
    let peer_addr = silent_peer.addr();
    let offer = json!({
        "action": "OFFER",
        "reqId": 10,
        "error": 0,
        "connRequest": {
            "sid": 4660,
            "peerSid": 0,
            "skey": "AAAAAAAAAAAAAAAAAAAAAA==",
            "natType": 2,
            "candidates": [{
                "type": "LOCAL",
                "addr": peer_addr.ip().to_string(),
                "mappedAddr": "",
                "port": peer_addr.port(),
                "mappedPort": 0,
            }],
            "defaultRouteMacAddr": "00:00:00:00:00:00",
            "localHashedId": "AQIDBAUGBwgJCgsMDQ4PEBESExQ=",
        },
    });
    push.push_notification(session_message_notification(offer));

    let punch_task = tokio::spawn(async move { session.punch_hole(Channel::Ctrl).await });

    // Acknowledge our own OFFER so punch_hole reaches the probe step instead
    // of timing out earlier while waiting for the console's RESULT.
    tokio::time::sleep(Duration::from_millis(150)).await;
    push.push_notification(session_message_notification(json!({
        "action": "RESULT",
        "reqId": 1,
        "error": 0,
        "connRequest": {},
    })));

    let result = tokio::time::timeout(Duration::from_secs(5), punch_task)
        .await
        .expect("punch_hole task did not hang")
        .expect("punch_hole task did not panic");

    assert!(matches!(result, Err(CoreError::Timeout(_))), "expected Timeout, got {result:?}");
}
