//! Stray-offer auto-ack: once the CTRL OFFER has been
//! received but CTRL isn't established yet, a second ("stray") OFFER for
//! the same channel must be acked automatically over HTTP, without the
//! caller driving anything — `punch_hole` itself is still blocked earlier
//! in its own sequence and never sees this second notification.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use punch_core::{
    Candidate, CandidateKind, Channel, ConsoleFamily, Endpoints, PunchConfig, Session,
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
        probe_timeout: Duration::from_secs(5),
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

fn offer_from(peer_addr: std::net::SocketAddr, req_id: u16) -> serde_json::Value {
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
                "addr": peer_addr.ip().to_string(),
                "mappedAddr": "",
                "port": peer_addr.port(),
                "mappedPort": 0,
            }],
            "defaultRouteMacAddr": "00:00:00:00:00:00",
            "localHashedId": "AQIDBAUGBwgJCgsMDQ4PEBESExQ=",
        },
    })
}

#[tokio::test]
async fn a_second_offer_before_ctrl_established_is_auto_acked_over_http() {
    let signaling = MockSignalingServer::start().await;
    signaling.set_session("11111111-1111-4111-8111-111111111111", 42).await;
    let mut push = MockPushServer::start().await;
    let probe_peer = MockProbePeer::start().await;

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

    // The push worker's first keepalive PING, forwarded by the mock so this
    // test can show the helper observing real client traffic rather than
    // sitting unused.
    assert_eq!(push.recv_from_client().await.as_deref(), Some("PING"));

    push.push_notification(json!({"dataType": "sessionCreated", "body": {"data": {}}}).to_string());
    push.push_notification(
        json!({"dataType": "memberCreated", "body": {"data": {"members": [{"deviceUniqueId": "me"}]}}}).to_string(),
    );
    session.create_session().await.expect("create_session");

    let console_uid = [0xCCu8; 32];
    let custom_data1_wire = B64.encode(B64.encode([0x33u8; 16]));
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

    push.push_notification(session_message_notification(offer_from(probe_peer.addr(), 10)));

    let punch_task = tokio::spawn(async move { session.punch_hole(Channel::Ctrl).await });

    // Give punch_hole time to observe the first OFFER, set CtrlOfferReceived,
    // and start building/sending its own OFFER — CtrlEstablished is still
    // far off at this point (it needs a probe round-trip and an ACCEPT).
    tokio::time::sleep(Duration::from_millis(150)).await;

    // A second, stray OFFER for the same channel arrives (e.g. the console
    // retransmitted it). Nothing in punch_hole's own sequence is waiting for
    // this one — the opportunistic auto-ack in the push worker must answer
    // it directly.
    push.push_notification(session_message_notification(offer_from(probe_peer.addr(), 99)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    let sent = signaling.sent_messages().await;
    let acked_99 = sent.iter().any(|m| {
        m.get("payload").and_then(|p| p.as_str()).map(|p| p.contains("\"reqId\":99")).unwrap_or(false)
    });
    assert!(acked_99, "expected an auto-acked RESULT for reqId 99, got {sent:?}");

    punch_task.abort();
}
