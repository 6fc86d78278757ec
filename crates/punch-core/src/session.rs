//! The session state machine and the crate's public surface.
//!
//! Grounded on `services/receiver/src/session.rs` for the "drive the
//! protocol, consume notifications, emit acks" orchestration shape, and on
//! `services/forwarder/src/uplink.rs` for exposing that orchestration as
//! async methods on a typed handle rather than free functions over an
//! opaque pointer.

use std::sync::Arc;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::codec;
use crate::config::PunchConfig;
use crate::discovery::{self, DEFAULT_STUN_SERVER, PortMapping};
use crate::error::{CoreError, Result};
use crate::model::{
    Action, Candidate, CandidateKind, Channel, ConnectionRequest, ConsoleFamily, DeviceInfo,
    NotificationKind, SessionMessage, State,
};
use crate::prober;
use crate::push::PushWorker;
use crate::queue::{Cursor, NotificationQueue, StateCell};
use crate::transport::{Endpoints, SignalingTransport};

/// Fixed prefix for client-generated device unique ids (DUIDs). Upstream
/// callers only require a stable prefix, not any particular bytes after it;
/// this is the value this crate standardizes on.
pub const DUID_PREFIX: &str = "RPCLIENT-WIN-";

/// Writes `DUID_PREFIX` followed by 32 cryptographically-random bytes as
/// lowercase hex, returning the number of bytes written.
pub fn generate_client_device_uid(buf: &mut [u8]) -> Result<usize> {
    let needed = DUID_PREFIX.len() + 64;
    if buf.len() < needed {
        return Err(CoreError::BufferTooSmall {
            needed,
            available: buf.len(),
        });
    }
    let mut raw = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut raw);
    let rendered = format!("{DUID_PREFIX}{}", hex::encode(raw));
    buf[..needed].copy_from_slice(rendered.as_bytes());
    Ok(needed)
}

/// Lists devices of the given console family, exposed without needing a
/// `Session` first — callers use this to pick a console before
/// `session_init`.
pub async fn list_devices(
    token: &str,
    family: ConsoleFamily,
    endpoints: Endpoints,
    config: &PunchConfig,
) -> Result<Vec<DeviceInfo>> {
    let transport = SignalingTransport::new(endpoints, config.http_timeout)?;
    transport.list_devices(token, family).await
}

/// A fresh UUIDv4, all 16 bytes drawn from the OS CSPRNG with the version/
/// variant bits set per RFC 4122.
fn generate_uuid_v4() -> String {
    Uuid::new_v4().to_string()
}

/// Mutable fields of a `Session` not covered by the notification queue or
/// state bitfield.
struct SessionFields {
    push_context_id: String,
    account_id: i64,
    console_uid: Option<[u8; 32]>,
    console_family: Option<ConsoleFamily>,
    local_side_id: u32,
    peer_side_id: Option<u32>,
    local_hashed_id: [u8; 20],
    peer_hashed_id: Option<[u8; 20]>,
    data1: [u8; 16],
    data2: [u8; 16],
    custom_data1: Option<[u8; 16]>,
    upnp_mappings: Vec<PortMapping>,
}

/// The top-level session context. Created by [`Session::init`],
/// mutated by the three phase methods, torn down by [`Session::close`]
/// (`session_fini`).
pub struct Session {
    token: Arc<String>,
    config: PunchConfig,
    transport: Arc<SignalingTransport>,
    state: Arc<StateCell>,
    queue: Arc<NotificationQueue>,
    session_id: Arc<Mutex<String>>,
    push_worker: Mutex<Option<PushWorker>>,
    /// This crate has exactly one waiter thread (the caller driving the
    /// phases sequentially), so one shared cursor suffices for each waiter
    /// to track its own last-known position. Tracks claimed notification
    /// ids rather than a high-water mark, so a notification
    /// scanned-but-unmatched by one wait stays visible to the next.
    cursor: Mutex<Cursor>,
    fields: Mutex<SessionFields>,
    /// Test-only seam: when set, `punch_hole` uses this in place of a real
    /// UPnP/STUN lookup so integration tests don't depend on network/gateway
    /// access. `None` in production.
    static_candidate_override: Mutex<Option<Candidate>>,
}

impl Session {
    /// Initializes a new session for the given token and endpoints. This
    /// crate emits `tracing` events rather than taking an explicit logger
    /// handle.
    ///
    /// Resolves the push FQDN, starts the push worker, and generates all of
    /// this session's random identifiers up front.
    pub async fn init(token: impl Into<String>, endpoints: Endpoints, config: PunchConfig) -> Result<Self> {
        let token = token.into();
        let transport = SignalingTransport::new(endpoints, config.http_timeout)?;
        let fqdn = transport.push_fqdn(&token).await?;
        let ws_url = format!("wss://{fqdn}/np/pushNotification");
        Self::init_with_push_url(token, ws_url, transport, config).await
    }

    /// Test-only injection seam: like [`Session::init`], but the caller
    /// supplies the push endpoint and transport directly instead of
    /// resolving them against the real vendor service — lets integration
    /// tests point the push worker at a plaintext mock server.
    #[doc(hidden)]
    pub async fn init_with_push_url(
        token: impl Into<String>,
        ws_url: String,
        transport: SignalingTransport,
        config: PunchConfig,
    ) -> Result<Self> {
        let token = Arc::new(token.into());
        let transport = Arc::new(transport);
        let state = Arc::new(StateCell::new());
        let queue = Arc::new(NotificationQueue::new());
        let session_id = Arc::new(Mutex::new(String::new()));

        let worker = PushWorker::spawn(
            ws_url,
            Arc::clone(&token),
            Arc::clone(&session_id),
            Arc::clone(&transport),
            Arc::clone(&state),
            Arc::clone(&queue),
            config.clone(),
        );

        let mut rng = rand::thread_rng();
        let local_side_id = rng.next_u32();
        let mut local_hashed_id = [0u8; 20];
        rng.fill_bytes(&mut local_hashed_id);
        let mut data1 = [0u8; 16];
        rng.fill_bytes(&mut data1);
        let mut data2 = [0u8; 16];
        rng.fill_bytes(&mut data2);
        let push_context_id = generate_uuid_v4();

        Ok(Session {
            token,
            config,
            transport,
            state,
            queue,
            session_id,
            push_worker: Mutex::new(Some(worker)),
            cursor: Mutex::new(Cursor::new()),
            static_candidate_override: Mutex::new(None),
            fields: Mutex::new(SessionFields {
                push_context_id,
                account_id: 0,
                console_uid: None,
                console_family: None,
                local_side_id,
                peer_side_id: None,
                local_hashed_id,
                peer_hashed_id: None,
                data1,
                data2,
                custom_data1: None,
                upnp_mappings: Vec::new(),
            }),
        })
    }

    /// Test-only injection seam: force the STATIC candidate `punch_hole`
    /// advertises in its own OFFER, bypassing UPnP discovery and the STUN
    /// fallback entirely.
    #[doc(hidden)]
    pub async fn set_static_candidate_override(&self, candidate: Candidate) {
        *self.static_candidate_override.lock().await = Some(candidate);
    }

    /// Creates the session: await `WsOpen`, POST the session-creation
    /// template, then await `SessionCreated` and `MemberCreated` both
    /// observed within the notification timeout.
    pub async fn create_session(&self) -> Result<()> {
        if let Err(e) = self.create_session_inner().await {
            // On any fatal error, the worker is stopped and resources
            // released.
            self.stop_worker().await;
            return Err(e);
        }
        Ok(())
    }

    async fn create_session_inner(&self) -> Result<()> {
        self.state
            .wait_for(State::WS_OPEN, self.config.notification_timeout, "WsOpen")
            .await?;

        let push_context_id = self.fields.lock().await.push_context_id.clone();
        let (session_id, account_id) = self.transport.create_session(&self.token, &push_context_id).await?;
        *self.session_id.lock().await = session_id;
        self.fields.lock().await.account_id = account_id;

        let mut cursor = self.cursor.lock().await;
        self.queue
            .wait_for_pair(
                &mut cursor,
                self.config.notification_timeout,
                "SessionCreated+MemberCreated",
                |n| (n.kind == NotificationKind::SessionCreated).then_some(()),
                |n| (n.kind == NotificationKind::MemberCreated).then_some(()),
            )
            .await?;
        drop(cursor);

        self.state.set(State::CREATED).await;
        self.state.set(State::CLIENT_JOINED).await;
        info!("session created");
        Ok(())
    }

    /// Starts the session. Preconditions: `CREATED`, not `STARTED`.
    pub async fn start_session(&self, console_uid: [u8; 32], family: ConsoleFamily) -> Result<()> {
        if !self.state.contains(State::CREATED).await {
            return Err(CoreError::Uninitialized("start_session requires CREATED".into()));
        }
        if self.state.contains(State::STARTED).await {
            return Err(CoreError::Uninitialized("start_session already STARTED".into()));
        }

        let (session_id, account_id, data1, data2) = {
            let mut fields = self.fields.lock().await;
            fields.console_uid = Some(console_uid);
            fields.console_family = Some(family);
            (
                self.session_id.lock().await.clone(),
                fields.account_id,
                fields.data1,
                fields.data2,
            )
        };

        self.transport
            .start_session(&self.token, &session_id, account_id, &data1, &data2)
            .await?;
        self.state.set(State::STARTED).await;
        self.state.set(State::DATA_SENT).await;

        let console_hex = hex::encode(console_uid);
        let mut cursor = self.cursor.lock().await;
        let (_, custom_data1) = self
            .queue
            .wait_for_pair(
                &mut cursor,
                self.config.notification_timeout,
                "MemberCreated(console)+CustomData1Updated",
                |n| {
                    if n.kind != NotificationKind::MemberCreated {
                        return None;
                    }
                    let duid = n.json.pointer("/body/data/members/0/deviceUniqueId")?.as_str()?;
                    duid.eq_ignore_ascii_case(&console_hex).then_some(())
                },
                |n| {
                    if n.kind != NotificationKind::CustomData1Updated {
                        return None;
                    }
                    let raw = n.json.pointer("/body/data/customData1")?.as_str()?;
                    codec::decode_custom_data1(raw).ok()
                },
            )
            .await?;
        drop(cursor);

        self.fields.lock().await.custom_data1 = Some(custom_data1);
        self.state.set(State::CONSOLE_JOINED).await;
        self.state.set(State::CUSTOMDATA1_RECEIVED).await;
        info!("console joined, customData1 received");
        Ok(())
    }

    /// Negotiates and establishes a hole-punched UDP channel. Preconditions:
    /// `CUSTOMDATA1_RECEIVED` for CTRL, `CTRL_ESTABLISHED` for DATA.
    pub async fn punch_hole(&self, channel: Channel) -> Result<UdpSocket> {
        match channel {
            Channel::Ctrl if !self.state.contains(State::CUSTOMDATA1_RECEIVED).await => {
                return Err(CoreError::Uninitialized("punch_hole(CTRL) requires CustomData1Received".into()));
            }
            Channel::Data if !self.state.contains(State::CTRL_ESTABLISHED).await => {
                return Err(CoreError::Uninitialized("punch_hole(DATA) requires CtrlEstablished".into()));
            }
            _ => {}
        }

        let session_id = self.session_id.lock().await.clone();

        // Step 1: await the peer's OFFER.
        let mut cursor = self.cursor.lock().await;
        let offer = self
            .queue
            .wait_for(&mut cursor, self.config.notification_timeout, "peer OFFER", |n| {
                decode_payload(n).filter(|m| m.action == Action::Offer)
            })
            .await?;
        drop(cursor);

        let peer_conn = offer
            .conn_request
            .as_ref()
            .ok_or_else(|| CoreError::Schema("OFFER missing connRequest".into()))?;
        let peer_hashed_id = peer_conn.local_hashed_id;
        let peer_sid = peer_conn.sid;
        {
            let mut fields = self.fields.lock().await;
            fields.peer_hashed_id = Some(peer_hashed_id);
            fields.peer_side_id = Some(peer_sid);
        }
        self.state.set(channel.offer_received()).await;
        info!(?channel, req_id = offer.req_id, "peer OFFER received");

        // Step 2: ack it immediately.
        let ack = SessionMessage {
            action: Action::Result,
            req_id: offer.req_id,
            error: 0,
            conn_request: Some(ConnectionRequest::empty()),
        };
        self.transport.send_session_message(&self.token, &session_id, &ack).await?;

        // Step 3: build and send our own OFFER.
        let (local_hashed_id, local_side_id) = {
            let fields = self.fields.lock().await;
            (fields.local_hashed_id, fields.local_side_id)
        };
        // Reserve an ephemeral port to advertise; the prober opens its own
        // sockets per peer candidate, so this one only needs to live long
        // enough to read back its assigned port.
        let reservation = UdpSocket::bind("0.0.0.0:0").await?;
        let local_port = reservation.local_addr()?.port();
        drop(reservation);

        let local_cand = discovery::local_candidate(local_port)?;
        let override_cand = self.static_candidate_override.lock().await.clone();
        let static_cand = match override_cand {
            Some(c) => c,
            None => {
                let (static_cand, mapping) = discovery::static_candidate(
                    local_port,
                    self.config.upnp_discovery_timeout,
                    DEFAULT_STUN_SERVER,
                )
                .await?;
                if let Some(m) = mapping {
                    self.fields.lock().await.upnp_mappings.push(m);
                }
                static_cand
            }
        };
        let default_route_mac = discovery::default_route_mac();

        let our_req_id = channel.offer_req_id();
        let our_offer = SessionMessage {
            action: Action::Offer,
            req_id: our_req_id,
            error: 0,
            conn_request: Some(ConnectionRequest {
                sid: local_side_id,
                peer_sid,
                skey: [0u8; 16],
                nat_type: 2,
                candidates: vec![local_cand, static_cand],
                default_route_mac,
                local_hashed_id,
            }),
        };
        self.transport.send_session_message(&self.token, &session_id, &our_offer).await?;
        self.state.set(channel.offer_sent()).await;
        info!(?channel, req_id = our_req_id, "OFFER sent");

        // Step 4: await the console's RESULT for our OFFER.
        let mut cursor = self.cursor.lock().await;
        self.queue
            .wait_for(&mut cursor, self.config.notification_timeout, "RESULT for our OFFER", |n| {
                decode_payload(n).filter(|m| m.action == Action::Result && m.req_id == our_req_id).map(|_| ())
            })
            .await?;
        drop(cursor);
        self.state.set(channel.console_accepted()).await;

        // Step 5: probe the peer's candidates, then ACCEPT the winner.
        let (socket, selected, _) = prober::probe(
            &peer_conn.candidates,
            local_hashed_id,
            peer_hashed_id,
            local_side_id as u16,
            peer_sid as u16,
            self.config.probe_timeout,
        )
        .await?;

        let nat_type = if selected.kind == CandidateKind::Local { 0 } else { 2 };
        let accept = SessionMessage {
            action: Action::Accept,
            req_id: channel.accept_req_id(),
            error: 0,
            conn_request: Some(ConnectionRequest {
                sid: local_side_id,
                peer_sid,
                skey: [0u8; 16],
                nat_type,
                candidates: vec![selected],
                default_route_mac,
                local_hashed_id,
            }),
        };
        self.transport.send_session_message(&self.token, &session_id, &accept).await?;
        self.state.set(channel.client_accepted()).await;

        // Step 6: await the peer's ACCEPT.
        let mut cursor = self.cursor.lock().await;
        self.queue
            .wait_for(&mut cursor, self.config.notification_timeout, "peer ACCEPT", |n| {
                decode_payload(n).filter(|m| m.action == Action::Accept).map(|_| ())
            })
            .await?;
        drop(cursor);

        self.state.set(channel.established()).await;
        info!(?channel, "channel established");
        Ok(socket)
    }

    async fn stop_worker(&self) {
        if let Some(worker) = self.push_worker.lock().await.take() {
            worker.shutdown().await;
        }
    }

    /// Tears down the session: joins the push worker and releases every
    /// UPnP mapping added during OFFER construction.
    pub async fn close(&self) {
        self.stop_worker().await;
        let mappings = std::mem::take(&mut self.fields.lock().await.upnp_mappings);
        for mapping in mappings {
            discovery::release_mapping(mapping).await;
        }
    }
}

/// Extract and decode a `SessionMessageCreated` notification's inner
/// session message, discarding anything that doesn't parse — waiters only
/// care about well-formed matches.
fn decode_payload(n: &crate::model::Notification) -> Option<SessionMessage> {
    if n.kind != NotificationKind::SessionMessageCreated {
        return None;
    }
    let raw = n.json.pointer("/body/data/payload")?.as_str()?;
    codec::decode_message(raw).ok()
}
