//! Data model: the plain types exchanged between components.
//!
//! Mirrors the `rt-protocol` style of this workspace — plain `serde`-derived
//! structs, one per wire concept — except where the wire form is
//! non-conformant JSON (see `codec.rs`), which needs hand-written
//! (de)serialization instead of a derive.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Console family tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsoleFamily {
    Ps4,
    Ps5,
}

impl ConsoleFamily {
    /// The `platform` query value used by `list_devices`.
    pub fn query_value(self) -> &'static str {
        match self {
            ConsoleFamily::Ps4 => "PS4",
            ConsoleFamily::Ps5 => "PS5",
        }
    }
}

/// One entry returned by `list_devices`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    /// 32-byte device unique id, decoded from a 64-hex-char `duid`.
    pub duid: [u8; 32],
    pub name: String,
    pub remote_play_enabled: bool,
}

/// Which hole-punch channel is being established.
///
/// CTRL and DATA negotiate identically, with DATA gated on `CtrlEstablished`
/// — so this type parametrizes the one `punch_hole` implementation instead
/// of forking the logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Ctrl,
    Data,
}

/// A single reachability candidate. Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub kind: CandidateKind,
    pub addr: String,
    pub mapped_addr: String,
    pub port: u16,
    pub mapped_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    Local,
    Static,
}

/// The connection-request payload carried by an OFFER, RESULT, or ACCEPT
/// session message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    pub sid: u32,
    pub peer_sid: u32,
    pub skey: [u8; 16],
    pub nat_type: u8,
    pub candidates: Vec<Candidate>,
    pub default_route_mac: [u8; 6],
    pub local_hashed_id: [u8; 20],
}

impl ConnectionRequest {
    /// The empty connection request carried by RESULT messages (an
    /// acknowledgment has no candidates of its own to offer).
    pub fn empty() -> Self {
        ConnectionRequest {
            sid: 0,
            peer_sid: 0,
            skey: [0u8; 16],
            nat_type: 0,
            candidates: Vec::new(),
            default_route_mac: [0u8; 6],
            local_hashed_id: [0u8; 20],
        }
    }
}

/// `SessionMessage` action discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Offer,
    Result,
    Accept,
    Terminate,
    Unknown,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Offer => "OFFER",
            Action::Result => "RESULT",
            Action::Accept => "ACCEPT",
            Action::Terminate => "TERMINATE",
            Action::Unknown => "UNKNOWN",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "OFFER" => Action::Offer,
            "RESULT" => Action::Result,
            "ACCEPT" => Action::Accept,
            "TERMINATE" => Action::Terminate,
            _ => Action::Unknown,
        }
    }
}

/// A session message exchanged over the signaling channel to negotiate a
/// hole-punch candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMessage {
    pub action: Action,
    pub req_id: u16,
    pub error: u16,
    pub conn_request: Option<ConnectionRequest>,
}

/// The five notification kinds the push stream can deliver, discriminated by
/// the `dataType` field of the JSON payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    SessionCreated,
    MemberCreated,
    MemberDeleted,
    CustomData1Updated,
    SessionMessageCreated,
    #[serde(other)]
    Unknown,
}

/// A push-stream notification.
///
/// `id` is the notification's position in an append-only sequence — a
/// vector with stable ids, in place of the linked-list-with-`previous`-
/// pointer approach that makes concurrent unlinking fragile. Waiters use
/// `id` as a cursor to track which notifications they've already observed.
#[derive(Debug, Clone)]
pub struct Notification {
    pub id: u64,
    pub kind: NotificationKind,
    pub json: serde_json::Value,
    pub raw: Vec<u8>,
}

bitflags! {
    /// The monotonic progress-bit state set tracking how far a session has
    /// advanced through the create/start/punch sequence.
    ///
    /// Invariant (enforced by callers, not by the type): bits are only ever
    /// OR'd in, never cleared.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct State: u32 {
        const INIT                     = 1 << 0;
        const WS_OPEN                  = 1 << 1;
        const CREATED                  = 1 << 2;
        const STARTED                  = 1 << 3;
        const CLIENT_JOINED            = 1 << 4;
        const DATA_SENT                = 1 << 5;
        const CONSOLE_JOINED           = 1 << 6;
        const CUSTOMDATA1_RECEIVED     = 1 << 7;
        const CTRL_OFFER_RECEIVED      = 1 << 8;
        const CTRL_OFFER_SENT          = 1 << 9;
        const CTRL_CONSOLE_ACCEPTED    = 1 << 10;
        const CTRL_CLIENT_ACCEPTED     = 1 << 11;
        const CTRL_ESTABLISHED         = 1 << 12;
        const DATA_OFFER_RECEIVED      = 1 << 13;
        const DATA_OFFER_SENT          = 1 << 14;
        const DATA_CONSOLE_ACCEPTED    = 1 << 15;
        const DATA_CLIENT_ACCEPTED     = 1 << 16;
        const DATA_ESTABLISHED         = 1 << 17;
    }
}

impl Channel {
    pub fn offer_received(self) -> State {
        match self {
            Channel::Ctrl => State::CTRL_OFFER_RECEIVED,
            Channel::Data => State::DATA_OFFER_RECEIVED,
        }
    }
    pub fn offer_sent(self) -> State {
        match self {
            Channel::Ctrl => State::CTRL_OFFER_SENT,
            Channel::Data => State::DATA_OFFER_SENT,
        }
    }
    pub fn established(self) -> State {
        match self {
            Channel::Ctrl => State::CTRL_ESTABLISHED,
            Channel::Data => State::DATA_ESTABLISHED,
        }
    }
    /// Set when the console's RESULT for our OFFER arrives (punch_hole step 4).
    pub fn console_accepted(self) -> State {
        match self {
            Channel::Ctrl => State::CTRL_CONSOLE_ACCEPTED,
            Channel::Data => State::DATA_CONSOLE_ACCEPTED,
        }
    }
    /// Set when we send our own ACCEPT (punch_hole step 5).
    pub fn client_accepted(self) -> State {
        match self {
            Channel::Ctrl => State::CTRL_CLIENT_ACCEPTED,
            Channel::Data => State::DATA_CLIENT_ACCEPTED,
        }
    }
    /// The OFFER `req_id` used for this channel.
    pub fn offer_req_id(self) -> u16 {
        1
    }
    /// The ACCEPT `req_id`. Hardcoded to `2` for both channels — preserved
    /// verbatim from the original client rather than derived from the
    /// preceding OFFER's `req_id`; see DESIGN.md's Open Questions section.
    pub fn accept_req_id(self) -> u16 {
        2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_str() {
        for a in [Action::Offer, Action::Result, Action::Accept, Action::Terminate] {
            assert_eq!(Action::from_str(a.as_str()), a);
        }
    }

    #[test]
    fn unknown_action_string_maps_to_unknown() {
        assert_eq!(Action::from_str("BOGUS"), Action::Unknown);
    }

    #[test]
    fn state_bits_only_ever_accumulate() {
        let mut s = State::empty();
        s |= State::INIT;
        s |= State::WS_OPEN;
        assert!(s.contains(State::INIT));
        assert!(s.contains(State::WS_OPEN));
        assert!(!s.contains(State::CREATED));
    }

    #[test]
    fn channel_state_bits_are_disjoint_between_ctrl_and_data() {
        assert_ne!(Channel::Ctrl.offer_received(), Channel::Data.offer_received());
        assert_ne!(Channel::Ctrl.established(), Channel::Data.established());
        assert!(!Channel::Ctrl.established().intersects(Channel::Data.established()));
    }

    #[test]
    fn data_established_requires_ctrl_established_bit_is_distinct() {
        // DATA_ESTABLISHED is gated on CTRL_ESTABLISHED by the caller, not by
        // the bitflags type itself — they remain independent bits.
        assert_ne!(State::CTRL_ESTABLISHED, State::DATA_ESTABLISHED);
    }

    #[test]
    fn accept_req_id_is_hardcoded_two_for_both_channels() {
        assert_eq!(Channel::Ctrl.accept_req_id(), 2);
        assert_eq!(Channel::Data.accept_req_id(), 2);
    }

    #[test]
    fn console_family_query_values() {
        assert_eq!(ConsoleFamily::Ps4.query_value(), "PS4");
        assert_eq!(ConsoleFamily::Ps5.query_value(), "PS5");
    }

    #[test]
    fn empty_connection_request_has_zero_length_candidates() {
        let cr = ConnectionRequest::empty();
        assert!(cr.candidates.is_empty());
        assert_eq!(cr.sid, 0);
        assert_eq!(cr.skey, [0u8; 16]);
    }
}
