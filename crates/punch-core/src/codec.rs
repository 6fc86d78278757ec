//! The session message codec.
//!
//! The peer's JSON has a known non-conformance (`"localPeerAddr":,` with a
//! missing value) that a generic `serde_json` derive can't tolerate, so —
//! same idea as this workspace hand-parsing frames in
//! `services/receiver/src/session.rs` before trusting `serde_json` — this
//! module builds/patches the text by hand rather than deriving
//! `Serialize`/`Deserialize` on `SessionMessage`.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use serde_json::{Value, json};

use crate::error::{CoreError, Result};
use crate::model::{Action, Candidate, CandidateKind, ConnectionRequest, SessionMessage};

/// Literal prefix of the outer envelope's `payload` field.
const PAYLOAD_PREFIX: &str = "ver=1.0, type=text, body=";

/// Encode a `SessionMessage` into the canonical inner JSON.
///
/// Our own outbound `localPeerAddr` is always a concrete empty object — the
/// malformed `"localPeerAddr":,` form is only ever something we *accept*
/// from the peer, never something we emit.
pub fn encode_message(msg: &SessionMessage) -> String {
    let mut obj = serde_json::Map::new();
    obj.insert("action".into(), Value::String(msg.action.as_str().to_owned()));
    obj.insert("reqId".into(), Value::Number(msg.req_id.into()));
    obj.insert("error".into(), Value::Number(msg.error.into()));
    if let Some(cr) = &msg.conn_request {
        obj.insert("connRequest".into(), encode_conn_request(cr));
    }
    Value::Object(obj).to_string()
}

/// Wrap an encoded message in the outer envelope's `payload=` form:
/// `ver=1.0, type=text, body={json}`.
pub fn encode_envelope_payload(msg: &SessionMessage) -> String {
    format!("{PAYLOAD_PREFIX}{}", encode_message(msg))
}

fn encode_conn_request(cr: &ConnectionRequest) -> Value {
    let candidates: Vec<Value> = cr.candidates.iter().map(encode_candidate).collect();
    json!({
        "sid": cr.sid,
        "peerSid": cr.peer_sid,
        "skey": B64.encode(cr.skey),
        "natType": cr.nat_type,
        "candidates": candidates,
        "defaultRouteMacAddr": format_mac(&cr.default_route_mac),
        "localHashedId": B64.encode(cr.local_hashed_id),
        "localPeerAddr": {},
    })
}

fn encode_candidate(c: &Candidate) -> Value {
    json!({
        "type": match c.kind { CandidateKind::Local => "LOCAL", CandidateKind::Static => "STATIC" },
        "addr": c.addr,
        "mappedAddr": c.mapped_addr,
        "port": c.port,
        "mappedPort": c.mapped_port,
    })
}

fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Extract the `body=` payload from a notification's raw text and patch the
/// `"localPeerAddr":,` non-conformance before JSON-parsing.
pub fn decode_message(raw: &str) -> Result<SessionMessage> {
    let body = raw
        .find(PAYLOAD_PREFIX)
        .map(|i| &raw[i + PAYLOAD_PREFIX.len()..])
        .unwrap_or(raw);
    let patched = patch_local_peer_addr(body);
    let value: Value = serde_json::from_str(&patched)
        .map_err(|e| CoreError::Schema(format!("session message JSON: {e}")))?;
    decode_message_value(&value)
}

/// Replace the bare `"localPeerAddr":,` sequence with a patched-in `{}` so
/// the rest of the object remains well-formed JSON.
fn patch_local_peer_addr(s: &str) -> String {
    const NEEDLE: &str = "\"localPeerAddr\":";
    let Some(idx) = s.find(NEEDLE) else {
        return s.to_owned();
    };
    let after = idx + NEEDLE.len();
    let rest = s[after..].trim_start();
    if rest.starts_with(',') || rest.starts_with('}') {
        format!("{}{}{}", &s[..after], "{}", &s[after..])
    } else {
        s.to_owned()
    }
}

fn decode_message_value(value: &Value) -> Result<SessionMessage> {
    let action = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Schema("session message missing 'action'".into()))?;
    let req_id = value
        .get("reqId")
        .and_then(Value::as_u64)
        .ok_or_else(|| CoreError::Schema("session message missing 'reqId'".into()))? as u16;
    let error = field_u64(value, "error")? as u16;
    let conn_request = match value.get("connRequest") {
        None => None,
        Some(v) if v.as_object().is_some_and(serde_json::Map::is_empty) => {
            Some(ConnectionRequest::empty())
        }
        Some(v) => Some(decode_conn_request(v)?),
    };
    Ok(SessionMessage {
        action: Action::from_str(action),
        req_id,
        error,
        conn_request,
    })
}

fn decode_conn_request(v: &Value) -> Result<ConnectionRequest> {
    let sid = field_u64(v, "sid")? as u32;
    let peer_sid = field_u64(v, "peerSid")? as u32;
    let skey = decode_fixed_b64::<16>(field_str(v, "skey")?)?;
    let nat_type = field_u64(v, "natType")? as u8;
    let candidates = v
        .get("candidates")
        .and_then(Value::as_array)
        .ok_or_else(|| CoreError::Schema("connRequest missing 'candidates'".into()))?
        .iter()
        .map(decode_candidate)
        .collect::<Result<Vec<_>>>()?;
    let mac_str = field_str(v, "defaultRouteMacAddr")?;
    let default_route_mac = parse_mac(mac_str)?;
    let local_hashed_id = decode_fixed_b64::<20>(field_str(v, "localHashedId")?)?;
    Ok(ConnectionRequest {
        sid,
        peer_sid,
        skey,
        nat_type,
        candidates,
        default_route_mac,
        local_hashed_id,
    })
}

fn decode_candidate(v: &Value) -> Result<Candidate> {
    let kind = match field_str(v, "type")? {
        "LOCAL" => CandidateKind::Local,
        "STATIC" => CandidateKind::Static,
        other => return Err(CoreError::Schema(format!("unknown candidate type '{other}'"))),
    };
    Ok(Candidate {
        kind,
        addr: field_str(v, "addr")?.to_owned(),
        mapped_addr: field_str(v, "mappedAddr")?.to_owned(),
        port: field_u64(v, "port")? as u16,
        mapped_port: field_u64(v, "mappedPort")? as u16,
    })
}

fn field_str<'a>(v: &'a Value, name: &str) -> Result<&'a str> {
    v.get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| CoreError::Schema(format!("missing/ill-typed field '{name}'")))
}

fn field_u64(v: &Value, name: &str) -> Result<u64> {
    v.get(name)
        .and_then(Value::as_u64)
        .ok_or_else(|| CoreError::Schema(format!("missing/ill-typed field '{name}'")))
}

fn decode_fixed_b64<const N: usize>(s: &str) -> Result<[u8; N]> {
    let bytes = B64.decode(s)?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| CoreError::Schema(format!("expected {N} bytes, got {}", b.len())))
}

fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(CoreError::Schema(format!("malformed MAC address '{s}'")));
    }
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16)
            .map_err(|_| CoreError::Schema(format!("malformed MAC address '{s}'")))?;
    }
    Ok(mac)
}

/// `customData1` is 32 base64 characters, double-base64-encoded (decode
/// twice) into a 16-byte value.
pub fn decode_custom_data1(s: &str) -> Result<[u8; 16]> {
    let once = B64.decode(s)?;
    let twice = B64.decode(&once)?;
    twice
        .try_into()
        .map_err(|b: Vec<u8>| CoreError::Schema(format!("customData1: expected 16 bytes, got {}", b.len())))
}

/// Encode a 16-byte value the same (double-base64) way, for tests and for
/// any future outbound use.
pub fn encode_custom_data1(bytes: &[u8; 16]) -> String {
    B64.encode(B64.encode(bytes))
}
