//! The candidate prober: sends a challenge/response probe to each
//! reachability candidate and picks the winner.
//!
//! 88-byte big-endian challenge/response over UDP. Wire layout is a raw
//! byte buffer, not JSON — same "fixed-field struct, explicit encode/decode"
//! idiom as `rt-protocol`, just applied to bytes instead of `serde_json`.
//! Fan-in-with-timeout concurrency is grounded on
//! `services/receiver/src/session.rs`'s `tokio::select!` loop, here
//! generalized to N candidates via a `JoinSet`.

use std::net::SocketAddr;
use std::time::Duration;

use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{Candidate, CandidateKind};

const MSG_TYPE_REQ: u32 = 6;
const MSG_TYPE_RESP: u32 = 7;
const FRAME_LEN: usize = 88;

/// Build the 88-byte challenge frame, bit-exact.
fn build_request(
    local_hashed_id: &[u8; 20],
    peer_hashed_id: &[u8; 20],
    sid_local: u16,
    sid_console: u16,
    request_id: u32,
) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[0x00..0x04].copy_from_slice(&MSG_TYPE_REQ.to_be_bytes());
    frame[0x04..0x04 + 20].copy_from_slice(local_hashed_id);
    frame[0x24..0x24 + 20].copy_from_slice(peer_hashed_id);
    frame[0x44..0x46].copy_from_slice(&sid_local.to_be_bytes());
    frame[0x46..0x48].copy_from_slice(&sid_console.to_be_bytes());
    frame[0x48..0x4C].copy_from_slice(&request_id.to_be_bytes());
    frame
}

fn validate_response(buf: &[u8], expected_request_id: u32) -> bool {
    if buf.len() != FRAME_LEN {
        return false;
    }
    let msg_type = u32::from_be_bytes(buf[0x00..0x04].try_into().unwrap());
    let request_id = u32::from_be_bytes(buf[0x48..0x4C].try_into().unwrap());
    msg_type == MSG_TYPE_RESP && request_id == expected_request_id
}

/// The outcome of probing one candidate.
struct ProbeHit {
    candidate: Candidate,
    socket: UdpSocket,
}

/// Probe all `candidates` concurrently; return the selected socket, its
/// local port, and which candidate won.
///
/// Tie-break: the first LOCAL candidate that validates wins immediately;
/// otherwise the first validating STATIC candidate wins once the bound
/// elapses with no LOCAL winner.
pub async fn probe(
    candidates: &[Candidate],
    local_hashed_id: [u8; 20],
    peer_hashed_id: [u8; 20],
    sid_local: u16,
    sid_console: u16,
    bound: Duration,
) -> Result<(UdpSocket, Candidate, u16)> {
    if candidates.is_empty() {
        return Err(CoreError::Timeout("candidate probe (no candidates)".into()));
    }

    let mut set: JoinSet<Option<ProbeHit>> = JoinSet::new();
    for candidate in candidates.iter().cloned() {
        let request_id = rand::thread_rng().next_u32();
        set.spawn(probe_one(
            candidate,
            local_hashed_id,
            peer_hashed_id,
            sid_local,
            sid_console,
            request_id,
        ));
    }

    let deadline = tokio::time::Instant::now() + bound;
    let mut best_static: Option<ProbeHit> = None;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        let next = tokio::time::timeout(remaining, set.join_next()).await;
        match next {
            Err(_) => break, // bound elapsed
            Ok(None) => break, // all tasks finished
            Ok(Some(joined)) => {
                let Ok(Some(hit)) = joined else { continue };
                match hit.candidate.kind {
                    CandidateKind::Local => {
                        info!(addr = %hit.candidate.addr, "prober: LOCAL candidate validated, selecting immediately");
                        set.abort_all();
                        let port = hit.socket.local_addr().map(|a| a.port()).unwrap_or(0);
                        return Ok((hit.socket, hit.candidate, port));
                    }
                    CandidateKind::Static if best_static.is_none() => {
                        debug!(addr = %hit.candidate.addr, "prober: STATIC candidate validated");
                        best_static = Some(hit);
                    }
                    CandidateKind::Static => {}
                }
            }
        }
    }

    set.abort_all();
    if let Some(hit) = best_static {
        info!(addr = %hit.candidate.addr, "prober: selecting first STATIC responder");
        let port = hit.socket.local_addr().map(|a| a.port()).unwrap_or(0);
        return Ok((hit.socket, hit.candidate, port));
    }

    warn!("prober: no candidate responded before timeout");
    Err(CoreError::Timeout("candidate probe".into()))
}

async fn probe_one(
    candidate: Candidate,
    local_hashed_id: [u8; 20],
    peer_hashed_id: [u8; 20],
    sid_local: u16,
    sid_console: u16,
    request_id: u32,
) -> Option<ProbeHit> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    let target: SocketAddr = format!("{}:{}", candidate.addr, candidate.port).parse().ok()?;
    socket.connect(target).await.ok()?;

    let frame = build_request(&local_hashed_id, &peer_hashed_id, sid_local, sid_console, request_id);
    socket.send(&frame).await.ok()?;
    debug!(addr = %candidate.addr, port = candidate.port, "prober: sent REQ");

    let mut buf = [0u8; FRAME_LEN];
    loop {
        let n = socket.recv(&mut buf).await.ok()?;
        if n == FRAME_LEN && validate_response(&buf, request_id) {
            return Some(ProbeHit { candidate, socket });
        }
        // Not our frame (or malformed) — keep listening until the caller's
        // overall bound (enforced by the JoinSet timeout) cuts this off.
    }
}
