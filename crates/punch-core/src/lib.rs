//! UDP hole-punching core for remote-play client/console rendezvous.
//!
//! This crate drives a multi-phase signaling state machine (create →
//! start → punch) against a vendor-operated push/REST signaling service,
//! discovers this host's own reachable addresses, and probes candidate
//! UDP endpoints to select a working socket per channel (CTRL, DATA).
//!
//! It is a library: no CLI, no global `tracing` subscriber is installed
//! here — the embedder owns that. See `demos/punch-demo` for a runnable
//! harness.

mod codec;
mod config;
mod discovery;
mod error;
mod model;
mod prober;
mod push;
mod queue;
mod session;
mod transport;

pub use codec::{decode_custom_data1, encode_custom_data1};
pub use config::PunchConfig;
pub use error::{CoreError, Result};
pub use model::{
    Action, Candidate, CandidateKind, Channel, ConnectionRequest, ConsoleFamily, DeviceInfo,
    Notification, NotificationKind, SessionMessage, State,
};
pub use session::{DUID_PREFIX, Session, generate_client_device_uid, list_devices};
pub use transport::{Endpoints, SignalingTransport};
