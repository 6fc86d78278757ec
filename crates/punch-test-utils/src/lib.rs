//! Mock servers for exercising `punch-core` without a real vendor backend.
//!
//! Mirrors `rt-test-utils`: one mock per external collaborator, each
//! binding to a random local port so tests can run in parallel.

pub mod mock_probe_peer;
pub mod mock_push_server;
pub mod mock_signaling_server;

pub use mock_probe_peer::MockProbePeer;
pub use mock_push_server::MockPushServer;
pub use mock_signaling_server::MockSignalingServer;
