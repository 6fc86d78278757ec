//! Tunable timeouts.
//!
//! A library has no file-based config surface, so unlike
//! `forwarder::config` this is a plain `Default`-able struct — tests build
//! one with millisecond-scale timeouts so waits resolve quickly.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// PING cadence on the push stream.
    pub ping_interval: Duration,
    /// How long to wait for a PONG after a PING before terminating.
    pub pong_timeout: Duration,
    /// Read timeout on each push-stream frame read.
    pub read_timeout: Duration,
    /// Bound on notification waits (create/start/offer-result).
    pub notification_timeout: Duration,
    /// Bound on the candidate probe.
    pub probe_timeout: Duration,
    /// UPnP gateway discovery window.
    pub upnp_discovery_timeout: Duration,
    /// Ambient: per-request HTTP timeout (distinct from the 30s
    /// notification-level timeouts above).
    pub http_timeout: Duration,
}

impl Default for PunchConfig {
    fn default() -> Self {
        PunchConfig {
            ping_interval: Duration::from_secs(5),
            pong_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            notification_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(30),
            upnp_discovery_timeout: Duration::from_secs(2),
            http_timeout: Duration::from_secs(10),
        }
    }
}
