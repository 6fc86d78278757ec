//! Address discovery: local interface enumeration, UPnP port mapping, and
//! STUN fallback for building reachability candidates.
//!
//! Enumerates local interface addresses, asks a UPnP IGD for the external
//! IP and a port mapping, and falls back to STUN. No teacher analogue — the
//! timing-system workspace never does NAT traversal — so this is enriched
//! from the P2P/NAT-traversal retrieval files (`nat-signaling.rs`,
//! `web_rtc.rs`) for the "gather local, then fall back across external
//! sources" shape, kept in this crate's `tracing` + `thiserror` idiom.

use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::model::{Candidate, CandidateKind};

/// Default STUN fallback server — a widely-reachable public STUN server,
/// the same choice other NAT-traversal examples in the retrieval pack
/// default to.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// A UPnP port mapping added during OFFER construction, tracked so
/// `session_fini` can issue one `DeletePortMapping` per entry.
#[derive(Debug, Clone)]
pub struct PortMapping {
    pub external_port: u16,
    pub internal_port: u16,
    pub gateway: igd_next::aio::tokio::Gateway,
}

/// The first non-loopback, up, IPv4 interface address.
pub fn local_candidate(port: u16) -> Result<Candidate> {
    let addr = local_ipv4_address()?;
    Ok(Candidate {
        kind: CandidateKind::Local,
        addr: addr.to_string(),
        mapped_addr: String::new(),
        port,
        mapped_port: 0,
    })
}

fn local_ipv4_address() -> Result<Ipv4Addr> {
    let ifaces = if_addrs::get_if_addrs()
        .map_err(|e| CoreError::Network(format!("interface enumeration failed: {e}")))?;
    ifaces
        .into_iter()
        .find(|i| !i.is_loopback() && i.ip().is_ipv4())
        .and_then(|i| match i.ip() {
            IpAddr::V4(v4) => Some(v4),
            IpAddr::V6(_) => None,
        })
        .ok_or_else(|| CoreError::Network("no usable local IPv4 interface".into()))
}

/// The STATIC candidate: UPnP first, STUN fallback.
///
/// Returns the external candidate and, if UPnP succeeded, the port mapping
/// to remember for teardown.
pub async fn static_candidate(
    local_port: u16,
    upnp_discovery_timeout: Duration,
    stun_server: &str,
) -> Result<(Candidate, Option<PortMapping>)> {
    match upnp_external_address(local_port, upnp_discovery_timeout).await {
        Ok((addr, mapping)) => {
            info!(%addr, "external address via UPnP");
            Ok((
                Candidate {
                    kind: CandidateKind::Static,
                    addr: addr.to_string(),
                    mapped_addr: addr.to_string(),
                    port: local_port,
                    mapped_port: local_port,
                },
                Some(mapping),
            ))
        }
        Err(e) => {
            debug!(error = %e, "UPnP discovery failed, falling back to STUN");
            let addr = stun_external_address(local_port, stun_server).await?;
            info!(%addr, "external address via STUN");
            Ok((
                Candidate {
                    kind: CandidateKind::Static,
                    addr: addr.ip().to_string(),
                    mapped_addr: addr.ip().to_string(),
                    port: local_port,
                    mapped_port: addr.port(),
                },
                None,
            ))
        }
    }
}

async fn upnp_external_address(
    local_port: u16,
    discovery_timeout: Duration,
) -> Result<(Ipv4Addr, PortMapping)> {
    let gateway = igd_next::aio::tokio::search_gateway(igd_next::SearchOptions {
        timeout: Some(discovery_timeout),
        ..Default::default()
    })
    .await
    .map_err(|e| CoreError::Network(format!("UPnP gateway discovery failed: {e}")))?;

    let external_ip = gateway
        .get_external_ip()
        .await
        .map_err(|e| CoreError::Network(format!("UPnP get_external_ip failed: {e}")))?;
    let IpAddr::V4(external_ip) = external_ip else {
        return Err(CoreError::Network("UPnP returned a non-IPv4 external address".into()));
    };

    let local_ip = local_ipv4_address()?;
    gateway
        .add_port(
            igd_next::PortMappingProtocol::UDP,
            local_port,
            SocketAddrV4::new(local_ip, local_port),
            0, // lifetime of the session; torn down explicitly in session_fini
            "remote-play hole punch",
        )
        .await
        .map_err(|e| CoreError::Network(format!("UPnP add_port failed: {e}")))?;

    Ok((
        external_ip,
        PortMapping {
            external_port: local_port,
            internal_port: local_port,
            gateway,
        },
    ))
}

async fn stun_external_address(local_port: u16, stun_server: &str) -> Result<std::net::SocketAddr> {
    let server = stun_server.to_owned();
    tokio::task::spawn_blocking(move || {
        let udp = std::net::UdpSocket::bind(("0.0.0.0", local_port))
            .map_err(|e| CoreError::Network(format!("STUN bind failed: {e}")))?;
        let stun_addr: std::net::SocketAddr = std::net::ToSocketAddrs::to_socket_addrs(&server)
            .map_err(|e| CoreError::Network(format!("STUN server address resolution failed: {e}")))?
            .next()
            .ok_or_else(|| CoreError::Network("STUN server has no addresses".into()))?;
        let client = stunclient::StunClient::new(stun_addr);
        client
            .query_external_address(&udp)
            .map_err(|e| CoreError::Network(format!("STUN query failed: {e}")))
    })
    .await
    .map_err(|e| CoreError::Unknown(format!("STUN task panicked: {e}")))?
}

/// Release a previously-added UPnP mapping: one `DeletePortMapping` per
/// mapping added, issued by `session_fini`.
pub async fn release_mapping(mapping: PortMapping) {
    if let Err(e) = mapping
        .gateway
        .remove_port(igd_next::PortMappingProtocol::UDP, mapping.external_port)
        .await
    {
        warn!(error = %e, port = mapping.external_port, "failed to remove UPnP port mapping");
    }
}

/// MAC address of the default-route interface, via a platform ARP query;
/// zeroed if unavailable.
///
/// IPv4-only by construction: this looks up the ARP neighbor entry for the
/// default gateway's IPv4 address, which on most platforms requires reading
/// `/proc/net/arp` (Linux) or an equivalent table; it returns zeros whenever
/// that lookup isn't possible.
pub fn default_route_mac() -> [u8; 6] {
    #[cfg(target_os = "linux")]
    {
        if let Some(mac) = linux_arp_default_route_mac() {
            return mac;
        }
    }
    [0u8; 6]
}

#[cfg(target_os = "linux")]
fn linux_arp_default_route_mac() -> Option<[u8; 6]> {
    let routes = std::fs::read_to_string("/proc/net/route").ok()?;
    let default_iface = routes.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let iface = fields.next()?;
        let dest = fields.next()?;
        (dest == "00000000").then(|| iface.to_owned())
    })?;

    let arp = std::fs::read_to_string("/proc/net/arp").ok()?;
    for line in arp.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 6 && fields[5] == default_iface {
            return parse_mac_colon(fields[3]);
        }
    }
    None
}

#[cfg(target_os = "linux")]
fn parse_mac_colon(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }
    for (i, p) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(p, 16).ok()?;
    }
    Some(mac)
}
