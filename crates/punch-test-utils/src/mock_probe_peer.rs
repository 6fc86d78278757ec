// mock_probe_peer: a stub peer for the candidate prober's 88-byte
// challenge/response wire format. Binds a UDP socket, answers every
// well-formed REQ with a RESP carrying back the same request_id.

use std::net::SocketAddr;

use tokio::net::UdpSocket;

const MSG_TYPE_RESP: u32 = 7;
const FRAME_LEN: usize = 88;

/// A mock probe-peer for integration testing of `prober::probe`.
pub struct MockProbePeer {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockProbePeer {
    /// Start a responder bound to a random local port. Every frame it
    /// receives is treated as a REQ (no further validation — the prober is
    /// the one under test); the reply always echoes `request_id`.
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock probe peer");
        let addr = socket.local_addr().expect("local_addr");

        let task = tokio::spawn(async move {
            let mut buf = [0u8; FRAME_LEN];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else { break };
                if n != FRAME_LEN {
                    continue;
                }
                let request_id = buf[0x48..0x4C].to_vec();
                let mut resp = [0u8; FRAME_LEN];
                resp[0x00..0x04].copy_from_slice(&MSG_TYPE_RESP.to_be_bytes());
                resp[0x48..0x4C].copy_from_slice(&request_id);
                let _ = socket.send_to(&resp, peer).await;
            }
        });

        MockProbePeer { addr, _task: task }
    }

    /// Address/port this peer is listening on — use as a candidate's
    /// `addr`/`port` in tests.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Start a responder that never replies, for exercising the probe
    /// timeout path.
    pub async fn start_silent() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind mock probe peer");
        let addr = socket.local_addr().expect("local_addr");
        let task = tokio::spawn(async move {
            let mut buf = [0u8; FRAME_LEN];
            loop {
                if socket.recv_from(&mut buf).await.is_err() {
                    break;
                }
                // silently drop — used to exercise the probe-timeout path
            }
        });
        MockProbePeer { addr, _task: task }
    }
}
