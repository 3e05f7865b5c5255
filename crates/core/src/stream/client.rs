//! The remote peer attached to a stream.
//!
//! Created by SETUP, destroyed by TEARDOWN or the session sweeper. Both
//! RTSP requests and RTCP receiver reports refresh the liveness clock; a
//! peer silent on both for 60 s is reaped.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::RngExt;

/// RFC 2326 §12.37 session timeout, also advertised in the `Session`
/// response header.
pub const SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Lowest server port tried for an RTP/RTCP pair.
const SERVER_PORT_MIN: u16 = 5004;

/// Negotiated data path of a client.
pub enum ClientTransport {
    /// RTP/RTCP over UDP to the client's port pair; the server side binds
    /// an adjacent pair at SETUP.
    Udp {
        rtp_dest: SocketAddr,
        rtcp_dest: SocketAddr,
        rtp_socket: Arc<UdpSocket>,
        rtcp_socket: Arc<UdpSocket>,
    },
    /// RTP and RTCP interleaved on the RTSP TCP connection.
    Tcp {
        socket: TcpStream,
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

/// One attached SAT>IP client.
pub struct StreamClient {
    /// Random 12-digit numeric session identifier.
    pub session_id: String,
    pub ip: IpAddr,
    pub transport: ClientTransport,
    pub last_seen: Instant,
    /// Raised by the output pumps on a dead peer; the sweeper reaps it.
    pub self_destruct: bool,
    pub timeout: Duration,
}

impl StreamClient {
    pub fn new(ip: IpAddr, transport: ClientTransport) -> Self {
        StreamClient {
            session_id: generate_session_id(),
            ip,
            transport,
            last_seen: Instant::now(),
            self_destruct: false,
            timeout: SESSION_TIMEOUT,
        }
    }

    /// Record activity (RTSP request or RTCP receiver report).
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    pub fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_seen) > self.timeout
    }

    /// `Session` response header value, e.g. `012345678901;timeout=60`.
    pub fn session_header_value(&self) -> String {
        format!("{};timeout={}", self.session_id, self.timeout.as_secs())
    }

    /// Bound server ports for the SETUP `Transport` response (UDP only).
    pub fn server_ports(&self) -> Option<(u16, u16)> {
        match &self.transport {
            ClientTransport::Udp {
                rtp_socket,
                rtcp_socket,
                ..
            } => Some((
                rtp_socket.local_addr().ok()?.port(),
                rtcp_socket.local_addr().ok()?.port(),
            )),
            ClientTransport::Tcp { .. } => None,
        }
    }
}

/// Random 12-digit numeric session ID, unique process-wide with
/// overwhelming probability.
pub fn generate_session_id() -> String {
    format!("{:012}", rand::rng().random_range(0..1_000_000_000_000u64))
}

/// Bind an even/odd UDP port pair for RTP/RTCP (RFC 3550 §11), both
/// nonblocking.
pub fn allocate_udp_pair(bind_ip: IpAddr) -> io::Result<(Arc<UdpSocket>, Arc<UdpSocket>)> {
    for base in (SERVER_PORT_MIN..u16::MAX - 1).step_by(2) {
        let rtp = match UdpSocket::bind((bind_ip, base)) {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        let rtcp = match UdpSocket::bind((bind_ip, base + 1)) {
            Ok(socket) => socket,
            Err(_) => continue,
        };
        rtp.set_nonblocking(true)?;
        rtcp.set_nonblocking(true)?;
        tracing::trace!(rtp_port = base, rtcp_port = base + 1, "allocated server ports");
        return Ok((Arc::new(rtp), Arc::new(rtcp)));
    }
    Err(io::Error::other("server port range exhausted"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_twelve_digits() {
        for _ in 0..100 {
            let id = generate_session_id();
            assert_eq!(id.len(), 12);
            assert!(id.bytes().all(|b| b.is_ascii_digit()));
        }
    }

    #[test]
    fn udp_pair_is_adjacent() {
        let (rtp, rtcp) = allocate_udp_pair(IpAddr::from([127, 0, 0, 1])).unwrap();
        let rtp_port = rtp.local_addr().unwrap().port();
        let rtcp_port = rtcp.local_addr().unwrap().port();
        assert_eq!(rtcp_port, rtp_port + 1);
        assert_eq!(rtp_port % 2, 0, "RTP port is even");
    }

    #[test]
    fn expiry_honors_timeout() {
        let (rtp_socket, rtcp_socket) = allocate_udp_pair(IpAddr::from([127, 0, 0, 1])).unwrap();
        let ip = IpAddr::from([127, 0, 0, 1]);
        let mut client = StreamClient::new(
            ip,
            ClientTransport::Udp {
                rtp_dest: SocketAddr::new(ip, 45678),
                rtcp_dest: SocketAddr::new(ip, 45679),
                rtp_socket,
                rtcp_socket,
            },
        );
        let now = Instant::now();
        assert!(!client.expired(now));
        assert!(client.expired(now + Duration::from_secs(61)));
        client.timeout = Duration::from_millis(5);
        assert!(client.expired(now + Duration::from_millis(10)));
    }

    #[test]
    fn session_header_carries_timeout() {
        let (rtp_socket, rtcp_socket) = allocate_udp_pair(IpAddr::from([127, 0, 0, 1])).unwrap();
        let ip = IpAddr::from([127, 0, 0, 1]);
        let client = StreamClient::new(
            ip,
            ClientTransport::Udp {
                rtp_dest: SocketAddr::new(ip, 1000),
                rtcp_dest: SocketAddr::new(ip, 1001),
                rtp_socket,
                rtcp_socket,
            },
        );
        let value = client.session_header_value();
        assert!(value.ends_with(";timeout=60"));
        assert_eq!(value.split(';').next().unwrap().len(), 12);
    }
}
