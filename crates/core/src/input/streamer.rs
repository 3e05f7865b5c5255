//! UDP/multicast TS input: reads a transport stream somebody else is
//! already sending on the LAN.
//!
//! Selected with `msys=streamer&uri=udp://239.0.1.3:1234`. A multicast
//! group address joins the group on the bound interface; a unicast address
//! just binds the port.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, BorrowedFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Result, SatipError};
use crate::input::{InputSystem, TunerSource};
use crate::mpegts::PacketBuffer;
use crate::protocol::SatipQuery;

const RECEIVE_BUFFER_SIZE: usize = 1024 * 1024 * 8;
const READ_POLL_TIMEOUT_MS: u16 = 500;

#[derive(Default)]
struct Inner {
    uri: Option<String>,
    socket: Option<UdpSocket>,
}

/// A UDP TS listener behind the [`TunerSource`] contract.
pub struct StreamerSource {
    stream_id: usize,
    bind_ip: IpAddr,
    inner: Mutex<Inner>,
}

impl StreamerSource {
    pub fn new(stream_id: usize, bind_ip: IpAddr) -> Self {
        StreamerSource {
            stream_id,
            bind_ip,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn open_listener(&self, addr: Ipv4Addr, port: u16) -> Result<UdpSocket> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| SatipError::Tuner(format!("udp socket failed: {e}")))?;
        socket
            .set_reuse_address(true)
            .and_then(|_| socket.set_recv_buffer_size(RECEIVE_BUFFER_SIZE))
            .and_then(|_| socket.set_nonblocking(true))
            .and_then(|_| socket.bind(&SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)).into()))
            .map_err(|e| SatipError::Tuner(format!("udp bind failed: {e}")))?;
        if addr.is_multicast() {
            let iface = match self.bind_ip {
                IpAddr::V4(v4) => v4,
                IpAddr::V6(_) => Ipv4Addr::UNSPECIFIED,
            };
            socket
                .join_multicast_v4(&addr, &iface)
                .map_err(|e| SatipError::Tuner(format!("multicast join failed: {e}")))?;
        }
        Ok(socket.into())
    }
}

/// Split `udp://address:port` into its parts.
fn parse_stream_uri(uri: &str) -> Option<(Ipv4Addr, u16)> {
    let rest = uri.strip_prefix("udp://").or_else(|| uri.strip_prefix("rtp://"))?;
    let (addr, port) = rest.split_once(':')?;
    Some((addr.parse().ok()?, port.parse().ok()?))
}

impl TunerSource for StreamerSource {
    fn stream_id(&self) -> usize {
        self.stream_id
    }

    fn capable_of(&self, system: InputSystem) -> bool {
        system == InputSystem::Streamer
    }

    fn parse_stream_parameters(&self, query: &SatipQuery) -> Result<()> {
        if let Some(uri) = query.get("uri") {
            let mut inner = self.inner.lock();
            if inner.uri.as_deref() != Some(uri) {
                inner.uri = Some(uri.to_string());
                inner.socket = None;
            }
        }
        Ok(())
    }

    fn update(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.socket.is_some() {
            return Ok(());
        }
        let uri = inner
            .uri
            .clone()
            .ok_or_else(|| SatipError::Tuner("streamer input without uri".to_string()))?;
        let (addr, port) = parse_stream_uri(&uri)
            .ok_or_else(|| SatipError::Tuner(format!("unusable stream uri: {uri}")))?;
        let socket = self.open_listener(addr, port)?;
        tracing::info!(stream = self.stream_id, %addr, port, "streamer listening");
        inner.socket = Some(socket);
        Ok(())
    }

    fn teardown(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.socket = None;
        Ok(())
    }

    fn is_data_available(&self) -> bool {
        let raw = {
            let inner = self.inner.lock();
            match &inner.socket {
                Some(socket) => socket.as_raw_fd(),
                None => return false,
            }
        };
        let borrowed = unsafe { BorrowedFd::borrow_raw(raw) };
        let mut fds = [PollFd::new(borrowed, PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(READ_POLL_TIMEOUT_MS)) {
            Ok(n) if n > 0 => fds[0].revents().is_some_and(|r| !r.is_empty()),
            _ => false,
        }
    }

    fn read_full_ts_packet(&self, buffer: &mut PacketBuffer) -> bool {
        let inner = self.inner.lock();
        let Some(socket) = inner.socket.as_ref() else {
            return false;
        };
        match socket.recv(buffer.free_space()) {
            Ok(n) => {
                buffer.add_written(n);
                buffer.try_syncing();
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::error!(stream = self.stream_id, error = %e, "streamer recv failed");
            }
        }
        buffer.full()
    }

    fn attribute_describe_string(&self) -> Option<String> {
        let inner = self.inner.lock();
        inner.socket.as_ref()?;
        let uri = inner.uri.as_ref()?;
        Some(format!(
            "ver=1.5;tuner={};uri={}",
            self.stream_id + 1,
            uri
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_udp_uri() {
        assert_eq!(
            parse_stream_uri("udp://239.0.1.3:1234"),
            Some((Ipv4Addr::new(239, 0, 1, 3), 1234))
        );
        assert!(parse_stream_uri("http://x:1").is_none());
        assert!(parse_stream_uri("udp://noport").is_none());
    }

    #[test]
    fn update_without_uri_fails() {
        let source = StreamerSource::new(0, IpAddr::from([127, 0, 0, 1]));
        assert!(source.update().is_err());
    }

    #[test]
    fn unicast_listener_receives() {
        let source = StreamerSource::new(1, IpAddr::from([127, 0, 0, 1]));
        source
            .parse_stream_parameters(&SatipQuery::from_uri(
                "rtsp://h/?msys=streamer&uri=udp://127.0.0.1:0",
            ))
            .unwrap();
        // port 0 binds an ephemeral port; resolve it for the sender
        source.update().unwrap();
        let port = {
            let inner = source.inner.lock();
            inner.socket.as_ref().unwrap().local_addr().unwrap().port()
        };

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut pkt = [0u8; 188];
        pkt[0] = 0x47;
        for _ in 0..7 {
            sender.send_to(&pkt, ("127.0.0.1", port)).unwrap();
        }

        assert!(source.is_data_available());
        let mut buffer = PacketBuffer::new();
        buffer.initialize(1, 0);
        let mut full = false;
        for _ in 0..10 {
            if source.read_full_ts_packet(&mut buffer) {
                full = true;
                break;
            }
        }
        assert!(full, "seven datagrams fill one buffer");
        assert!(buffer.is_synced());
    }
}
