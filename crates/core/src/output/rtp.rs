//! The RTP packet sender: stamps the live sequence number and timestamp
//! into a buffer's prebuilt header and pushes it over the negotiated
//! transport.
//!
//! UDP send failures split into two classes: `EAGAIN` drops the packet and
//! keeps going (a counter records it); anything else means the peer is
//! gone and the caller flips the client's self-destruct flag.

use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;

use socket2::SockRef;

use crate::mpegts::PacketBuffer;

use super::rtp_tcp;

/// Where one stream's RTP (or RTCP) packets go.
pub enum SenderTransport {
    Udp {
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
    },
    Tcp {
        socket: TcpStream,
        channel: u8,
    },
}

/// Result of one send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent(usize),
    /// Transient (`EAGAIN`): packet dropped, pump continues.
    Dropped,
    /// Hard error: raise the client's self-destruct flag.
    PeerGone,
}

/// Sequence-stamping sender for one stream's RTP flow.
pub struct RtpSender {
    transport: SenderTransport,
    sequence: u16,
    dropped: u64,
}

impl RtpSender {
    pub fn new(transport: SenderTransport) -> Self {
        if let SenderTransport::Udp { socket, .. } = &transport {
            scale_send_buffer(socket);
        }
        RtpSender {
            transport,
            sequence: 0,
            dropped: 0,
        }
    }

    /// Packets dropped on `EAGAIN` so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Sequence number of the last sent packet.
    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Stamp and send one filled buffer.
    pub fn send_frame(&mut self, buffer: &mut PacketBuffer, timestamp: u32) -> SendOutcome {
        self.sequence = self.sequence.wrapping_add(1);
        buffer.stamp(self.sequence, timestamp);
        let frame = buffer.frame();

        match &self.transport {
            SenderTransport::Udp { socket, dest } => match socket.send_to(frame, dest) {
                Ok(n) => SendOutcome::Sent(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.dropped += 1;
                    SendOutcome::Dropped
                }
                Err(_) => SendOutcome::PeerGone,
            },
            SenderTransport::Tcp { socket, channel } => {
                match rtp_tcp::send_interleaved(socket, *channel, frame) {
                    Ok(()) => SendOutcome::Sent(frame.len()),
                    Err(_) => SendOutcome::PeerGone,
                }
            }
        }
    }

    /// Send a raw (non-RTP) payload on the same transport; used by the
    /// RTCP pump.
    pub fn send_raw(&mut self, payload: &[u8]) -> SendOutcome {
        match &self.transport {
            SenderTransport::Udp { socket, dest } => match socket.send_to(payload, dest) {
                Ok(n) => SendOutcome::Sent(n),
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    self.dropped += 1;
                    SendOutcome::Dropped
                }
                Err(_) => SendOutcome::PeerGone,
            },
            SenderTransport::Tcp { socket, channel } => {
                match rtp_tcp::send_interleaved(socket, *channel, payload) {
                    Ok(()) => SendOutcome::Sent(payload.len()),
                    Err(_) => SendOutcome::PeerGone,
                }
            }
        }
    }
}

/// Grow a socket's send buffer to twenty times the OS default; live TS
/// bursts overrun the stock size.
fn scale_send_buffer(socket: &UdpSocket) {
    let sock = SockRef::from(socket);
    if let Ok(default) = sock.send_buffer_size() {
        let scaled = default * 20;
        if sock.set_send_buffer_size(scaled).is_ok() {
            tracing::debug!(bytes = scaled, "network send buffer scaled");
        }
    }
}
