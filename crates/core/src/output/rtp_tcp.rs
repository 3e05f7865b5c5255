//! RTSP-interleaved framing (RFC 2326 §10.12).
//!
//! RTP and RTCP packets tunneled inside the RTSP TCP connection are
//! prefixed with a 4-byte channel header: `'$'`, the channel byte from the
//! SETUP `Transport` negotiation, and the 16-bit payload length.

use std::io::Write;
use std::net::TcpStream;

/// The interleaved channel header for a payload.
pub fn frame_header(channel: u8, len: usize) -> [u8; 4] {
    [0x24, channel, (len >> 8) as u8, (len & 0xFF) as u8]
}

/// Write one framed packet to the RTSP connection in a single write, so
/// frames do not interleave with concurrently written RTSP responses.
pub fn send_interleaved(socket: &TcpStream, channel: u8, payload: &[u8]) -> std::io::Result<()> {
    let mut framed = Vec::with_capacity(4 + payload.len());
    framed.extend_from_slice(&frame_header(channel, payload.len()));
    framed.extend_from_slice(payload);
    let mut stream = socket;
    stream.write_all(&framed)
}
