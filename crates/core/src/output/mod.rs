//! RTP/RTCP output: the reader→writer buffer ring, packet senders for the
//! UDP and RTSP-interleaved transports, and the RTCP report shapes.

pub mod ring;
pub mod rtcp;
pub mod rtp;
pub mod rtp_tcp;

pub use ring::{BufferRing, MAX_BUF};
pub use rtp::{RtpSender, SendOutcome};
