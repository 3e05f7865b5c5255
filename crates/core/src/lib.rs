//! # satip — SAT>IP gateway library
//!
//! Exposes local DVB tuners (and equivalent TS sources) over the network:
//! SAT>IP clients tune channels through RTSP and receive the MPEG
//! transport stream as RTP over UDP or interleaved on the RTSP TCP
//! connection, with RTCP side-reports. Scrambled services can be
//! descrambled on the fly through an external DVB-API control-word
//! provider.
//!
//! ## Protocol references
//!
//! | Spec | Topic | How this crate uses it |
//! |------|-------|------------------------|
//! | SAT>IP 1.2.2 | DVB over IP | Query parameters, describe strings, session model |
//! | [RFC 2326](https://tools.ietf.org/html/rfc2326) | RTSP 1.0 | Request/response parsing, sessions, interleaving |
//! | [RFC 3550](https://tools.ietf.org/html/rfc3550) | RTP/RTCP | MP2T packetization, SR/SDES/APP reports |
//! | ISO/IEC 13818-1 | MPEG-TS | Packet framing, PSI sections, CRC-32 |
//! | ETSI EN 50494/50607 | Single cable | DiSEqC user-band channel change |
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │  server     — RTSP accept loop, connections │
//! │  protocol   — parsing, transport, SAT>IP    │
//! ├─────────────────────────────────────────────┤
//! │  stream     — Stream, StreamManager, client │
//! │  output     — buffer ring, RTP/RTCP pumps   │
//! ├─────────────────────────────────────────────┤
//! │  input      — DVB frontend, file, streamer  │
//! │  decrypt    — DVB-API client, CSA core      │
//! │  mpegts     — packet buffer, PIDs, tables   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Data flows tuner → packet buffer → (descramble) → RTP writer, one
//! reader and one writer thread per stream over a 32-slot ring. Control
//! flows RTSP request → stream manager → tuner configuration.
//!
//! ## Quick start
//!
//! ```no_run
//! use satip::{RtspServer, ServerConfig, StreamManager};
//!
//! let config = ServerConfig::for_interface(None);
//! let manager = StreamManager::new(&config);
//! let mut server = RtspServer::new(config, manager);
//! server.start().unwrap();
//! ```

pub mod base;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod input;
pub mod mpegts;
pub mod output;
pub mod protocol;
pub mod server;
pub mod stream;

pub use config::{CaPmtListMode, DecryptConfig, ServerConfig};
pub use error::{Result, SatipError};
pub use server::RtspServer;
pub use stream::{Stream, StreamManager};
