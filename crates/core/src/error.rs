//! Error types for the SAT>IP gateway library.

use std::fmt;

/// Errors that can occur across the gateway.
///
/// Variants map to specific failure modes across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages or
///   SAT>IP query parameters. Never mutates stream state; becomes a
///   400 response.
/// - **Transport**: [`Io`](Self::Io) — socket/network failures. Transient
///   errors are absorbed at the call site; hard errors flip the client's
///   self-destruct flag.
/// - **Session**: [`SessionNotFound`](Self::SessionNotFound) — becomes 454.
/// - **Capacity**: [`NoFreeStream`](Self::NoFreeStream) — becomes 503.
/// - **Tuner**: [`Tuner`](Self::Tuner) — device open, ioctl, or lock
///   failures; the stream keeps its previous valid state and the
///   triggering request gets 503.
/// - **Decryption**: [`Decrypt`](Self::Decrypt) — provider/key problems;
///   degrades individual packets, never fatal to a stream.
#[derive(Debug, thiserror::Error)]
pub enum SatipError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No client with the given session ID exists.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// Every stream already has an active client, or no enumerated tuner
    /// supports the requested delivery system.
    #[error("no free stream for request")]
    NoFreeStream,

    /// [`RtspServer::start`](crate::server::RtspServer::start) has not been
    /// called yet.
    #[error("server not started")]
    NotStarted,

    /// [`RtspServer::start`](crate::server::RtspServer::start) was called
    /// while already running.
    #[error("server already running")]
    AlreadyRunning,

    /// Failed to parse an RTSP request (RFC 2326 §6) or a SAT>IP query.
    #[error("parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Frontend open, DiSEqC, tune, or demux configuration failure.
    #[error("tuner error: {0}")]
    Tuner(String),

    /// Control-word provider connection or CA-PMT failure.
    #[error("decrypt error: {0}")]
    Decrypt(String),
}

/// Specific kind of protocol parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
    /// No usable `CSeq:` header; every response must echo one
    /// (RFC 2326 §12.17).
    MissingCSeq,
    /// `Transport:` header did not carry usable client ports or channels.
    InvalidTransport,
    /// A SAT>IP query parameter had an unusable value (named here).
    InvalidQuery(String),
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
            Self::MissingCSeq => write!(f, "missing CSeq header"),
            Self::InvalidTransport => write!(f, "invalid transport header"),
            Self::InvalidQuery(param) => write!(f, "invalid query parameter: {param}"),
        }
    }
}

/// Convenience alias for `Result<T, SatipError>`.
pub type Result<T> = std::result::Result<T, SatipError>;
