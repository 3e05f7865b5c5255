//! RTSP response formatting (RFC 2326 §7).
//!
//! Every SAT>IP response echoes the request's CSeq, so the sequence number
//! is part of construction rather than an optional header, and the status
//! line vocabulary is the closed set the gateway actually emits. A
//! serialized response always fits a single TCP write.

use std::fmt::Write;

/// Status lines the gateway emits (RFC 2326 §7.1.1, SAT>IP §3.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Ok,
    /// Malformed transport header or SAT>IP query.
    BadRequest,
    NotFound,
    /// No client owns the presented session ID.
    SessionNotFound,
    NotImplemented,
    /// No free stream, or no tuner capable of the requested system.
    ServiceUnavailable,
    InternalServerError,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::SessionNotFound => 454,
            Self::NotImplemented => 501,
            Self::ServiceUnavailable => 503,
            Self::InternalServerError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::BadRequest => "Bad Request",
            Self::NotFound => "Not Found",
            Self::SessionNotFound => "Session Not Found",
            Self::NotImplemented => "Not Implemented",
            Self::ServiceUnavailable => "Service Unavailable",
            Self::InternalServerError => "Internal Server Error",
        }
    }
}

/// Server identification string included in every RTSP response
/// per RFC 2326 §12.36.
pub const SERVER_AGENT: &str = "satip/0.1";

/// A response under construction.
///
/// `CSeq` and `Server` are emitted for every response; method-specific
/// headers are chained with [`header`](Self::header) and a body (the
/// DESCRIBE SDP) gets its `Content-Length` computed on the way out.
#[must_use]
pub struct RtspResponse {
    status: StatusCode,
    cseq: u32,
    headers: Vec<(&'static str, String)>,
    body: Option<String>,
}

impl RtspResponse {
    pub fn new(status: StatusCode, cseq: u32) -> Self {
        RtspResponse {
            status,
            cseq,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn ok(cseq: u32) -> Self {
        Self::new(StatusCode::Ok, cseq)
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn with_body(mut self, body: String) -> Self {
        self.body = Some(body);
        self
    }

    /// Numeric status, for logging.
    pub fn status(&self) -> u16 {
        self.status.code()
    }

    /// Emit the RTSP text wire format.
    pub fn to_wire(&self) -> String {
        let mut out =
            String::with_capacity(128 + self.body.as_ref().map_or(0, String::len));
        let _ = write!(
            out,
            "RTSP/1.0 {} {}\r\nCSeq: {}\r\nServer: {SERVER_AGENT}\r\n",
            self.status.code(),
            self.status.reason(),
            self.cseq,
        );
        for (name, value) in &self.headers {
            let _ = write!(out, "{name}: {value}\r\n");
        }
        match &self.body {
            Some(body) => {
                let _ = write!(out, "Content-Length: {}\r\n\r\n{body}", body.len());
            }
            None => out.push_str("\r\n"),
        }
        out
    }
}
