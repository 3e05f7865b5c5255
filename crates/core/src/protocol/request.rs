//! RTSP request parsing (RFC 2326 §6), shaped around the header set
//! SAT>IP actually uses.
//!
//! SAT>IP requests never carry bodies — tuning parameters ride the URI
//! query string — so a request is just its head: one request line and a
//! handful of headers. Of those, only three matter to the gateway: `CSeq`
//! (mandatory; every response echoes it), `Session` and `Transport`.
//! Everything else is tolerated and dropped during parsing, which keeps
//! the request type a few typed fields instead of a generic header map.

use std::fmt;

use crate::error::{ParseErrorKind, Result, SatipError};

/// The methods a SAT>IP server speaks (RFC 2326 §6.1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtspMethod {
    Options,
    Describe,
    Setup,
    Play,
    Teardown,
    GetParameter,
    /// Anything else; answered with 501 and the CSeq echoed.
    Unknown(String),
}

impl RtspMethod {
    fn from_token(token: &str) -> Self {
        match token {
            "OPTIONS" => Self::Options,
            "DESCRIBE" => Self::Describe,
            "SETUP" => Self::Setup,
            "PLAY" => Self::Play,
            "TEARDOWN" => Self::Teardown,
            "GET_PARAMETER" => Self::GetParameter,
            other => Self::Unknown(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Options => "OPTIONS",
            Self::Describe => "DESCRIBE",
            Self::Setup => "SETUP",
            Self::Play => "PLAY",
            Self::Teardown => "TEARDOWN",
            Self::GetParameter => "GET_PARAMETER",
            Self::Unknown(other) => other,
        }
    }
}

impl fmt::Display for RtspMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn malformed(kind: ParseErrorKind) -> SatipError {
    SatipError::Parse { kind }
}

/// One parsed request head.
#[derive(Debug)]
pub struct RtspRequest {
    pub method: RtspMethod,
    /// Request-URI, carrying the SAT>IP query
    /// (e.g. `rtsp://host:554/?msys=dvbs&freq=11720`).
    pub uri: String,
    /// Sequence number echoed in the response (RFC 2326 §12.17).
    pub cseq: u32,
    session: Option<String>,
    transport: Option<String>,
}

impl RtspRequest {
    /// Parse a request head. Fails on a malformed request line, a header
    /// without a colon, or a missing/unparsable `CSeq` — all of which the
    /// caller answers with 400.
    pub fn parse(raw: &str) -> Result<Self> {
        let mut lines = raw.lines().take_while(|line| !line.trim().is_empty());

        // "METHOD SP Request-URI SP RTSP/1.0"
        let request_line = lines.next().ok_or(malformed(ParseErrorKind::EmptyRequest))?;
        let (method_token, rest) = request_line
            .trim()
            .split_once(' ')
            .ok_or(malformed(ParseErrorKind::InvalidRequestLine))?;
        let (uri, version) = rest
            .trim()
            .rsplit_once(' ')
            .ok_or(malformed(ParseErrorKind::InvalidRequestLine))?;
        if !version.starts_with("RTSP/") {
            return Err(malformed(ParseErrorKind::InvalidRequestLine));
        }

        let mut cseq = None;
        let mut session = None;
        let mut transport = None;
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or(malformed(ParseErrorKind::InvalidHeader))?;
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("cseq") {
                cseq = value.parse::<u32>().ok();
            } else if name.eq_ignore_ascii_case("session") {
                // clients echo the ";timeout=" decoration back; strip it
                if let Some(id) = value.split(';').next() {
                    session = Some(id.trim().to_string());
                }
            } else if name.eq_ignore_ascii_case("transport") {
                transport = Some(value.to_string());
            }
        }

        Ok(RtspRequest {
            method: RtspMethod::from_token(method_token),
            uri: uri.trim().to_string(),
            cseq: cseq.ok_or(malformed(ParseErrorKind::MissingCSeq))?,
            session,
            transport,
        })
    }

    /// Bare session ID, timeout suffix already stripped.
    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    /// Raw `Transport:` header value (SETUP negotiation).
    pub fn transport(&self) -> Option<&str> {
        self.transport.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_options_request() {
        let raw = "OPTIONS rtsp://192.168.0.10:554/ RTSP/1.0\r\nCSeq: 1\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, RtspMethod::Options);
        assert_eq!(req.uri, "rtsp://192.168.0.10:554/");
        assert_eq!(req.cseq, 1);
        assert!(req.session_id().is_none());
    }

    #[test]
    fn parse_setup_with_satip_query() {
        let raw = "SETUP rtsp://10.0.0.1:554/?msys=dvbs&freq=11720&pol=v&sr=27500&fec=34&pids=0,17,100 RTSP/1.0\r\n\
                   CSeq: 3\r\n\
                   Transport: RTP/AVP;unicast;client_port=45678-45679\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, RtspMethod::Setup);
        assert_eq!(req.cseq, 3);
        assert!(req.uri.contains("msys=dvbs"));
        assert_eq!(
            req.transport(),
            Some("RTP/AVP;unicast;client_port=45678-45679")
        );
    }

    #[test]
    fn missing_cseq_is_rejected() {
        let raw = "OPTIONS rtsp://localhost/ RTSP/1.0\r\n\r\n";
        assert!(RtspRequest::parse(raw).is_err());
        let raw = "OPTIONS rtsp://localhost/ RTSP/1.0\r\nCSeq: elephant\r\n\r\n";
        assert!(RtspRequest::parse(raw).is_err());
    }

    #[test]
    fn unknown_method_still_carries_cseq() {
        let raw = "RECORD rtsp://localhost/ RTSP/1.0\r\nCSeq: 9\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.method, RtspMethod::Unknown("RECORD".to_string()));
        assert_eq!(req.method.name(), "RECORD");
        assert_eq!(req.cseq, 9);
    }

    #[test]
    fn malformed_requests_are_rejected() {
        assert!(RtspRequest::parse("").is_err());
        assert!(RtspRequest::parse("JUST_A_METHOD\r\n\r\n").is_err());
        assert!(RtspRequest::parse("GET / HTTP/1.1\r\nCSeq: 1\r\n\r\n").is_err());
        assert!(RtspRequest::parse("OPTIONS rtsp://h/ RTSP/1.0\r\nno-colon-here\r\n\r\n").is_err());
    }

    #[test]
    fn header_names_are_case_insensitive() {
        let raw = "PLAY rtsp://localhost/ RTSP/1.0\r\ncseq: 42\r\nSESSION: 012345678901\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.cseq, 42);
        assert_eq!(req.session_id(), Some("012345678901"));
    }

    #[test]
    fn session_id_strips_timeout() {
        let raw =
            "PLAY rtsp://localhost/ RTSP/1.0\r\nCSeq: 2\r\nSession: 012345678901;timeout=60\r\n\r\n";
        let req = RtspRequest::parse(raw).unwrap();
        assert_eq!(req.session_id(), Some("012345678901"));
    }
}
