//! RTSP `Transport:` header negotiation (RFC 2326 §12.39).
//!
//! SAT>IP accepts two transports:
//!
//! ```text
//! Transport: RTP/AVP;unicast;client_port=45678-45679
//! Transport: RTP/AVP/TCP;unicast;interleaved=0-1
//! ```
//!
//! The first carries RTP/RTCP over UDP to the named client ports; the
//! second tunnels both inside the RTSP TCP connection on the named
//! channel bytes (RFC 2326 §10.12).

/// Parsed client-side transport request from a SETUP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportRequest {
    /// RTP and RTCP over UDP to the client's port pair.
    Unicast {
        client_rtp_port: u16,
        client_rtcp_port: u16,
    },
    /// RTP and RTCP interleaved on the RTSP TCP connection.
    Interleaved {
        rtp_channel: u8,
        rtcp_channel: u8,
    },
}

impl TransportRequest {
    /// Parse the `Transport` header value.
    ///
    /// Looks for `interleaved=c-d` when the profile is `RTP/AVP/TCP`,
    /// otherwise for `client_port=a-b`.
    ///
    /// ## Examples
    ///
    /// ```
    /// use satip::protocol::TransportRequest;
    ///
    /// let th = TransportRequest::parse("RTP/AVP;unicast;client_port=45678-45679").unwrap();
    /// assert_eq!(
    ///     th,
    ///     TransportRequest::Unicast { client_rtp_port: 45678, client_rtcp_port: 45679 }
    /// );
    ///
    /// let th = TransportRequest::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
    /// assert_eq!(th, TransportRequest::Interleaved { rtp_channel: 0, rtcp_channel: 1 });
    ///
    /// assert!(TransportRequest::parse("RTP/AVP;unicast").is_none());
    /// ```
    pub fn parse(header: &str) -> Option<Self> {
        let tcp = header
            .split(';')
            .next()
            .is_some_and(|profile| profile.trim().eq_ignore_ascii_case("RTP/AVP/TCP"));

        for part in header.split(';') {
            let part = part.trim();
            if tcp {
                if let Some(channels) = part.strip_prefix("interleaved=") {
                    let (rtp, rtcp) = parse_pair(channels)?;
                    return Some(TransportRequest::Interleaved {
                        rtp_channel: u8::try_from(rtp).ok()?,
                        rtcp_channel: u8::try_from(rtcp).ok()?,
                    });
                }
            } else if let Some(ports) = part.strip_prefix("client_port=") {
                let (rtp, rtcp) = parse_pair(ports)?;
                return Some(TransportRequest::Unicast {
                    client_rtp_port: rtp,
                    client_rtcp_port: rtcp,
                });
            }
        }
        None
    }
}

/// Parse `a-b` into two integers; a lone `a` becomes `(a, a + 1)`.
fn parse_pair(value: &str) -> Option<(u16, u16)> {
    match value.split_once('-') {
        Some((first, second)) => Some((first.parse().ok()?, second.parse().ok()?)),
        None => {
            let first: u16 = value.parse().ok()?;
            Some((first, first.checked_add(1)?))
        }
    }
}
