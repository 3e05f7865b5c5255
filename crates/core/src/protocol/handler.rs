//! RTSP method dispatch for one connection.
//!
//! Routes each parsed request to the stream manager and shapes the
//! response. Protocol violations map to 400, unknown sessions to 454,
//! exhausted or incapable tuners to 503; none of those mutate stream
//! state.

use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::error::SatipError;
use crate::protocol::query::SatipQuery;
use crate::protocol::request::{RtspMethod, RtspRequest};
use crate::protocol::response::{RtspResponse, StatusCode};
use crate::protocol::sdp;
use crate::protocol::transport::TransportRequest;
use crate::stream::client::{StreamClient, allocate_udp_pair};
use crate::stream::{ClientTransport, Stream, StreamManager};

const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, TEARDOWN, GET_PARAMETER";

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which interleaved sessions ride on this connection so they can
/// be flagged for destruction when it drops.
pub struct MethodHandler {
    manager: Arc<StreamManager>,
    config: Arc<ServerConfig>,
    client_addr: SocketAddr,
    /// Sessions whose transport is this TCP connection.
    interleaved_sessions: Vec<String>,
    /// Interleaved stream whose pumps start only after the PLAY response
    /// is on the wire (frames must not precede it).
    deferred_start: Option<Arc<Stream>>,
}

impl MethodHandler {
    pub fn new(
        manager: Arc<StreamManager>,
        config: Arc<ServerConfig>,
        client_addr: SocketAddr,
    ) -> Self {
        MethodHandler {
            manager,
            config,
            client_addr,
            interleaved_sessions: Vec::new(),
            deferred_start: None,
        }
    }

    /// Interleaved sessions bound to this connection (cleanup on drop).
    pub fn interleaved_sessions(&self) -> &[String] {
        &self.interleaved_sessions
    }

    /// Stream whose pumps the connection starts after writing the
    /// response.
    pub fn take_deferred_start(&mut self) -> Option<Arc<Stream>> {
        self.deferred_start.take()
    }

    pub fn handle(&mut self, request: &RtspRequest, connection: &TcpStream) -> RtspResponse {
        let cseq = request.cseq;

        // any request on a live session counts as keep-alive
        if let Some(session_id) = request.session_id()
            && let Ok((stream, _)) =
                self.manager
                    .find_stream_for(self.client_addr.ip(), Some(session_id), &SatipQuery::default())
        {
            stream.touch_client();
        }

        match &request.method {
            RtspMethod::Options => self.handle_options(cseq),
            RtspMethod::Describe => self.handle_describe(cseq),
            RtspMethod::Setup => self.handle_setup(cseq, request, connection),
            RtspMethod::Play => self.handle_play(cseq, request),
            RtspMethod::Teardown => self.handle_teardown(cseq, request),
            RtspMethod::GetParameter => self.handle_get_parameter(cseq, request),
            RtspMethod::Unknown(name) => {
                tracing::warn!(method = %name, cseq, "unsupported RTSP method");
                RtspResponse::new(StatusCode::NotImplemented, cseq)
            }
        }
    }

    fn handle_options(&self, cseq: u32) -> RtspResponse {
        tracing::debug!(cseq, "OPTIONS");
        RtspResponse::ok(cseq).header("Public", PUBLIC_METHODS)
    }

    fn handle_describe(&self, cseq: u32) -> RtspResponse {
        tracing::debug!(cseq, "DESCRIBE");
        let body = sdp::generate_describe(
            &self.config.bind_ip.to_string(),
            self.manager.delivery_counts(),
            &self.manager.describe_strings(),
        );
        RtspResponse::ok(cseq)
            .header("Content-Type", "application/sdp")
            .with_body(body)
    }

    fn handle_setup(
        &mut self,
        cseq: u32,
        request: &RtspRequest,
        connection: &TcpStream,
    ) -> RtspResponse {
        let query = SatipQuery::from_uri(&request.uri);

        let Some(transport_header) = request.transport() else {
            tracing::warn!(cseq, "SETUP missing Transport header");
            return RtspResponse::new(StatusCode::BadRequest, cseq);
        };
        let Some(transport) = TransportRequest::parse(transport_header) else {
            tracing::warn!(cseq, transport_header, "SETUP invalid Transport header");
            return RtspResponse::new(StatusCode::BadRequest, cseq);
        };

        let (stream, is_new) = match self.manager.find_stream_for(
            self.client_addr.ip(),
            request.session_id(),
            &query,
        ) {
            Ok(found) => found,
            Err(e) => return self.error_response(cseq, &e),
        };

        if let Err(e) = stream.apply_query(&query) {
            tracing::warn!(stream = stream.id(), error = %e, "SETUP with unusable parameters");
            return self.error_response(cseq, &e);
        }

        // keep the session ID across a re-SETUP of the same stream
        let existing_session = stream.session_id();

        let (client_transport, transport_response) = match transport {
            TransportRequest::Unicast {
                client_rtp_port,
                client_rtcp_port,
            } => {
                let (rtp_socket, rtcp_socket) = match allocate_udp_pair(self.config.bind_ip) {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::error!(error = %e, "server port allocation failed");
                        return RtspResponse::new(StatusCode::ServiceUnavailable, cseq);
                    }
                };
                let server_rtp = rtp_socket.local_addr().map(|a| a.port()).unwrap_or(0);
                let server_rtcp = server_rtp + 1;
                let response = format!(
                    "RTP/AVP;unicast;client_port={client_rtp_port}-{client_rtcp_port};server_port={server_rtp}-{server_rtcp}"
                );
                (
                    ClientTransport::Udp {
                        rtp_dest: SocketAddr::new(self.client_addr.ip(), client_rtp_port),
                        rtcp_dest: SocketAddr::new(self.client_addr.ip(), client_rtcp_port),
                        rtp_socket,
                        rtcp_socket,
                    },
                    response,
                )
            }
            TransportRequest::Interleaved {
                rtp_channel,
                rtcp_channel,
            } => {
                let socket = match connection.try_clone() {
                    Ok(socket) => socket,
                    Err(e) => {
                        tracing::error!(error = %e, "connection clone failed");
                        return RtspResponse::new(StatusCode::ServiceUnavailable, cseq);
                    }
                };
                let response =
                    format!("RTP/AVP/TCP;unicast;interleaved={rtp_channel}-{rtcp_channel}");
                (
                    ClientTransport::Tcp {
                        socket,
                        rtp_channel,
                        rtcp_channel,
                    },
                    response,
                )
            }
        };

        let interleaved = matches!(client_transport, ClientTransport::Tcp { .. });
        let mut client = StreamClient::new(self.client_addr.ip(), client_transport);
        if let Some(session_id) = existing_session {
            client.session_id = session_id;
        }
        let session_header = client.session_header_value();
        if interleaved {
            self.interleaved_sessions.push(client.session_id.clone());
        }

        tracing::info!(
            stream = stream.id(),
            session = %client.session_id,
            cseq,
            is_new,
            transport = %transport_response,
            "SETUP"
        );
        stream.set_client(client);

        RtspResponse::ok(cseq)
            .header("Transport", transport_response)
            .header("Session", session_header)
    }

    fn handle_play(&mut self, cseq: u32, request: &RtspRequest) -> RtspResponse {
        let stream = match self.session_stream(cseq, request) {
            Ok(stream) => stream,
            Err(response) => return response,
        };

        let query = SatipQuery::from_uri(&request.uri);
        if !query.is_empty()
            && let Err(e) = stream.apply_query(&query)
        {
            tracing::warn!(stream = stream.id(), error = %e, "PLAY with unusable parameters");
            return self.error_response(cseq, &e);
        }

        if let Err(e) = stream.update_tuner() {
            tracing::error!(stream = stream.id(), error = %e, "PLAY failed");
            return self.error_response(cseq, &e);
        }

        let interleaved = stream
            .with_client(|c| matches!(c.transport, ClientTransport::Tcp { .. }))
            .unwrap_or(false);
        if interleaved {
            // frames ride the RTSP connection: hold them until the
            // response has been written
            self.deferred_start = Some(stream.clone());
        } else if let Err(e) = stream.start_pumps() {
            tracing::error!(stream = stream.id(), error = %e, "PLAY failed");
            return self.error_response(cseq, &e);
        }

        tracing::info!(stream = stream.id(), cseq, "PLAY");
        let session = stream.session_header_value().unwrap_or_default();
        RtspResponse::ok(cseq)
            .header("Session", session)
            .header("Range", "npt=0.000-")
    }

    fn handle_teardown(&mut self, cseq: u32, request: &RtspRequest) -> RtspResponse {
        let stream = match self.session_stream(cseq, request) {
            Ok(stream) => stream,
            Err(response) => return response,
        };

        if let Some(session_id) = request.session_id() {
            self.interleaved_sessions.retain(|s| s != session_id);
        }
        tracing::info!(stream = stream.id(), cseq, "TEARDOWN");
        if let Err(e) = stream.teardown() {
            tracing::error!(stream = stream.id(), error = %e, "teardown failed");
        }
        RtspResponse::ok(cseq)
    }

    fn handle_get_parameter(&self, cseq: u32, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(cseq, "GET_PARAMETER keepalive");
        let mut response = RtspResponse::ok(cseq);
        if let Ok(stream) = self.session_stream_quiet(request)
            && let Some(session) = stream.session_header_value()
        {
            response = response.header("Session", session);
        }
        response
    }

    /// Resolve the stream a session-scoped request refers to, or the
    /// ready-made error response.
    fn session_stream(
        &self,
        cseq: u32,
        request: &RtspRequest,
    ) -> std::result::Result<Arc<Stream>, RtspResponse> {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(cseq, method = %request.method, "missing Session header");
            return Err(RtspResponse::new(StatusCode::SessionNotFound, cseq));
        };
        self.manager
            .find_stream_for(self.client_addr.ip(), Some(session_id), &SatipQuery::default())
            .map(|(stream, _)| stream)
            .map_err(|_| {
                tracing::warn!(session_id, "unknown session");
                RtspResponse::new(StatusCode::SessionNotFound, cseq)
            })
    }

    fn session_stream_quiet(&self, request: &RtspRequest) -> Result<Arc<Stream>, ()> {
        let session_id = request.session_id().ok_or(())?;
        self.manager
            .find_stream_for(self.client_addr.ip(), Some(session_id), &SatipQuery::default())
            .map(|(stream, _)| stream)
            .map_err(|_| ())
    }

    /// Map a gateway error to its RTSP status per the error policy.
    fn error_response(&self, cseq: u32, error: &SatipError) -> RtspResponse {
        let status = match error {
            SatipError::Parse { .. } => StatusCode::BadRequest,
            SatipError::SessionNotFound(_) => StatusCode::SessionNotFound,
            SatipError::NoFreeStream | SatipError::Tuner(_) => StatusCode::ServiceUnavailable,
            _ => StatusCode::InternalServerError,
        };
        RtspResponse::new(status, cseq)
    }
}
