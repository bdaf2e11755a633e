use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::error::CameraError;
use crate::media::Packetizer;
use crate::protocol::request::RtspRequest;
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::server::ServerConfig;
use crate::session::{MediaTransport, Session, SessionManager, TransportRequest};
use crate::stream::StreamRegistry;
use crate::transport::{InterleavedWriter, UdpPair};

/// Methods advertised in the OPTIONS `Public` header.
pub const PUBLIC_METHODS: &str =
    "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER, SET_PARAMETER";

/// Handles RTSP method requests for a single TCP connection.
///
/// Tracks which sessions were created on this connection so they
/// can be cleaned up when the connection drops.
pub struct MethodHandler {
    session_manager: SessionManager,
    streams: StreamRegistry,
    client_addr: SocketAddr,
    local_ip: IpAddr,
    writer: InterleavedWriter,
    config: Arc<ServerConfig>,
    /// Session IDs created during this connection, for cleanup on disconnect.
    session_ids: Vec<String>,
}

impl MethodHandler {
    pub fn new(
        session_manager: SessionManager,
        streams: StreamRegistry,
        client_addr: SocketAddr,
        local_ip: IpAddr,
        writer: InterleavedWriter,
        config: Arc<ServerConfig>,
    ) -> Self {
        MethodHandler {
            session_manager,
            streams,
            client_addr,
            local_ip,
            writer,
            config,
            session_ids: Vec::new(),
        }
    }

    /// Returns session IDs owned by this connection (for cleanup on disconnect).
    pub fn session_ids(&self) -> &[String] {
        &self.session_ids
    }

    /// Refresh every session owned by this connection.
    pub fn touch_sessions(&self) {
        for id in &self.session_ids {
            if let Some(session) = self.session_manager.get_session(id) {
                session.touch();
            }
        }
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0");

        match request.method.as_str() {
            "OPTIONS" => self.handle_options(cseq),
            "DESCRIBE" => self.handle_describe(cseq, &request.uri),
            "SETUP" => self.handle_setup(cseq, request),
            "PLAY" => self.handle_play(cseq, request),
            "PAUSE" => self.handle_pause(cseq, request),
            "TEARDOWN" => self.handle_teardown(cseq, request),
            "GET_PARAMETER" | "SET_PARAMETER" => self.handle_keepalive(cseq, request),
            _ => {
                tracing::warn!(method = %request.method, %cseq, "unsupported RTSP method");
                RtspResponse::not_implemented().add_header("CSeq", cseq)
            }
        }
    }

    fn handle_options(&self, cseq: &str) -> RtspResponse {
        tracing::debug!(%cseq, "OPTIONS");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS)
    }

    /// Host advertised in SDP: the configured public host, else the host
    /// the client dialled, else the local address of this connection.
    fn advertised_host(&self, uri: &str) -> String {
        if let Some(host) = &self.config.public_host {
            return host.clone();
        }

        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let authority = after_scheme.split('/').next().unwrap_or("");
            let host = match authority.strip_prefix('[') {
                Some(v6) => v6.split(']').next().unwrap_or(""),
                None => authority.split(':').next().unwrap_or(""),
            };
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.local_ip.to_string()
    }

    fn handle_describe(&self, cseq: &str, uri: &str) -> RtspResponse {
        tracing::debug!(%cseq, uri, "DESCRIBE");

        let Some(stream) = self.streams.resolve_from_uri(uri) else {
            tracing::warn!(uri, "DESCRIBE for unknown stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        let host = self.advertised_host(uri);
        let body = sdp::generate_sdp(
            stream.settings(),
            &stream.parameter_sets(),
            &host,
            &self.config,
        );

        let content_base = if uri.ends_with('/') {
            uri.to_string()
        } else {
            format!("{uri}/")
        };

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &content_base)
            .with_body(body)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(stream) = self.streams.resolve_from_uri(&request.uri) else {
            tracing::warn!(uri = %request.uri, "SETUP for unknown stream");
            return RtspResponse::not_found().add_header("CSeq", cseq);
        };

        // A Session header on SETUP re-negotiates an existing session.
        let existing = match request.session_id() {
            Some(id) => match self.session_manager.get_session(id) {
                Some(session) if session.is_playing() => {
                    tracing::warn!(session_id = id, "SETUP while playing");
                    return RtspResponse::method_not_valid().add_header("CSeq", cseq);
                }
                Some(session) => Some(session),
                None => {
                    tracing::warn!(session_id = id, "SETUP for unknown session");
                    return RtspResponse::session_not_found().add_header("CSeq", cseq);
                }
            },
            None => None,
        };

        // No Transport header, or no client ports: interleave on this connection.
        let requested = request
            .get_header("Transport")
            .map(TransportRequest::parse)
            .unwrap_or_default();

        let transport = if requested.wants_udp() {
            let Some((rtp_port, rtcp_port)) = requested.client_port else {
                return RtspResponse::bad_request().add_header("CSeq", cseq);
            };
            let sockets = match UdpPair::bind(self.local_ip) {
                Ok(sockets) => sockets,
                Err(e) => {
                    tracing::error!(error = %e, "failed to allocate server ports");
                    return RtspResponse::internal_error().add_header("CSeq", cseq);
                }
            };
            MediaTransport::Udp {
                client_rtp: SocketAddr::new(self.client_addr.ip(), rtp_port),
                client_rtcp: SocketAddr::new(self.client_addr.ip(), rtcp_port),
                sockets,
            }
        } else {
            let (rtp_channel, rtcp_channel) = requested.interleaved_channels();
            MediaTransport::Interleaved {
                rtp_channel,
                rtcp_channel,
                writer: self.writer.clone(),
            }
        };

        let session: Arc<Session> = match existing {
            Some(session) => session,
            None => {
                let session = self.session_manager.create_session(
                    stream.clone(),
                    &request.uri,
                    self.client_addr,
                    self.config.session_timeout,
                );
                self.session_ids.push(session.id.clone());
                session
            }
        };

        let transport_response = transport.response_header(session.ssrc());
        tracing::info!(
            session_id = %session.id,
            stream = %stream.name(),
            peer = %self.client_addr,
            transport = %transport_response,
            "session set up"
        );
        session.configure(transport);

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &session.session_header_value())
    }

    /// Look up the session named in the request's `Session` header.
    fn request_session(&self, method: &str, cseq: &str, request: &RtspRequest) -> Option<Arc<Session>> {
        let Some(id) = request.session_id() else {
            tracing::warn!(%cseq, method, "request missing Session header");
            return None;
        };
        let session = self.session_manager.get_session(id);
        if session.is_none() {
            tracing::warn!(session_id = id, method, "request for unknown session");
        }
        session
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.request_session("PLAY", cseq, request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        let seq = session.packetizer().lock().next_sequence();
        let rtptime = session.stream().next_pts();

        match session.play(self.config.parameter_set_interval) {
            Ok(()) => {}
            Err(CameraError::TransportNotConfigured(_)) => {
                return RtspResponse::method_not_valid().add_header("CSeq", cseq);
            }
            Err(e) => {
                tracing::error!(session_id = %session.id, error = %e, "failed to start delivery");
                return RtspResponse::internal_error().add_header("CSeq", cseq);
            }
        }

        tracing::info!(session_id = %session.id, stream = %session.stream_name(), "session started playing");

        let rtp_info = format!("url={};seq={};rtptime={}", session.uri, seq, rtptime);
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
            .add_header("Range", "npt=0.000-")
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.request_session("PAUSE", cseq, request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        session.pause();
        tracing::info!(session_id = %session.id, "session paused");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &session.session_header_value())
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session_id) = request.session_id() else {
            tracing::warn!(%cseq, "TEARDOWN missing Session header");
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        match self.session_manager.remove_session(session_id) {
            Some(_) => {
                self.session_ids.retain(|id| id != session_id);
                tracing::info!(session_id, "session terminated via TEARDOWN");
                RtspResponse::ok().add_header("CSeq", cseq)
            }
            None => {
                tracing::warn!(session_id, "TEARDOWN for unknown session");
                RtspResponse::session_not_found().add_header("CSeq", cseq)
            }
        }
    }

    /// GET_PARAMETER and SET_PARAMETER are used by clients (e.g. VLC) as
    /// keepalives (RFC 2326 §10.8, §10.9).
    fn handle_keepalive(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, method = %request.method, "keepalive");

        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);

        if let Some(id) = request.session_id()
            && let Some(session) = self.session_manager.get_session(id)
        {
            session.touch();
            resp = resp.add_header("Session", &session.session_header_value());
        }

        resp
    }
}
