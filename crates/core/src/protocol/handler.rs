//! RTSP method routing.
//!
//! Each handler follows the same contract: resolve the unit's session,
//! check the FSM allows the method from the current state, perform the
//! protocol action, and fire the corresponding event. A method that
//! arrives in a disallowed state is answered with a failure status and
//! the relevant `*_FAIL` event (itself a no-op when the FSM disallows
//! it too). Side effects here are synchronous and non-blocking — the
//! pacing engine is the only heavy work and always runs on its own
//! thread.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::congestion::{FrameScaler, RtcpMonitor};
use crate::engine::PacingEngine;
use crate::fsm::SessionEvent;
use crate::media::MediaSource;
use crate::protocol::range::NptRange;
use crate::protocol::request::{Method, RtspRequest};
use crate::protocol::response::RtspResponse;
use crate::protocol::sdp;
use crate::session::{Session, SessionRegistry, Streamer};
use crate::transport::UdpTransport;

/// Methods advertised in the OPTIONS response.
const PUBLIC_METHODS: &str = "OPTIONS, DESCRIBE, SETUP, PLAY, PAUSE, TEARDOWN, GET_PARAMETER";

/// Client transport parameters from the RTSP `Transport` header.
///
/// Only `RTP/AVP;unicast` with `client_port=<rtp>[-<rtcp>]` is
/// supported; the RTCP port is optional.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSpec {
    pub client_rtp_port: u16,
    pub client_rtcp_port: Option<u16>,
}

impl TransportSpec {
    /// Parse the `Transport` header value (RFC 2326 §12.39).
    pub fn parse(header: &str) -> Option<Self> {
        for part in header.split(';') {
            if let Some(ports) = part.trim().strip_prefix("client_port=") {
                let (rtp, rtcp) = match ports.split_once('-') {
                    Some((rtp, rtcp)) => (rtp, Some(rtcp)),
                    None => (ports, None),
                };
                let client_rtp_port = rtp.trim().parse().ok()?;
                let client_rtcp_port = match rtcp {
                    Some(text) if !text.trim().is_empty() => Some(text.trim().parse().ok()?),
                    _ => None,
                };
                return Some(TransportSpec {
                    client_rtp_port,
                    client_rtcp_port,
                });
            }
        }
        None
    }
}

/// Extract the unit id from an RTSP request URI.
///
/// `rtsp://host:8554/unit-42`        → `unit-42`
/// `rtsp://host:8554/unit-42/extra`  → `unit-42`
/// `/unit-42`                        → `unit-42`
pub fn unit_from_uri(uri: &str) -> Option<&str> {
    let path = if let Some(after) = uri
        .strip_prefix("rtsp://")
        .or_else(|| uri.strip_prefix("rtsps://"))
    {
        match after.find('/') {
            Some(slash) => &after[slash + 1..],
            None => return None,
        }
    } else if let Some(stripped) = uri.strip_prefix('/') {
        stripped
    } else {
        return None;
    };
    let unit = path.split('/').next().unwrap_or("").trim();
    (!unit.is_empty()).then_some(unit)
}

/// Handles RTSP method requests for a single TCP connection.
pub struct MethodHandler {
    registry: SessionRegistry,
    config: Arc<ServerConfig>,
    udp: Arc<UdpTransport>,
    scaler: Arc<dyn FrameScaler>,
    client_addr: SocketAddr,
}

impl MethodHandler {
    pub fn new(
        registry: SessionRegistry,
        config: Arc<ServerConfig>,
        udp: Arc<UdpTransport>,
        scaler: Arc<dyn FrameScaler>,
        client_addr: SocketAddr,
    ) -> Self {
        MethodHandler {
            registry,
            config,
            udp,
            scaler,
            client_addr,
        }
    }

    pub fn handle(&mut self, request: &RtspRequest) -> RtspResponse {
        let cseq = request.cseq().unwrap_or("0").to_string();

        match request.method {
            Method::Options => self.handle_options(&cseq, request),
            Method::Describe => self.handle_describe(&cseq, request),
            Method::Setup => self.handle_setup(&cseq, request),
            Method::Play => self.handle_play(&cseq, request),
            Method::Pause => self.handle_pause(&cseq, request),
            Method::Teardown => self.handle_teardown(&cseq, request),
            Method::GetParameter => self.handle_get_parameter(&cseq, request),
            Method::Other(ref name) => {
                tracing::warn!(method = %name, cseq = %cseq, "unsupported RTSP method");
                RtspResponse::new(501, "Not Implemented").add_header("CSeq", &cseq)
            }
        }
    }

    /// Resolve the session for a request by the unit id in the URI,
    /// cross-checking the `Session` header against the streamer id
    /// once one is assigned.
    fn resolve_session(&self, request: &RtspRequest) -> Option<Arc<Session>> {
        let unit = unit_from_uri(&request.uri)?;
        let session = self.registry.get(unit)?;
        if let (Some(header_id), Some(streamer)) = (request.session_id(), session.streamer()) {
            if header_id != streamer.id {
                tracing::warn!(unit, header_id, streamer_id = %streamer.id, "stale session id");
                return None;
            }
        }
        Some(session)
    }

    /// Parses host from an RTSP URI (e.g. `rtsp://host:8554/x` → host).
    /// Falls back to the client's peer IP if the URI is unusable.
    fn host_from_uri_or_client(&self, uri: &str) -> String {
        if let Some(after_scheme) = uri
            .strip_prefix("rtsp://")
            .or_else(|| uri.strip_prefix("rtsps://"))
        {
            let host = after_scheme
                .split('/')
                .next()
                .and_then(|host_port| host_port.split(':').next())
                .unwrap_or("")
                .trim();
            if !host.is_empty() {
                return host.to_string();
            }
        }
        self.client_addr.ip().to_string()
    }

    fn handle_options(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if session.fire(SessionEvent::Options).is_err() {
            tracing::warn!(unit = %session.unit_id, state = ?session.state(), "OPTIONS out of state");
            session.try_fire(SessionEvent::OptionsFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        tracing::debug!(unit = %session.unit_id, %cseq, "OPTIONS");
        let mut resp = RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Public", PUBLIC_METHODS);
        // Reuse the session token of an existing delivery.
        if let Some(streamer) = session.streamer() {
            resp = resp.add_header("Session", &streamer.id);
        }
        resp
    }

    fn handle_describe(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if !session.permits(SessionEvent::Describe) {
            tracing::warn!(unit = %session.unit_id, state = ?session.state(), "DESCRIBE out of state");
            session.try_fire(SessionEvent::DescribeFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        // Port allocation happens before the DESCRIBE event so that
        // pool exhaustion leaves the session in its prior state.
        if session.rtp_port() == 0 {
            match self.registry.ports().allocate() {
                Ok(port) => {
                    if !session.assign_rtp_port(port) {
                        // Lost a race against a concurrent DESCRIBE.
                        self.registry.ports().release(port);
                    }
                }
                Err(e) => {
                    tracing::error!(unit = %session.unit_id, error = %e, "no listen port for DESCRIBE");
                    return RtspResponse::service_unavailable().add_header("CSeq", cseq);
                }
            }
        }

        if session.fire(SessionEvent::Describe).is_err() {
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let media_dir = self.config.media_root.join(&session.unit_id);
        let media = match MediaSource::open(
            &media_dir,
            &self.config.playlist,
            self.config.fps,
            self.config.gop,
        ) {
            Ok(media) => media,
            Err(e) => {
                tracing::warn!(unit = %session.unit_id, error = %e, "DESCRIBE media unavailable");
                session.try_fire(SessionEvent::DescribeFail);
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let host = self.host_from_uri_or_client(&request.uri);
        let sdp = sdp::generate_sdp(
            &self.config,
            &host,
            &session.unit_id,
            session.rtp_port(),
            media.duration_secs(),
        );
        session.set_sdp(sdp.clone());
        session.try_fire(SessionEvent::DescribeOk);

        tracing::info!(
            unit = %session.unit_id,
            rtp_port = session.rtp_port(),
            duration_secs = media.duration_secs(),
            "DESCRIBE"
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Content-Type", "application/sdp")
            .add_header("Content-Base", &request.uri)
            .with_body(sdp)
    }

    fn handle_setup(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if session.fire(SessionEvent::Setup).is_err() {
            tracing::warn!(unit = %session.unit_id, state = ?session.state(), "SETUP out of state");
            session.try_fire(SessionEvent::SetupFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let Some(transport_header) = request.get_header("Transport") else {
            tracing::warn!(unit = %session.unit_id, %cseq, "SETUP missing Transport header");
            session.try_fire(SessionEvent::SetupFail);
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        // Interleaved TCP (RTP/AVP/TCP;interleaved=0-1) is out of scope.
        if transport_header.contains("RTP/AVP/TCP") || transport_header.contains("interleaved=") {
            tracing::warn!(unit = %session.unit_id, transport = %transport_header, "interleaved transport requested");
            session.try_fire(SessionEvent::SetupFail);
            return RtspResponse::unsupported_transport()
                .add_header("CSeq", cseq)
                .add_header("Unsupported", "RTP/AVP/TCP (interleaved); use RTP/AVP (UDP)");
        }

        let Some(spec) = TransportSpec::parse(transport_header) else {
            tracing::warn!(unit = %session.unit_id, transport = %transport_header, "SETUP invalid Transport header");
            session.try_fire(SessionEvent::SetupFail);
            return RtspResponse::bad_request().add_header("CSeq", cseq);
        };

        // DESCRIBE normally allocated the listen port already; the
        // OPTIONS→SETUP shortcut lands here without one.
        if session.rtp_port() == 0 {
            match self.registry.ports().allocate() {
                Ok(port) => {
                    if !session.assign_rtp_port(port) {
                        self.registry.ports().release(port);
                    }
                }
                Err(e) => {
                    tracing::error!(unit = %session.unit_id, error = %e, "no listen port for SETUP");
                    session.try_fire(SessionEvent::SetupFail);
                    return RtspResponse::service_unavailable().add_header("CSeq", cseq);
                }
            }
        }

        let streamer = match session.streamer() {
            Some(existing) => existing,
            None => {
                let streamer = Arc::new(Streamer::new());
                // RTCP feedback arrives on listen port + 1.
                let rtcp_port = session.rtp_port() + 1;
                match UdpSocket::bind(("0.0.0.0", rtcp_port)) {
                    Ok(socket) => match RtcpMonitor::spawn(socket, session.clone()) {
                        Ok(monitor) => streamer.attach_monitor(monitor),
                        Err(e) => {
                            tracing::warn!(unit = %session.unit_id, error = %e, "RTCP monitor not started")
                        }
                    },
                    Err(e) => {
                        tracing::warn!(unit = %session.unit_id, rtcp_port, error = %e, "RTCP bind failed")
                    }
                }
                session.set_streamer(streamer.clone());
                streamer
            }
        };

        let dest = SocketAddr::new(self.client_addr.ip(), spec.client_rtp_port);
        streamer.set_destination(dest);
        streamer.set_rtcp_dest_port(spec.client_rtcp_port);
        streamer.set_user_agent(request.user_agent().map(str::to_string));

        tracing::info!(
            unit = %session.unit_id,
            streamer_id = %streamer.id,
            client_rtp = %dest,
            server_rtp = session.rtp_port(),
            "SETUP"
        );

        let client_ports = match spec.client_rtcp_port {
            Some(rtcp) => format!("{}-{}", spec.client_rtp_port, rtcp),
            None => format!("{}", spec.client_rtp_port),
        };
        let transport_response = format!(
            "RTP/AVP;unicast;client_port={};server_port={}-{};ssrc={:08X}",
            client_ports,
            session.rtp_port(),
            session.rtp_port() + 1,
            streamer.ssrc
        );

        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Transport", &transport_response)
            .add_header("Session", &streamer.id)
    }

    fn handle_play(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if session.fire(SessionEvent::Play).is_err() {
            tracing::warn!(unit = %session.unit_id, state = ?session.state(), "PLAY out of state");
            session.try_fire(SessionEvent::PlayFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let Some(streamer) = session.streamer() else {
            session.try_fire(SessionEvent::PlayFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        };
        let Some(dest) = streamer.destination() else {
            tracing::warn!(unit = %session.unit_id, "PLAY before destination negotiated");
            session.try_fire(SessionEvent::PlayFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        };

        let range = match request.get_header("Range") {
            Some(value) => match NptRange::parse(value) {
                Some(range) => range,
                None => {
                    tracing::warn!(unit = %session.unit_id, range = %value, "unparseable Range header");
                    session.try_fire(SessionEvent::PlayFail);
                    return RtspResponse::invalid_range().add_header("CSeq", cseq);
                }
            },
            None => NptRange::full(),
        };

        let media_dir = self.config.media_root.join(&session.unit_id);
        let media = match MediaSource::open(
            &media_dir,
            &self.config.playlist,
            self.config.fps,
            self.config.gop,
        ) {
            Ok(media) => Arc::new(media),
            Err(e) => {
                tracing::warn!(unit = %session.unit_id, error = %e, "PLAY media unavailable");
                session.try_fire(SessionEvent::PlayFail);
                return RtspResponse::not_found().add_header("CSeq", cseq);
            }
        };

        let duration = media.duration_secs();
        if range.exceeds(duration) {
            tracing::warn!(
                unit = %session.unit_id,
                start = range.start,
                end = ?range.end,
                duration,
                "Range exceeds media duration"
            );
            session.try_fire(SessionEvent::PlayFail);
            return RtspResponse::invalid_range().add_header("CSeq", cseq);
        }

        streamer.set_media(media.clone());
        streamer.set_paused(false);

        // Starting values for RTP-Info, read before the engine begins
        // advancing the clock.
        let clock = streamer.clock();

        let engine = PacingEngine::new(
            session.clone(),
            streamer.clone(),
            media,
            self.udp.socket(),
            dest,
            self.config.payload_type,
            self.scaler.clone(),
            self.config.source_gap_27mhz,
        );
        streamer.attach_engine(engine.start());

        tracing::info!(
            unit = %session.unit_id,
            streamer_id = %streamer.id,
            %dest,
            sequence = clock.sequence,
            rtptime = clock.timestamp,
            "PLAY"
        );

        let rtp_info = format!(
            "url={};seq={};rtptime={}",
            request.uri, clock.sequence, clock.timestamp
        );
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &streamer.id)
            .add_header("Range", &range.format_effective(duration))
            .add_header("RTP-Info", &rtp_info)
    }

    fn handle_pause(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if session.fire(SessionEvent::Pause).is_err() {
            tracing::warn!(unit = %session.unit_id, state = ?session.state(), "PAUSE out of state");
            session.try_fire(SessionEvent::PauseFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        let Some(streamer) = session.streamer() else {
            session.try_fire(SessionEvent::PauseFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        };

        // Synchronous: no packet leaves after stop_streaming returns.
        streamer.stop_streaming();
        streamer.set_paused(true);
        streamer.reset_clock();

        tracing::info!(unit = %session.unit_id, streamer_id = %streamer.id, "PAUSE");
        RtspResponse::ok()
            .add_header("CSeq", cseq)
            .add_header("Session", &streamer.id)
    }

    fn handle_teardown(&mut self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        let Some(session) = self.resolve_session(request) else {
            return RtspResponse::session_not_found().add_header("CSeq", cseq);
        };

        if session.fire(SessionEvent::Teardown).is_err() {
            tracing::warn!(unit = %session.unit_id, state = ?session.state(), "TEARDOWN out of state");
            session.try_fire(SessionEvent::TeardownFail);
            return RtspResponse::method_not_valid().add_header("CSeq", cseq);
        }

        // The listen port stays with the session until it closes; only
        // the streamer and its threads go away here.
        if let Some(streamer) = session.take_streamer() {
            streamer.shutdown();
            tracing::info!(unit = %session.unit_id, streamer_id = %streamer.id, "TEARDOWN");
        }
        session.try_fire(SessionEvent::TeardownOk);

        RtspResponse::ok().add_header("CSeq", cseq)
    }

    /// GET_PARAMETER is used by clients as a keepalive (RFC 2326 §10.8).
    fn handle_get_parameter(&self, cseq: &str, request: &RtspRequest) -> RtspResponse {
        tracing::trace!(%cseq, "GET_PARAMETER keepalive");
        let mut resp = RtspResponse::ok().add_header("CSeq", cseq);
        if let Some(streamer) = self.resolve_session(request).and_then(|s| s.streamer()) {
            resp = resp.add_header("Session", &streamer.id);
        }
        resp
    }
}
