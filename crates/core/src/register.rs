//! URTSP registration handshake.
//!
//! Units authenticate on an out-of-band UDP control channel before any
//! RTSP method is honored. The handshake is a two-round nonce
//! challenge: a bare REGISTER never succeeds for a never-before-seen
//! unit — the server answers NOT_AUTHORIZED with its realm, and the
//! retry must carry the expected nonce.
//!
//! The expected nonce is `md5_hex(md5_hex(realm || secret))`. The
//! double digest is deliberate: deployed units compute it this way, so
//! it is reproduced bit for bit rather than simplified.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::fsm::{SessionEvent, SessionState};
use crate::session::SessionRegistry;
use crate::wire::urtsp::{MessageKind, RegisterRequest, RegisterResponse, Status};

/// Poll interval for the control socket's read timeout.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Lowercase hex MD5 digest of a string.
pub fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Registration decision logic, independent of the socket.
pub struct Registrar {
    registry: SessionRegistry,
    realm: String,
    expected_nonce: String,
}

impl Registrar {
    pub fn new(registry: SessionRegistry, realm: &str, secret: &str) -> Self {
        let expected_nonce = md5_hex(&md5_hex(&format!("{}{}", realm, secret)));
        Self {
            registry,
            realm: realm.to_string(),
            expected_nonce,
        }
    }

    /// The nonce a unit must present: `md5_hex(md5_hex(realm || secret))`.
    pub fn expected_nonce(&self) -> &str {
        &self.expected_nonce
    }

    /// Evaluate one control-channel request and build the reply.
    pub fn handle(&self, request: &RegisterRequest) -> RegisterResponse {
        match request.kind {
            MessageKind::Register => self.handle_register(request),
            MessageKind::Unregister => self.handle_unregister(request),
        }
    }

    fn handle_register(&self, request: &RegisterRequest) -> RegisterResponse {
        let unit = request.unit_id.as_str();

        let session = match self.registry.get(unit) {
            Some(session) => session,
            None => {
                // First contact: open an unregistered IDLE session and
                // challenge. The nonce on this request, if any, is not
                // even inspected.
                self.registry.open(unit);
                tracing::info!(unit, "unknown unit, challenging");
                return self.respond(request, Status::NotAuthorized, Some("nonce required"));
            }
        };

        if session.is_registered() {
            // Keep-alive. Only honored while the control plane is
            // otherwise quiet.
            return if session.state() == SessionState::Idle {
                session.try_fire(SessionEvent::Register);
                tracing::debug!(unit, "keep-alive accepted");
                self.respond(request, Status::Success, None)
            } else {
                tracing::warn!(unit, state = ?session.state(), "keep-alive in active state");
                self.respond(request, Status::StateError, Some("session active"))
            };
        }

        let Some(nonce) = request.nonce.as_deref() else {
            tracing::debug!(unit, "challenge retry without nonce");
            return self.respond(request, Status::NotAuthorized, Some("nonce required"));
        };

        if nonce == self.expected_nonce {
            session.set_registered();
            session.try_fire(SessionEvent::Register);
            tracing::info!(unit, expires = request.expires, "unit registered");
            self.respond(request, Status::Success, None)
        } else {
            tracing::warn!(unit, "nonce mismatch");
            self.respond(request, Status::NotAuthorized, Some("bad nonce"))
        }
    }

    fn handle_unregister(&self, request: &RegisterRequest) -> RegisterResponse {
        let unit = request.unit_id.as_str();

        let Some(session) = self.registry.get(unit) else {
            tracing::warn!(unit, "UNREGISTER for unknown unit");
            return self.respond(request, Status::NotAccepted, Some("unknown unit"));
        };

        if session.state() != SessionState::Register {
            tracing::warn!(unit, state = ?session.state(), "UNREGISTER in active state");
            return self.respond(request, Status::StateError, Some("session active"));
        }

        session.try_fire(SessionEvent::Idle);
        self.registry.close(unit);
        tracing::info!(unit, "unit unregistered");
        self.respond(request, Status::Success, None)
    }

    /// Build a response mirroring the request's header fields.
    fn respond(
        &self,
        request: &RegisterRequest,
        status: Status,
        reason: Option<&str>,
    ) -> RegisterResponse {
        RegisterResponse {
            kind: request.kind,
            sequence: request.sequence,
            timestamp: request.timestamp,
            status,
            realm: self.realm.clone(),
            reason: reason.map(str::to_string),
        }
    }
}

/// Control-channel receive loop. Runs on its own thread; never blocks
/// the RTSP side. Malformed datagrams are logged and dropped.
pub fn control_loop(socket: UdpSocket, registrar: Arc<Registrar>, running: Arc<AtomicBool>) {
    if let Err(e) = socket.set_read_timeout(Some(POLL_INTERVAL)) {
        tracing::error!(error = %e, "control socket read timeout");
        return;
    }

    let mut buf = [0u8; 2048];
    while running.load(Ordering::SeqCst) {
        let (len, peer) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "control channel receive error");
                }
                continue;
            }
        };

        let request = match RegisterRequest::decode(&buf[..len]) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "malformed control datagram");
                continue;
            }
        };

        tracing::debug!(
            %peer,
            unit = %request.unit_id,
            kind = ?request.kind,
            sequence = request.sequence,
            "control request"
        );

        let response = registrar.handle(&request);
        if let Err(e) = socket.send_to(&response.encode(), peer) {
            tracing::warn!(%peer, error = %e, "control response send failed");
        }
    }
    tracing::debug!("control loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsm::Fsm;
    use crate::session::PortPool;

    fn registrar() -> Registrar {
        let registry =
            SessionRegistry::new(Arc::new(Fsm::new()), Arc::new(PortPool::new(5000, 4)));
        Registrar::new(registry.clone(), "tscast", "s3cret")
    }

    fn register_request(unit: &str, nonce: Option<&str>) -> RegisterRequest {
        RegisterRequest {
            kind: MessageKind::Register,
            sequence: 1,
            timestamp: 1234,
            unit_id: unit.to_string(),
            expires: 3600,
            nonce: nonce.map(str::to_string),
        }
    }

    fn unregister_request(unit: &str) -> RegisterRequest {
        RegisterRequest {
            kind: MessageKind::Unregister,
            sequence: 2,
            timestamp: 1235,
            unit_id: unit.to_string(),
            expires: 0,
            nonce: None,
        }
    }

    #[test]
    fn md5_hex_known_vectors() {
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex("abc"), "900150983cd24fb0d6963f7d28e17f72");
    }

    #[test]
    fn expected_nonce_is_double_digest() {
        let registrar = registrar();
        assert_eq!(
            registrar.expected_nonce(),
            md5_hex(&md5_hex("tscasts3cret"))
        );
    }

    /// A never-before-seen unit is challenged; the retry with the
    /// correct nonce registers it and moves the FSM to REGISTER.
    #[test]
    fn two_round_handshake() {
        let registrar = registrar();

        let first = registrar.handle(&register_request("U1", None));
        assert_eq!(first.status, Status::NotAuthorized);
        assert_eq!(first.realm, "tscast");
        assert_eq!(first.sequence, 1);
        assert_eq!(first.timestamp, 1234);

        let session = registrar.registry.get("U1").expect("session created");
        assert!(!session.is_registered());
        assert_eq!(session.state(), SessionState::Idle);

        let nonce = registrar.expected_nonce().to_string();
        let second = registrar.handle(&register_request("U1", Some(&nonce)));
        assert_eq!(second.status, Status::Success);
        assert!(session.is_registered());
        assert_eq!(session.state(), SessionState::Register);
    }

    /// A correct nonce on the very first request still only earns a
    /// challenge — first contact never succeeds.
    #[test]
    fn first_request_never_succeeds() {
        let registrar = registrar();
        let nonce = registrar.expected_nonce().to_string();
        let response = registrar.handle(&register_request("U1", Some(&nonce)));
        assert_eq!(response.status, Status::NotAuthorized);
        assert!(!registrar.registry.get("U1").unwrap().is_registered());
    }

    #[test]
    fn wrong_nonce_stays_unregistered() {
        let registrar = registrar();
        registrar.handle(&register_request("U1", None));
        let response = registrar.handle(&register_request("U1", Some("deadbeef")));
        assert_eq!(response.status, Status::NotAuthorized);
        assert!(!registrar.registry.get("U1").unwrap().is_registered());
        assert_eq!(registrar.registry.get("U1").unwrap().state(), SessionState::Idle);
    }

    #[test]
    fn nonceless_retry_challenges_again() {
        let registrar = registrar();
        registrar.handle(&register_request("U1", None));
        let again = registrar.handle(&register_request("U1", None));
        assert_eq!(again.status, Status::NotAuthorized);
    }

    #[test]
    fn keepalive_outside_idle_is_state_error() {
        let registrar = registrar();
        registrar.handle(&register_request("U1", None));
        let nonce = registrar.expected_nonce().to_string();
        registrar.handle(&register_request("U1", Some(&nonce)));

        // Session is now in REGISTER; the keep-alive is rejected.
        let keepalive = registrar.handle(&register_request("U1", Some(&nonce)));
        assert_eq!(keepalive.status, Status::StateError);
    }

    #[test]
    fn unregister_flow() {
        let registrar = registrar();
        registrar.handle(&register_request("U1", None));
        let nonce = registrar.expected_nonce().to_string();
        registrar.handle(&register_request("U1", Some(&nonce)));

        let response = registrar.handle(&unregister_request("U1"));
        assert_eq!(response.status, Status::Success);
        assert!(registrar.registry.get("U1").is_none());
    }

    #[test]
    fn unregister_unknown_unit_not_accepted() {
        let registrar = registrar();
        let response = registrar.handle(&unregister_request("ghost"));
        assert_eq!(response.status, Status::NotAccepted);
    }

    #[test]
    fn unregister_outside_register_state_rejected() {
        let registrar = registrar();
        registrar.handle(&register_request("U1", None));
        // Still IDLE (never registered): UNREGISTER is a state error.
        let response = registrar.handle(&unregister_request("U1"));
        assert_eq!(response.status, Status::StateError);
        assert!(registrar.registry.get("U1").is_some());
    }
}
