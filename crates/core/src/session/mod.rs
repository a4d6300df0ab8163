//! Session state and registry.
//!
//! A session exists per registered unit (not per TCP connection): it is
//! created by the first REGISTER on the control channel, survives RTSP
//! connection churn, and is destroyed by UNREGISTER, explicit close, or
//! the idle sweeper. Each session owns its FSM state, the SDP built at
//! DESCRIBE, the congestion level written by the RTCP monitor, its
//! allocated RTP listen port, and at most one [`Streamer`].

pub mod ports;
pub mod streamer;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::congestion::MAX_LEVEL;
use crate::error::Result;
use crate::fsm::{Fsm, SessionEvent, SessionState};
pub use ports::PortPool;
pub use streamer::{RtpClock, Streamer};

/// State aggregate for one registered unit.
pub struct Session {
    /// Client-supplied unit identifier, stable across reconnects.
    pub unit_id: String,
    fsm: Arc<Fsm>,
    state: RwLock<SessionState>,
    sdp: RwLock<Option<String>>,
    /// Single writer (RTCP monitor), many readers (pacing engine).
    congestion: AtomicU8,
    registered: AtomicBool,
    /// 0 until DESCRIBE/SETUP allocates a listen port.
    rtp_port: AtomicU16,
    created: Instant,
    streamer: RwLock<Option<Arc<Streamer>>>,
}

impl Session {
    fn new(unit_id: &str, fsm: Arc<Fsm>) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            fsm,
            state: RwLock::new(SessionState::Idle),
            sdp: RwLock::new(None),
            congestion: AtomicU8::new(0),
            registered: AtomicBool::new(false),
            rtp_port: AtomicU16::new(0),
            created: Instant::now(),
            streamer: RwLock::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Whether `event` may fire from the current state.
    pub fn permits(&self, event: SessionEvent) -> bool {
        self.fsm.permits(self.state(), event)
    }

    /// Fire an FSM event. The state write lock is held across the
    /// check-and-set, so transitions for one session are serialized;
    /// a rejected event leaves the state untouched.
    pub fn fire(&self, event: SessionEvent) -> Result<SessionState> {
        let mut state = self.state.write();
        let next = self.fsm.fire(*state, event)?;
        tracing::debug!(
            unit = %self.unit_id,
            ?event,
            from = ?*state,
            to = ?next,
            "state transition"
        );
        *state = next;
        Ok(next)
    }

    /// Fire an event, swallowing a state mismatch (used on `*_FAIL`
    /// paths where the FSM contract makes the event a no-op).
    pub fn try_fire(&self, event: SessionEvent) -> bool {
        self.fire(event).is_ok()
    }

    pub fn sdp(&self) -> Option<String> {
        self.sdp.read().clone()
    }

    pub fn set_sdp(&self, sdp: String) {
        *self.sdp.write() = Some(sdp);
    }

    /// Congestion level 0–4 derived from RTCP feedback.
    pub fn congestion_level(&self) -> u8 {
        self.congestion.load(Ordering::Relaxed)
    }

    pub fn set_congestion_level(&self, level: u8) {
        self.congestion.store(level.min(MAX_LEVEL), Ordering::Relaxed);
    }

    /// Whether the unit has completed the nonce challenge.
    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn set_registered(&self) {
        self.registered.store(true, Ordering::SeqCst);
    }

    /// Allocated RTP listen port, 0 when none is held.
    pub fn rtp_port(&self) -> u16 {
        self.rtp_port.load(Ordering::SeqCst)
    }

    /// Bind an allocated port to this session. Only succeeds while no
    /// port is held — once set, the port is stable until close.
    pub fn assign_rtp_port(&self, port: u16) -> bool {
        self.rtp_port
            .compare_exchange(0, port, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Take the port for release, leaving 0 behind. The swap makes the
    /// release-exactly-once invariant hold even if close races.
    fn take_rtp_port(&self) -> u16 {
        self.rtp_port.swap(0, Ordering::SeqCst)
    }

    /// Age since creation, compared against the idle limit.
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    pub fn streamer(&self) -> Option<Arc<Streamer>> {
        self.streamer.read().clone()
    }

    pub fn set_streamer(&self, streamer: Arc<Streamer>) {
        *self.streamer.write() = Some(streamer);
    }

    /// Detach and return the streamer (TEARDOWN). The caller shuts the
    /// streamer's threads down.
    pub fn take_streamer(&self) -> Option<Arc<Streamer>> {
        self.streamer.write().take()
    }
}

/// Thread-safe map of unit id → session, shared across the RTSP
/// router, the registration handshake, and the sweeper.
///
/// Cheap to clone (all `Arc`s), so each thread gets its own handle.
/// Iteration is always snapshot-based so the live map is never
/// traversed under mutation.
#[derive(Clone)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<String, Arc<Session>>>>,
    fsm: Arc<Fsm>,
    ports: Arc<PortPool>,
}

impl SessionRegistry {
    pub fn new(fsm: Arc<Fsm>, ports: Arc<PortPool>) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            fsm,
            ports,
        }
    }

    /// Get the session for `unit_id`, creating an IDLE unregistered one
    /// when absent.
    pub fn open(&self, unit_id: &str) -> Arc<Session> {
        if let Some(session) = self.get(unit_id) {
            return session;
        }
        let mut sessions = self.sessions.write();
        // Re-check under the write lock; another thread may have won.
        if let Some(session) = sessions.get(unit_id) {
            return session.clone();
        }
        let session = Arc::new(Session::new(unit_id, self.fsm.clone()));
        sessions.insert(unit_id.to_string(), session.clone());
        tracing::info!(unit = %unit_id, total_sessions = sessions.len(), "session opened");
        session
    }

    pub fn get(&self, unit_id: &str) -> Option<Arc<Session>> {
        self.sessions.read().get(unit_id).cloned()
    }

    /// Remove a session and release everything it owns: the streamer's
    /// threads and the RTP listen port (exactly once).
    pub fn close(&self, unit_id: &str) -> Option<Arc<Session>> {
        let removed = self.sessions.write().remove(unit_id);
        if let Some(session) = &removed {
            if let Some(streamer) = session.take_streamer() {
                streamer.shutdown();
            }
            let port = session.take_rtp_port();
            if port != 0 {
                self.ports.release(port);
            }
            let total = self.sessions.read().len();
            tracing::info!(unit = %unit_id, total_sessions = total, "session closed");
        }
        removed
    }

    /// Close every session (server shutdown).
    pub fn close_all(&self) {
        for session in self.snapshot() {
            self.close(&session.unit_id);
        }
    }

    /// Snapshot of all sessions for lock-free iteration.
    pub fn snapshot(&self) -> Vec<Arc<Session>> {
        self.sessions.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    /// The port pool shared with this registry.
    pub fn ports(&self) -> &PortPool {
        &self.ports
    }
}
