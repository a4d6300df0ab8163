//! Per-SETUP delivery state.
//!
//! A [`Streamer`] is created at SETUP and owns everything specific to
//! one delivery: the opaque RTSP session id, the negotiated
//! destination, the SSRC, the advancing RTP clock, the resolved media,
//! and the handles of the pacing engine and RTCP monitor threads. It is
//! destroyed at TEARDOWN or when its session closes; PAUSE merely stops
//! the engine and regenerates the clock.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::RngExt;
use std::sync::Arc;

use crate::congestion::RtcpMonitor;
use crate::engine::EngineHandle;
use crate::media::MediaSource;

/// RTP sequence/timestamp state for one streamer.
///
/// Both start at random values (RFC 3550 §5.1) and only advance, mod
/// their field width. PAUSE replaces the whole clock with fresh random
/// values.
#[derive(Debug, Clone, Copy)]
pub struct RtpClock {
    pub sequence: u16,
    pub timestamp: u32,
}

impl RtpClock {
    fn random() -> Self {
        let mut rng = rand::rng();
        Self {
            sequence: rng.random::<u16>(),
            timestamp: rng.random::<u32>(),
        }
    }

    /// Current sequence number; advances by exactly one per call.
    pub fn next_sequence(&mut self) -> u16 {
        let sequence = self.sequence;
        self.sequence = self.sequence.wrapping_add(1);
        sequence
    }

    /// Advance the timestamp by one frame interval.
    pub fn advance_timestamp(&mut self, ticks: u32) {
        self.timestamp = self.timestamp.wrapping_add(ticks);
    }
}

/// One active delivery, owned by a session.
pub struct Streamer {
    /// Opaque session id echoed in the RTSP `Session` header.
    pub id: String,
    /// Fixed for the streamer's lifetime (31-bit, random).
    pub ssrc: u32,
    dest: RwLock<Option<SocketAddr>>,
    rtcp_dest_port: RwLock<Option<u16>>,
    clock: Mutex<RtpClock>,
    paused: AtomicBool,
    media: RwLock<Option<Arc<MediaSource>>>,
    user_agent: RwLock<Option<String>>,
    engine: Mutex<Option<EngineHandle>>,
    monitor: Mutex<Option<RtcpMonitor>>,
}

impl Streamer {
    pub fn new() -> Self {
        let mut rng = rand::rng();
        let id = format!("{:016X}", rng.random::<u64>());
        let ssrc = rng.random::<u32>() >> 1;
        tracing::debug!(streamer_id = %id, ssrc = format_args!("{:#010X}", ssrc), "streamer created");
        Self {
            id,
            ssrc,
            dest: RwLock::new(None),
            rtcp_dest_port: RwLock::new(None),
            clock: Mutex::new(RtpClock::random()),
            paused: AtomicBool::new(false),
            media: RwLock::new(None),
            user_agent: RwLock::new(None),
            engine: Mutex::new(None),
            monitor: Mutex::new(None),
        }
    }

    /// RTP destination; must be set before PLAY is accepted.
    pub fn destination(&self) -> Option<SocketAddr> {
        *self.dest.read()
    }

    pub fn set_destination(&self, addr: SocketAddr) {
        tracing::debug!(streamer_id = %self.id, %addr, "RTP destination set");
        *self.dest.write() = Some(addr);
    }

    pub fn rtcp_dest_port(&self) -> Option<u16> {
        *self.rtcp_dest_port.read()
    }

    pub fn set_rtcp_dest_port(&self, port: Option<u16>) {
        *self.rtcp_dest_port.write() = port;
    }

    /// Snapshot of the current clock (for the `RTP-Info` header).
    pub fn clock(&self) -> RtpClock {
        *self.clock.lock()
    }

    /// Exclusive access for the pacing engine's advance-per-packet loop.
    pub(crate) fn lock_clock(&self) -> MutexGuard<'_, RtpClock> {
        self.clock.lock()
    }

    /// Replace sequence and timestamp with fresh random values (PAUSE).
    pub fn reset_clock(&self) {
        let fresh = RtpClock::random();
        tracing::debug!(
            streamer_id = %self.id,
            sequence = fresh.sequence,
            timestamp = fresh.timestamp,
            "RTP clock reset"
        );
        *self.clock.lock() = fresh;
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub fn media(&self) -> Option<Arc<MediaSource>> {
        self.media.read().clone()
    }

    pub fn set_media(&self, media: Arc<MediaSource>) {
        *self.media.write() = Some(media);
    }

    pub fn user_agent(&self) -> Option<String> {
        self.user_agent.read().clone()
    }

    pub fn set_user_agent(&self, agent: Option<String>) {
        *self.user_agent.write() = agent;
    }

    /// Hand the running pacing engine to the streamer. Any previous
    /// engine is stopped first so one streamer never sends from two
    /// threads.
    pub fn attach_engine(&self, handle: EngineHandle) {
        if let Some(old) = self.engine.lock().replace(handle) {
            old.stop();
        }
    }

    /// Stop the pacing engine and wait for it to exit. Returns whether
    /// an engine was running. Synchronous: when this returns, no more
    /// packets are sent for this streamer.
    pub fn stop_streaming(&self) -> bool {
        let handle = self.engine.lock().take();
        match handle {
            Some(handle) => {
                handle.stop();
                true
            }
            None => false,
        }
    }

    pub fn attach_monitor(&self, monitor: RtcpMonitor) {
        if let Some(old) = self.monitor.lock().replace(monitor) {
            old.stop();
        }
    }

    /// Tear down every thread owned by this streamer.
    pub fn shutdown(&self) {
        self.stop_streaming();
        if let Some(monitor) = self.monitor.lock().take() {
            monitor.stop();
        }
        tracing::debug!(streamer_id = %self.id, "streamer shut down");
    }
}

impl Default for Streamer {
    fn default() -> Self {
        Self::new()
    }
}
