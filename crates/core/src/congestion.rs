//! RTCP-driven congestion monitoring.
//!
//! Clients report reception quality through RTCP receiver reports on
//! the session's listen port + 1. The monitor maps the reported
//! fraction-lost onto a discrete level 0–4 and overwrites the session's
//! stored level immediately — no hysteresis or smoothing; the pacing
//! engine picks the new level up at its next frame boundary.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::error::Result;
use crate::session::Session;
use crate::wire::ReceiverReport;

/// Highest congestion level.
pub const MAX_LEVEL: u8 = 4;

/// Poll interval for the listener's read timeout, bounding shutdown
/// latency.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Map an RTCP fraction-lost value in `[0, 1]` onto a level 0–4.
///
/// Closed intervals; every boundary value belongs to the lower bucket:
/// `[0, 0.01] → 0`, `(0.01, 0.25] → 1`, `(0.25, 0.5] → 2`,
/// `(0.5, 0.75] → 3`, `(0.75, 1] → 4`.
pub fn congestion_level(fraction_lost: f32) -> u8 {
    if fraction_lost <= 0.01 {
        0
    } else if fraction_lost <= 0.25 {
        1
    } else if fraction_lost <= 0.5 {
        2
    } else if fraction_lost <= 0.75 {
        3
    } else {
        4
    }
}

/// Quality factor the pacing engine applies at a given level.
pub fn quality_factor(level: u8) -> f32 {
    1.0 - 0.2 * f32::from(level.min(MAX_LEVEL))
}

/// Seam for congestion-driven frame reduction.
///
/// Real recompression belongs to the external encoder; the engine
/// threads each completed frame through this trait with the current
/// quality factor before packetization.
pub trait FrameScaler: Send + Sync {
    fn scale(&self, frame: &mut Vec<u8>, quality: f32);
}

/// Default scaler: leaves the frame untouched and records the fact.
#[derive(Debug, Default)]
pub struct NullScaler;

impl FrameScaler for NullScaler {
    fn scale(&self, frame: &mut Vec<u8>, quality: f32) {
        tracing::trace!(bytes = frame.len(), quality, "frame passed through unscaled");
    }
}

/// Handle to a per-streamer RTCP listener thread.
///
/// Dropping the handle without calling [`stop`](Self::stop) leaves the
/// thread running until its session's server shuts down; callers stop
/// it when the streamer is destroyed.
pub struct RtcpMonitor {
    running: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl RtcpMonitor {
    /// Start consuming receiver reports from `socket` for `session`.
    pub fn spawn(socket: UdpSocket, session: Arc<Session>) -> Result<Self> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let join = thread::spawn(move || receive_loop(socket, session, flag));
        Ok(Self {
            running,
            join: Some(join),
        })
    }

    /// Stop the listener and wait for the thread to exit.
    pub fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn receive_loop(socket: UdpSocket, session: Arc<Session>, running: Arc<AtomicBool>) {
    let mut buf = [0u8; 1500];
    while running.load(Ordering::SeqCst) {
        let len = match socket.recv_from(&mut buf) {
            Ok((len, _)) => len,
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(e) => {
                tracing::warn!(unit = %session.unit_id, error = %e, "RTCP receive error");
                break;
            }
        };

        let Some(report) = ReceiverReport::find_in(&buf[..len]) else {
            tracing::trace!(unit = %session.unit_id, len, "non-RR RTCP datagram ignored");
            continue;
        };
        // Only fraction-lost is acted upon.
        if let Some(block) = report.reports.first() {
            let ratio = block.fraction_lost_ratio();
            let level = congestion_level(ratio);
            let old = session.congestion_level();
            session.set_congestion_level(level);
            if level != old {
                tracing::info!(
                    unit = %session.unit_id,
                    fraction_lost = ratio,
                    old_level = old,
                    new_level = level,
                    "congestion level changed"
                );
            }
        }
    }
}
