//! Pacing and RTP transmission.
//!
//! One engine thread per active PLAY. The engine walks the segment
//! list in order, rewrites each 188-byte transport packet through the
//! [`ContinuityFixer`], groups packets into frames using the encoder's
//! frame log, and paces transmission against real time: every
//! completed frame advances the RTP timestamp by
//! `90000 / (fps · gop)` ticks and sleeps `1000 / (fps · gop)` ms —
//! except the frame that completes the final segment, which is not
//! delayed. The RTP sequence number increments by exactly one per
//! transport packet sent, never per frame.
//!
//! The only blocking points are the pacing waits and file reads; the
//! wait is a condvar with timeout, so PAUSE/TEARDOWN interrupt it
//! before the next packet. [`EngineHandle::stop`] joins the thread:
//! when it returns, the streamer has observably stopped sending.

use std::fs;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::congestion::{FrameScaler, quality_factor};
use crate::continuity::{ContinuityFixer, TS_PACKET_LEN};
use crate::error::{CastError, Result};
use crate::fsm::SessionEvent;
use crate::media::MediaSource;
use crate::session::{Session, Streamer};
use crate::wire::RtpHeader;

/// RTP clock rate for video payloads (RFC 3551 §4).
pub const VIDEO_CLOCK_HZ: u32 = 90_000;

/// Cancellation token shared between a pacing thread and its handle.
///
/// Built on a condvar so a trigger interrupts an in-progress pacing
/// wait immediately instead of letting the sleep run out.
struct StopToken {
    stopped: Mutex<bool>,
    cv: Condvar,
}

impl StopToken {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    fn trigger(&self) {
        *self.stopped.lock() = true;
        self.cv.notify_all();
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Pacing wait. Returns true when the token fired before or during
    /// the wait.
    fn wait(&self, timeout: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return true;
        }
        self.cv.wait_for(&mut stopped, timeout);
        *stopped
    }
}

/// Handle to a running pacing thread.
pub struct EngineHandle {
    token: Arc<StopToken>,
    join: JoinHandle<()>,
}

impl EngineHandle {
    /// Cancel the pacing run and wait until the thread has exited.
    /// Synchronous from the caller's point of view: no packet for this
    /// streamer is sent after this returns.
    pub fn stop(self) {
        self.token.trigger();
        let _ = self.join.join();
    }
}

/// How a pacing run ended.
enum Outcome {
    /// All segments streamed to the end.
    Completed,
    /// Stopped by PAUSE/TEARDOWN before the end.
    Cancelled,
}

/// One pacing run over a resolved media source.
pub struct PacingEngine {
    session: Arc<Session>,
    streamer: Arc<Streamer>,
    media: Arc<MediaSource>,
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    payload_type: u8,
    scaler: Arc<dyn FrameScaler>,
    gap_27mhz: u64,
}

impl PacingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<Session>,
        streamer: Arc<Streamer>,
        media: Arc<MediaSource>,
        socket: Arc<UdpSocket>,
        dest: SocketAddr,
        payload_type: u8,
        scaler: Arc<dyn FrameScaler>,
        gap_27mhz: u64,
    ) -> Self {
        Self {
            session,
            streamer,
            media,
            socket,
            dest,
            payload_type,
            scaler,
            gap_27mhz,
        }
    }

    /// Spawn the pacing thread and return its handle.
    pub fn start(self) -> EngineHandle {
        let token = Arc::new(StopToken::new());
        let thread_token = token.clone();
        let join = thread::spawn(move || {
            let unit = self.session.unit_id.clone();
            match self.run(&thread_token) {
                Ok(Outcome::Completed) => {
                    tracing::info!(unit = %unit, "stream ran to completion");
                }
                Ok(Outcome::Cancelled) => {
                    tracing::debug!(unit = %unit, "stream cancelled");
                }
                Err(e) => {
                    // Media and transport failures abort this PLAY only;
                    // the session drops back to a recoverable state.
                    tracing::error!(unit = %unit, error = %e, "stream aborted");
                    self.session.try_fire(SessionEvent::PlayFail);
                }
            }
        });
        EngineHandle { token, join }
    }

    fn run(&self, token: &StopToken) -> Result<Outcome> {
        let subframe_rate = self.media.fps() * self.media.gop();
        if subframe_rate == 0 {
            return Err(CastError::Media("fps * gop must be non-zero".to_string()));
        }
        let ticks = VIDEO_CLOCK_HZ / subframe_rate;
        let interval_ms = u64::from(1000 / subframe_rate);

        let segments = self.media.segments().to_vec();
        let last_segment = segments.len() - 1;
        let mut fixer = ContinuityFixer::new(self.gap_27mhz);

        tracing::info!(
            unit = %self.session.unit_id,
            dest = %self.dest,
            segments = segments.len(),
            ticks_per_frame = ticks,
            interval_ms,
            "pacing started"
        );

        for (seg_index, name) in segments.iter().enumerate() {
            if seg_index > 0 {
                fixer.next_source();
            }
            match self.stream_segment(token, &mut fixer, name, seg_index == last_segment, ticks, interval_ms)? {
                Outcome::Cancelled => return Ok(Outcome::Cancelled),
                Outcome::Completed => {}
            }
        }
        Ok(Outcome::Completed)
    }

    fn stream_segment(
        &self,
        token: &StopToken,
        fixer: &mut ContinuityFixer,
        name: &str,
        final_segment: bool,
        ticks: u32,
        interval_ms: u64,
    ) -> Result<Outcome> {
        let frames = self.media.frame_log(name)?;
        let path = self.media.segment_path(name);
        let data =
            fs::read(&path).map_err(|e| CastError::Media(format!("segment {}: {}", path.display(), e)))?;
        if data.is_empty() {
            return Err(CastError::Media(format!("segment {} is empty", path.display())));
        }
        if data.len() % TS_PACKET_LEN != 0 {
            return Err(CastError::Media(format!(
                "segment {} is not a whole number of TS packets",
                path.display()
            )));
        }

        let mut frame_index = 0usize;
        let mut accumulated = 0u64;
        let mut frame_buf: Vec<u8> = Vec::new();

        for chunk in data.chunks_exact(TS_PACKET_LEN) {
            // A stop request drops the partial frame on the floor;
            // nothing half-built is flushed.
            if token.is_stopped() {
                return Ok(Outcome::Cancelled);
            }

            let mut pkt = chunk.to_vec();
            fixer.fix_packet(&mut pkt)?;
            frame_buf.extend_from_slice(&pkt);
            accumulated += TS_PACKET_LEN as u64;

            let Some(frame) = frames.get(frame_index) else {
                // Transport packets past the frame log are flushed
                // after the loop, unpaced.
                continue;
            };
            if accumulated < u64::from(frame.size) {
                continue;
            }

            // Frame complete: shape it against the congestion level,
            // then send and advance the media clock.
            let quality = quality_factor(self.session.congestion_level());
            if quality < 1.0 {
                self.scaler.scale(&mut frame_buf, quality);
            }
            self.send_burst(&frame_buf)?;
            self.streamer.lock_clock().advance_timestamp(ticks);

            accumulated -= u64::from(frame.size);
            frame_index += 1;
            frame_buf.clear();

            let media_exhausted = final_segment && frame_index >= frames.len();
            if !media_exhausted && interval_ms > 0 && token.wait(Duration::from_millis(interval_ms)) {
                return Ok(Outcome::Cancelled);
            }
        }

        if !frame_buf.is_empty() {
            tracing::debug!(
                segment = %name,
                bytes = frame_buf.len(),
                "flushing transport packets past the frame log"
            );
            self.send_burst(&frame_buf)?;
        }
        Ok(Outcome::Completed)
    }

    /// Send one buffer as a run of RTP packets, one transport packet
    /// each, advancing the sequence number per packet.
    fn send_burst(&self, buf: &[u8]) -> Result<()> {
        for payload in buf.chunks(TS_PACKET_LEN) {
            let header = {
                let mut clock = self.streamer.lock_clock();
                RtpHeader {
                    payload_type: self.payload_type,
                    sequence: clock.next_sequence(),
                    timestamp: clock.timestamp,
                    ssrc: self.streamer.ssrc,
                }
            };
            self.socket.send_to(&header.packet(payload), self.dest)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::NullScaler;
    use crate::fsm::Fsm;
    use crate::session::{PortPool, SessionRegistry};
    use crate::wire::rtp::RTP_HEADER_LEN;
    use std::io::Write;
    use std::path::PathBuf;

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tscast-engine-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn ts_packet(cc: u8) -> [u8; TS_PACKET_LEN] {
        let mut pkt = [0xffu8; TS_PACKET_LEN];
        pkt[0] = 0x47;
        pkt[1] = 0x01; // PID 0x100
        pkt[2] = 0x00;
        pkt[3] = 0x10 | (cc & 0x0f);
        pkt
    }

    /// Write a segment of `packets` TS packets plus a frame log of one
    /// frame per two packets.
    fn write_segment(dir: &PathBuf, name: &str, packets: u8) {
        let mut data = Vec::new();
        for cc in 0..packets {
            data.extend_from_slice(&ts_packet(cc));
        }
        fs::File::create(dir.join(name)).unwrap().write_all(&data).unwrap();

        let mut flog = String::new();
        for _ in 0..packets / 2 {
            flog.push_str("376 P\n");
        }
        fs::File::create(dir.join(format!("{}.flog", name)))
            .unwrap()
            .write_all(flog.as_bytes())
            .unwrap();
    }

    fn session() -> Arc<Session> {
        let registry =
            SessionRegistry::new(Arc::new(Fsm::new()), Arc::new(PortPool::new(5000, 2)));
        registry.open("unit-engine")
    }

    #[test]
    fn streams_all_packets_with_incrementing_sequence() {
        let dir = scratch_dir("seq");
        write_segment(&dir, "seg0.ts", 4);
        write_segment(&dir, "seg1.ts", 4);
        fs::write(dir.join("playlist.txt"), "seg0.ts\nseg1.ts\n").unwrap();

        // fps * gop = 1000 keeps the pacing interval at 1 ms.
        let media = Arc::new(MediaSource::open(&dir, "playlist.txt", 100, 10).unwrap());
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        receiver
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let dest = receiver.local_addr().unwrap();

        let session = session();
        let streamer = Arc::new(Streamer::new());
        let start_seq = streamer.clock().sequence;
        let engine = PacingEngine::new(
            session,
            streamer.clone(),
            media,
            Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
            dest,
            33,
            Arc::new(NullScaler),
            0,
        );
        let handle = engine.start();

        let mut buf = [0u8; 2048];
        let mut sequences = Vec::new();
        let mut timestamps = Vec::new();
        for _ in 0..8 {
            let (len, _) = receiver.recv_from(&mut buf).expect("RTP packet");
            assert_eq!(len, RTP_HEADER_LEN + TS_PACKET_LEN);
            assert_eq!(buf[0] >> 6, 2);
            assert_eq!(buf[1] & 0x7f, 33);
            sequences.push(u16::from_be_bytes([buf[2], buf[3]]));
            timestamps.push(u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]));
        }
        handle.stop();

        for (i, seq) in sequences.iter().enumerate() {
            assert_eq!(*seq, start_seq.wrapping_add(i as u16), "packet {}", i);
        }
        for pair in timestamps.windows(2) {
            assert!(pair[1].wrapping_sub(pair[0]) < u32::MAX / 2, "timestamp regressed");
        }
    }

    #[test]
    fn stop_interrupts_promptly() {
        let dir = scratch_dir("stop");
        // One large segment with a slow pace: fps * gop = 2 gives a
        // 500 ms interval per frame.
        write_segment(&dir, "seg0.ts", 200);
        fs::write(dir.join("playlist.txt"), "seg0.ts\n").unwrap();
        let media = Arc::new(MediaSource::open(&dir, "playlist.txt", 2, 1).unwrap());

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let dest = receiver.local_addr().unwrap();
        let engine = PacingEngine::new(
            session(),
            Arc::new(Streamer::new()),
            media,
            Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
            dest,
            33,
            Arc::new(NullScaler),
            0,
        );
        let handle = engine.start();
        std::thread::sleep(Duration::from_millis(50));

        let begun = std::time::Instant::now();
        handle.stop();
        assert!(
            begun.elapsed() < Duration::from_millis(450),
            "stop must interrupt the pacing wait"
        );
    }

    #[test]
    fn missing_segment_fires_play_fail() {
        let dir = scratch_dir("missing");
        write_segment(&dir, "seg0.ts", 2);
        fs::write(dir.join("playlist.txt"), "seg0.ts\n").unwrap();
        let media = Arc::new(MediaSource::open(&dir, "playlist.txt", 100, 10).unwrap());
        // Remove the segment after resolving the source.
        fs::remove_file(dir.join("seg0.ts")).unwrap();

        let session = session();
        session.fire(SessionEvent::Register).unwrap();
        session.fire(SessionEvent::Options).unwrap();
        session.fire(SessionEvent::Setup).unwrap();
        session.fire(SessionEvent::Play).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let engine = PacingEngine::new(
            session.clone(),
            Arc::new(Streamer::new()),
            media,
            Arc::new(UdpSocket::bind("127.0.0.1:0").unwrap()),
            receiver.local_addr().unwrap(),
            33,
            Arc::new(NullScaler),
            0,
        );
        let handle = engine.start();
        // Wait for the thread to fail, then reap it.
        std::thread::sleep(Duration::from_millis(100));
        handle.stop();

        assert_eq!(session.state(), crate::fsm::SessionState::Register);
    }

    #[test]
    fn pacing_math() {
        // 25 fps with a GOP of 12 → 300 sub-frames/s → 300 ticks and
        // 3 ms per frame.
        assert_eq!(VIDEO_CLOCK_HZ / (25 * 12), 300);
        assert_eq!(1000 / (25 * 12), 3);
    }
}
