//! Server-level configuration.
//!
//! A plain value struct built by the composition root (the CLI maps its
//! flags onto it). Config-file parsing happens outside this crate; the
//! core only consumes the resolved values.

use std::path::PathBuf;
use std::time::Duration;

use crate::continuity::DEFAULT_SOURCE_GAP_27MHZ;

/// Server-level configuration used by the RTSP router, the registration
/// handshake, and the pacing engine.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// RTSP listen address (`host:port`).
    pub rtsp_bind: String,
    /// Registration (URTSP) control-channel UDP listen address.
    pub control_bind: String,
    /// Root directory holding one media directory per unit id.
    pub media_root: PathBuf,
    /// Playlist file name inside each unit's media directory.
    pub playlist: String,
    /// Realm sent in registration challenges and hashed into the nonce.
    pub realm: String,
    /// Shared secret hashed into the expected registration nonce.
    pub secret: String,
    /// RTP payload type (33 = MP2T per RFC 3551 §6).
    pub payload_type: u8,
    /// Nominal video frame rate of the transcoded segments.
    pub fps: u32,
    /// GOP length the transcoder was configured with; pacing runs at
    /// `fps * gop` sub-frame intervals.
    pub gop: u32,
    /// First RTP listen port handed out by the pool (must be even;
    /// RTCP is always RTP + 1).
    pub port_base: u16,
    /// Number of RTP/RTCP port pairs in the pool.
    pub port_pairs: usize,
    /// Sessions older than this are force-closed by the sweeper
    /// regardless of state.
    pub idle_limit: Duration,
    /// Interval between sweeper passes.
    pub sweep_interval: Duration,
    /// Inter-segment splice gap in 27 MHz PCR units. A heuristic
    /// carried over from the transcoder toolchain; tunable, not derived.
    pub source_gap_27mhz: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            rtsp_bind: "0.0.0.0:8554".to_string(),
            control_bind: "0.0.0.0:8600".to_string(),
            media_root: PathBuf::from("/var/lib/tscast/media"),
            playlist: "playlist.txt".to_string(),
            realm: "tscast".to_string(),
            secret: "changeme".to_string(),
            payload_type: 33,
            fps: 25,
            gop: 12,
            port_base: 5000,
            port_pairs: 64,
            idle_limit: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(30),
            source_gap_27mhz: DEFAULT_SOURCE_GAP_27MHZ,
        }
    }
}
