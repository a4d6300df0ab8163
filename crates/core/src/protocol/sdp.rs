//! SDP generation for DESCRIBE responses (RFC 4566).
//!
//! Template plumbing around the core: the capability description binds
//! the session's allocated listen port and the configured MP2T payload
//! type. Produced once per DESCRIBE and stored on the session.
//!
//! ```text
//! v=0
//! o=- <unit-id-hash> 1 IN IP4 <addr>
//! s=<unit id>
//! c=IN IP4 <addr>
//! t=0 0
//! a=tool:tscast
//! a=sendonly
//! a=range:npt=0-<duration>
//! m=video <port> RTP/AVP <pt>
//! a=rtpmap:<pt> MP2T/90000
//! ```

use crate::config::ServerConfig;

/// Generate the session description for one unit's media.
pub fn generate_sdp(
    config: &ServerConfig,
    host: &str,
    unit_id: &str,
    rtp_port: u16,
    duration_secs: f64,
) -> String {
    let mut sdp: Vec<String> = Vec::new();

    sdp.push("v=0".to_string());
    sdp.push(format!("o=- 0 1 IN IP4 {}", host));
    sdp.push(format!("s={}", unit_id));
    sdp.push(format!("c=IN IP4 {}", host));
    sdp.push("t=0 0".to_string());
    sdp.push("a=tool:tscast".to_string());
    sdp.push("a=sendonly".to_string());
    sdp.push(format!("a=range:npt=0-{:.3}", duration_secs));
    sdp.push(format!("m=video {} RTP/AVP {}", rtp_port, config.payload_type));
    sdp.push(format!("a=rtpmap:{} MP2T/90000", config.payload_type));

    format!("{}\r\n", sdp.join("\r\n"))
}
