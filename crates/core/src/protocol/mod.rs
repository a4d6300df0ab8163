//! RTSP protocol implementation (RFC 2326).
//!
//! Parsing, response building, method routing, range handling, and SDP
//! generation for the text-based control protocol.
//!
//! ## RTSP message format (RFC 2326 §4)
//!
//! RTSP messages follow HTTP/1.1 syntax with a different method set:
//!
//! ```text
//! DESCRIBE rtsp://server/unit-42 RTSP/1.0\r\n
//! CSeq: 2\r\n
//! Accept: application/sdp\r\n
//! \r\n
//! ```
//!
//! Sessions here are keyed by the unit id in the URI path and outlive
//! any single TCP connection — the unit must have passed the
//! registration handshake on the control channel before the FSM lets
//! any method through.
//!
//! ## Supported methods
//!
//! | Method | Purpose |
//! |--------|---------|
//! | OPTIONS | Capability discovery, session token reuse |
//! | DESCRIBE | Allocate listen port, return SDP |
//! | SETUP | Negotiate destination ports, create streamer |
//! | PLAY | Validate range, start pacing engine |
//! | PAUSE | Stop engine, reset RTP clock |
//! | TEARDOWN | Destroy streamer |
//! | GET_PARAMETER | Keepalive |

pub mod handler;
pub mod range;
pub mod request;
pub mod response;
pub mod sdp;

pub use handler::MethodHandler;
pub use range::NptRange;
pub use request::{Method, RtspRequest};
pub use response::RtspResponse;
