//! Fixed-layout binary wire formats.
//!
//! Leaf codecs with no dependency on the rest of the crate beyond the
//! error type: the RTP fixed header, the RTCP receiver report, and the
//! custom URTSP registration protocol. Each module owns its byte layout
//! end to end; nothing here touches sockets or sessions.

pub mod rtcp;
pub mod rtp;
pub mod urtsp;

pub use rtcp::{ReceiverReport, ReportBlock};
pub use rtp::RtpHeader;
pub use urtsp::{MessageKind, RegisterRequest, RegisterResponse, Status};
