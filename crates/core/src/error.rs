//! Error types for the streaming server library.

use std::fmt;

use crate::fsm::{SessionEvent, SessionState};

/// Errors that can occur in the streaming server library.
///
/// Variants map to the failure taxonomy used across the stack:
///
/// - **Protocol**: [`Parse`](Self::Parse) — malformed RTSP messages;
///   [`Transition`](Self::Transition) — an FSM event fired from a state
///   outside its allowed set.
/// - **Wire**: [`Wire`](Self::Wire) — malformed binary packets (RTP,
///   RTCP, URTSP, MPEG-TS).
/// - **Transport**: [`Io`](Self::Io) — socket/file failures.
/// - **Resources**: [`PortPoolExhausted`](Self::PortPoolExhausted).
/// - **Media**: [`Media`](Self::Media) — missing/empty segments and
///   frame-log parse failures; these abort the active PLAY only.
#[derive(Debug, thiserror::Error)]
pub enum CastError {
    /// Underlying I/O or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse an RTSP request message (RFC 2326 §6).
    #[error("RTSP parse error: {kind}")]
    Parse { kind: ParseErrorKind },

    /// Malformed binary packet on one of the wire formats.
    #[error("malformed {format} packet: {detail}")]
    Wire {
        format: &'static str,
        detail: String,
    },

    /// An FSM event fired from a state outside its allowed set.
    /// The session state is left unchanged.
    #[error("event {event:?} not allowed in state {state:?}")]
    Transition {
        event: SessionEvent,
        state: SessionState,
    },

    /// The bounded RTP listen-port pool has no free pairs left.
    #[error("RTP listen port pool exhausted")]
    PortPoolExhausted,

    /// Missing or malformed media (segment file, frame log, playlist).
    #[error("media error: {0}")]
    Media(String),

    /// [`Server::start`](crate::Server::start) was called while already running.
    #[error("server already running")]
    AlreadyRunning,
}

/// Specific kind of RTSP parse failure.
#[derive(Debug)]
pub enum ParseErrorKind {
    /// Input was empty (no request line).
    EmptyRequest,
    /// Request line did not have the expected `Method URI Version` format.
    InvalidRequestLine,
    /// A header line did not contain a colon separator.
    InvalidHeader,
}

impl fmt::Display for ParseErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRequest => write!(f, "empty request"),
            Self::InvalidRequestLine => write!(f, "invalid request line"),
            Self::InvalidHeader => write!(f, "invalid header"),
        }
    }
}

/// Convenience alias for `Result<T, CastError>`.
pub type Result<T> = std::result::Result<T, CastError>;
