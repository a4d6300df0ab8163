//! URTSP registration-protocol codec.
//!
//! The out-of-band UDP control channel units use to register before any
//! RTSP exchange. All integers are big-endian. Every datagram starts
//! with a fixed 22-byte header:
//!
//! ```text
//! +--------+--------+----------+-----------+----------+
//! | magic  | kind   | sequence | timestamp | body len |
//! | u32    | u16    | u32      | u64       | u32      |
//! +--------+--------+----------+-----------+----------+
//! ```
//!
//! Request body (REGISTER and UNREGISTER share the layout; UNREGISTER
//! ignores `expires` and `nonce`):
//!
//! ```text
//! unit-id len u32 | unit-id UTF-8 | expires u64 | nonce len u32 | nonce UTF-8
//! ```
//!
//! Response body (header fields mirror the request):
//!
//! ```text
//! status u32 | realm len u32 | realm UTF-8 | reason len u32 | reason UTF-8
//! ```

use crate::error::CastError;

/// Magic cookie opening every URTSP datagram (`"URTS"`).
pub const MAGIC: u32 = 0x5552_5453;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 22;

/// Ceiling on declared body length; anything larger is rejected as
/// malformed rather than allocated.
const MAX_BODY_LEN: usize = 4096;

/// Message kind carried in the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Register = 1,
    Unregister = 2,
}

impl MessageKind {
    fn from_wire(value: u16) -> Result<Self, CastError> {
        match value {
            1 => Ok(Self::Register),
            2 => Ok(Self::Unregister),
            other => Err(urtsp_err(format!("unknown message kind {}", other))),
        }
    }
}

/// Registration status code carried in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    NotAuthorized = 1,
    NotAccepted = 2,
    StateError = 3,
}

impl Status {
    fn from_wire(value: u32) -> Result<Self, CastError> {
        match value {
            0 => Ok(Self::Success),
            1 => Ok(Self::NotAuthorized),
            2 => Ok(Self::NotAccepted),
            3 => Ok(Self::StateError),
            other => Err(urtsp_err(format!("unknown status {}", other))),
        }
    }
}

/// A decoded REGISTER/UNREGISTER request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub kind: MessageKind,
    pub sequence: u32,
    pub timestamp: u64,
    /// Client-supplied unit identifier, stable across reconnects.
    pub unit_id: String,
    /// Requested lease duration in seconds.
    pub expires: u64,
    /// Challenge answer; absent on the first attempt.
    pub nonce: Option<String>,
}

impl RegisterRequest {
    pub fn encode(&self) -> Vec<u8> {
        let nonce = self.nonce.as_deref().unwrap_or("");
        let body_len = 4 + self.unit_id.len() + 8 + 4 + nonce.len();
        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);
        write_header(&mut buf, self.kind, self.sequence, self.timestamp, body_len);
        write_string(&mut buf, &self.unit_id);
        buf.extend_from_slice(&self.expires.to_be_bytes());
        write_string(&mut buf, nonce);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CastError> {
        let (kind, sequence, timestamp, body) = read_header(buf)?;
        let mut cursor = Cursor::new(body);
        let unit_id = cursor.read_string("unit id")?;
        if unit_id.is_empty() {
            return Err(urtsp_err("empty unit id".to_string()));
        }
        let expires = cursor.read_u64("expires")?;
        let nonce = cursor.read_string("nonce")?;
        Ok(Self {
            kind,
            sequence,
            timestamp,
            unit_id,
            expires,
            nonce: if nonce.is_empty() { None } else { Some(nonce) },
        })
    }
}

/// A registration response; header fields mirror the request's.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub kind: MessageKind,
    pub sequence: u32,
    pub timestamp: u64,
    pub status: Status,
    /// Authentication realm the expected nonce is derived from.
    pub realm: String,
    /// Optional human-readable explanation.
    pub reason: Option<String>,
}

impl RegisterResponse {
    pub fn encode(&self) -> Vec<u8> {
        let reason = self.reason.as_deref().unwrap_or("");
        let body_len = 4 + 4 + self.realm.len() + 4 + reason.len();
        let mut buf = Vec::with_capacity(HEADER_LEN + body_len);
        write_header(&mut buf, self.kind, self.sequence, self.timestamp, body_len);
        buf.extend_from_slice(&(self.status as u32).to_be_bytes());
        write_string(&mut buf, &self.realm);
        write_string(&mut buf, reason);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, CastError> {
        let (kind, sequence, timestamp, body) = read_header(buf)?;
        let mut cursor = Cursor::new(body);
        let status = Status::from_wire(cursor.read_u32("status")?)?;
        let realm = cursor.read_string("realm")?;
        let reason = cursor.read_string("reason")?;
        Ok(Self {
            kind,
            sequence,
            timestamp,
            status,
            realm,
            reason: if reason.is_empty() { None } else { Some(reason) },
        })
    }
}

fn write_header(buf: &mut Vec<u8>, kind: MessageKind, sequence: u32, timestamp: u64, body_len: usize) {
    buf.extend_from_slice(&MAGIC.to_be_bytes());
    buf.extend_from_slice(&(kind as u16).to_be_bytes());
    buf.extend_from_slice(&sequence.to_be_bytes());
    buf.extend_from_slice(&timestamp.to_be_bytes());
    buf.extend_from_slice(&(body_len as u32).to_be_bytes());
}

fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u32).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Validate the fixed header and return `(kind, seq, ts, body)`.
fn read_header(buf: &[u8]) -> Result<(MessageKind, u32, u64, &[u8]), CastError> {
    if buf.len() < HEADER_LEN {
        return Err(urtsp_err(format!("{} bytes is shorter than header", buf.len())));
    }
    let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != MAGIC {
        return Err(urtsp_err(format!("bad magic {:#010x}", magic)));
    }
    let kind = MessageKind::from_wire(u16::from_be_bytes([buf[4], buf[5]]))?;
    let sequence = u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]);
    let timestamp = u64::from_be_bytes([
        buf[10], buf[11], buf[12], buf[13], buf[14], buf[15], buf[16], buf[17],
    ]);
    let body_len = u32::from_be_bytes([buf[18], buf[19], buf[20], buf[21]]) as usize;
    if body_len > MAX_BODY_LEN {
        return Err(urtsp_err(format!("declared body of {} bytes", body_len)));
    }
    if buf.len() < HEADER_LEN + body_len {
        return Err(urtsp_err(format!(
            "body truncated: declared {}, have {}",
            body_len,
            buf.len() - HEADER_LEN
        )));
    }
    Ok((kind, sequence, timestamp, &buf[HEADER_LEN..HEADER_LEN + body_len]))
}

/// Bounds-checked sequential reader over a request/response body.
struct Cursor<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, at: 0 }
    }

    fn take(&mut self, n: usize, field: &str) -> Result<&'a [u8], CastError> {
        if self.buf.len() < self.at + n {
            return Err(urtsp_err(format!("truncated {} field", field)));
        }
        let slice = &self.buf[self.at..self.at + n];
        self.at += n;
        Ok(slice)
    }

    fn read_u32(&mut self, field: &str) -> Result<u32, CastError> {
        let b = self.take(4, field)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_u64(&mut self, field: &str) -> Result<u64, CastError> {
        let b = self.take(8, field)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    fn read_string(&mut self, field: &str) -> Result<String, CastError> {
        let len = self.read_u32(field)? as usize;
        let bytes = self.take(len, field)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| urtsp_err(format!("{} is not UTF-8", field)))
    }
}

fn urtsp_err(detail: String) -> CastError {
    CastError::Wire {
        format: "URTSP",
        detail,
    }
}
