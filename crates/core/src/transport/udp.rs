use std::net::UdpSocket;
use std::sync::Arc;

use crate::error::Result;

/// UDP transport for outbound RTP delivery.
///
/// Binds a single ephemeral socket (`0.0.0.0:0`) shared by every
/// pacing engine. This layer is deliberately address-only — it knows
/// nothing about sessions or streamers; callers resolve destinations
/// before sending.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
}

impl UdpTransport {
    /// Bind an ephemeral UDP socket for outbound RTP.
    pub fn bind() -> Result<Self> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Shared handle for a pacing engine.
    pub fn socket(&self) -> Arc<UdpSocket> {
        self.socket.clone()
    }
}
