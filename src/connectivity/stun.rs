//! STUN binding request (RFC 5389) over an already connected socket
//!
//! The socket must be bound to the mapped local port: the XOR-MAPPED-ADDRESS
//! in the answer is then the public address:port of the mapping itself.
//! Over UDP the message is one datagram; over TCP it is framed by the
//! 20-byte STUN header, whose length field gives the attribute bytes.

use super::types::MappingError;
use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use stun::agent::TransactionId;
use stun::message::{Getter, Message, BINDING_REQUEST, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

/// Size of the fixed STUN message header
pub(crate) const STUN_HEADER_LEN: usize = 20;

/// Largest response we accept
const MAX_STUN_MESSAGE: usize = 1500;

/// A connected socket that can carry one STUN request/response
#[async_trait]
pub trait StunTransport: Send {
    /// Send `request` and return the raw bytes of the next STUN message
    async fn round_trip(&mut self, request: &[u8]) -> io::Result<Vec<u8>>;
}

#[async_trait]
impl StunTransport for UdpSocket {
    async fn round_trip(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        self.send(request).await?;
        let mut buf = vec![0u8; MAX_STUN_MESSAGE];
        let n = self.recv(&mut buf).await?;
        buf.truncate(n);
        Ok(buf)
    }
}

#[async_trait]
impl StunTransport for TcpStream {
    async fn round_trip(&mut self, request: &[u8]) -> io::Result<Vec<u8>> {
        self.write_all(request).await?;

        let mut header = [0u8; STUN_HEADER_LEN];
        self.read_exact(&mut header).await?;
        let body_len = u16::from_be_bytes([header[2], header[3]]) as usize;
        if STUN_HEADER_LEN + body_len > MAX_STUN_MESSAGE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("STUN message too large: {} bytes", body_len),
            ));
        }

        let mut message = header.to_vec();
        message.resize(STUN_HEADER_LEN + body_len, 0);
        self.read_exact(&mut message[STUN_HEADER_LEN..]).await?;
        Ok(message)
    }
}

fn stun_error(context: &str, err: impl std::fmt::Display) -> MappingError {
    MappingError::Discovery(format!("{}: {}", context, err))
}

/// Perform one binding request and return the reflected address
pub async fn get_mapped_address<T: StunTransport + ?Sized>(
    conn: &mut T,
    timeout: Duration,
) -> Result<SocketAddr, MappingError> {
    let mut request = Message::new();
    request
        .build(&[Box::new(TransactionId::new()), Box::new(BINDING_REQUEST)])
        .map_err(|e| stun_error("Failed to build STUN request", e))?;

    let raw = tokio::time::timeout(timeout, conn.round_trip(&request.raw))
        .await
        .map_err(|_| MappingError::Timeout)?
        .map_err(|e| stun_error("STUN round trip failed", e))?;

    let mut response = Message::new();
    response.raw = raw;
    response
        .decode()
        .map_err(|e| stun_error("Failed to decode STUN response", e))?;

    if response.transaction_id != request.transaction_id {
        return Err(MappingError::InvalidResponse(
            "STUN transaction id mismatch".to_string(),
        ));
    }
    if response.typ != BINDING_SUCCESS {
        return Err(MappingError::InvalidResponse(format!(
            "Unexpected STUN message type: {}",
            response.typ
        )));
    }

    let mut xor_addr = XorMappedAddress::default();
    xor_addr
        .get_from(&response)
        .map_err(|e| stun_error("Missing XOR-MAPPED-ADDRESS", e))?;

    let mapped = SocketAddr::new(xor_addr.ip, xor_addr.port);
    debug!("STUN mapped address: {}", mapped);
    Ok(mapped)
}
