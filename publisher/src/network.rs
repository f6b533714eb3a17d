//! UDP transport of the publisher.
//!
//! One socket carries RTP and RTCP from the publishing peer (RFC 5761
//! multiplexing). The same socket sends feedback back to the peer and
//! sorted RTP to the relay.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

/// Largest datagram accepted from the network.
pub const MAX_DATAGRAM: usize = 1500;

/// Shared UDP socket of a publisher session.
///
/// Cloning shares the socket; reads and writes may happen from
/// different tasks.
#[derive(Debug, Clone)]
pub struct PublisherSocket {
    socket: Arc<UdpSocket>,
}

impl PublisherSocket {
    // ---
    /// Binds the session socket.
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        // ---
        let socket = UdpSocket::bind(addr)
            .await
            .with_context(|| format!("failed to bind UDP socket to {addr}"))?;

        info!("Publisher socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("socket has no local address")
    }

    /// Receives the next datagram, copied out of `buf`.
    ///
    /// # Errors
    ///
    /// Returns error if network reception fails.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(Vec<u8>, SocketAddr)> {
        // ---
        let (len, src) = self
            .socket
            .recv_from(buf)
            .await
            .context("failed to receive UDP datagram")?;

        Ok((buf[..len].to_vec(), src))
    }

    /// Sends one datagram. Network errors are logged and swallowed: a
    /// lost send is recovered like any other loss.
    pub async fn send_to(&self, data: &[u8], addr: SocketAddr) {
        // ---
        match self.socket.send_to(data, addr).await {
            Ok(bytes) => debug!("Sent {} bytes to {}", bytes, addr),
            Err(e) => error!("Failed to send {} bytes to {}: {}", data.len(), addr, e),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[tokio::test]
    async fn test_socket_round_trip() {
        // ---
        let a = PublisherSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = PublisherSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        a.send_to(&[1, 2, 3], b.local_addr().unwrap()).await;

        let mut buf = [0u8; MAX_DATAGRAM];
        let (data, from) = b.recv(&mut buf).await.unwrap();
        assert_eq!(data, vec![1, 2, 3]);
        assert_eq!(from, a.local_addr().unwrap());
    }
}
