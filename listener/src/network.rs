//! UDP transport of the listener.
//!
//! RTP arrives from the relay and RTCP from the listening peer on the same
//! socket. Media, RTX and sender reports leave through it towards the
//! peer.

use anyhow::{Context, Result};
use sfu_common::RtpPacket;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tracing::{debug, error, info};

/// Largest datagram accepted from the network.
pub const MAX_DATAGRAM: usize = 1500;

/// UDP socket of a listener session, with send statistics.
pub struct ListenerSocket {
    // ---
    socket: UdpSocket,
    peer: SocketAddr,
    packets_sent: u64,
    bytes_sent: u64,
}

impl ListenerSocket {
    // ---
    /// Binds the session socket.
    ///
    /// # Arguments
    ///
    /// * `bind` - Local address receiving relay RTP and peer RTCP
    /// * `peer` - Listening peer, destination of everything sent
    ///
    /// # Errors
    ///
    /// Returns error if socket binding fails.
    pub async fn bind(bind: SocketAddr, peer: SocketAddr) -> Result<Self> {
        // ---
        let socket = UdpSocket::bind(bind)
            .await
            .with_context(|| format!("failed to bind UDP socket to {bind}"))?;

        info!("Listener socket bound to {}", socket.local_addr()?);

        Ok(Self {
            socket,
            peer,
            packets_sent: 0,
            bytes_sent: 0,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.socket.local_addr().context("socket has no local address")
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
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

    /// Sends an RTP (or RTX) packet to the peer. Errors are logged only;
    /// the peer recovers the loss through NACK.
    pub async fn send_rtp(&mut self, p: &RtpPacket) {
        // ---
        if self.send(p.data()).await && self.packets_sent % 1000 == 0 {
            debug!(
                "Sent {} packets ({} bytes) - ssrc={:#010x} seq={}",
                self.packets_sent,
                self.bytes_sent,
                p.ssrc(),
                p.sequence()
            );
        }
    }

    /// Sends an RTCP datagram to the peer.
    pub async fn send_rtcp(&mut self, data: &[u8]) {
        // ---
        self.send(data).await;
    }

    /// Returns (packets, bytes) sent so far.
    pub fn stats(&self) -> (u64, u64) {
        (self.packets_sent, self.bytes_sent)
    }

    async fn send(&mut self, data: &[u8]) -> bool {
        // ---
        match self.socket.send_to(data, self.peer).await {
            Ok(bytes) => {
                self.packets_sent += 1;
                self.bytes_sent += bytes as u64;
                true
            }
            Err(e) => {
                error!("Failed to send {} bytes to {}: {}", data.len(), self.peer, e);
                false
            }
        }
    }
}
