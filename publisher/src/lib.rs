//! SFU publisher library.
//!
//! Ingests RTP/RTCP from a publishing peer, restores packet order, repairs
//! losses with NACK and PLI feedback, estimates the sustainable video
//! bitrate and forwards the sorted stream to the relay.

pub mod jitter_buffer;
pub mod nack;
pub mod network;
pub mod pipeline;
pub mod receiver_report;

pub use jitter_buffer::{
    JitterBuffer, JitterBufferConfig, JitterEvent, JitterOutput, RtxParams, State, StreamKind,
};
pub use network::PublisherSocket;
pub use pipeline::{PipelineOutputs, PipelineReceivers, PublisherPipeline};
pub use receiver_report::ReceiverReporter;

use anyhow::Result;
use sfu_common::rtcp::{compound_bytes, RtcpPacket};
use std::net::SocketAddr;
use tokio::sync::watch;
use tracing::{debug, info};

/// RTCP packets sent back to the peer in one compound datagram at most.
const MAX_RTCP_BATCH: usize = 16;

/// Runs the publisher I/O loop until shutdown.
///
/// Datagrams read from `socket` feed the pipeline; sorted RTP goes to
/// `relay` and RTCP feedback to `peer`, several queued RTCP packets
/// being sent as one compound datagram.
///
/// # Arguments
///
/// * `socket` - Session socket shared with the peer
/// * `pipeline` - Running publisher pipeline
/// * `receivers` - Receiving ends of the pipeline outputs
/// * `peer` - Publishing peer (RTCP feedback destination)
/// * `relay` - Destination of the sorted stream
/// * `shutdown` - Session cancellation signal
///
/// # Errors
///
/// Returns error if network reception fails.
pub async fn publish_loop(
    socket: PublisherSocket,
    pipeline: PublisherPipeline,
    mut receivers: PipelineReceivers,
    peer: SocketAddr,
    relay: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    // ---
    let mut buf = vec![0u8; network::MAX_DATAGRAM];
    info!("Publishing from {} to relay {}", peer, relay);

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            received = socket.recv(&mut buf) => match received {
                Ok((data, from)) => {
                    if from != peer {
                        debug!("Datagram from unexpected source {}", from);
                    }
                    pipeline.on_datagram(data, pipeline::now());
                }
                Err(e) => break Err(e),
            },
            Some(p) = receivers.rtp.recv() => socket.send_to(p.data(), relay).await,
            Some(first) = receivers.rtcp.recv() => {
                let batch = drain_rtcp(first, &mut receivers.rtcp);
                socket.send_to(&compound_bytes(&batch), peer).await;
            }
            Some(event) = receivers.events.recv() => info!("Jitter buffer event: {:?}", event),
        }
    };

    pipeline.join().await;
    info!("Publisher loop stopped");
    result
}

fn drain_rtcp(
    first: RtcpPacket,
    rx: &mut tokio::sync::mpsc::Receiver<RtcpPacket>,
) -> Vec<RtcpPacket> {
    // ---
    let mut batch = vec![first];
    while batch.len() < MAX_RTCP_BATCH {
        match rx.try_recv() {
            Ok(p) => batch.push(p),
            Err(_) => break,
        }
    }
    batch
}
