//! SFU listener library.
//!
//! Delivers the relayed stream to one listening peer: gates video on a key
//! frame, answers NACKs with RTX packets from a cache of recent packets,
//! sends sender reports and turns REMB feedback into a target bitrate for
//! the upstream encoder.

pub mod jitter_buffer;
pub mod network;
pub mod pipeline;
pub mod remb;
pub mod rtcp_context;
pub mod sender_report;

pub use jitter_buffer::{ListenerBuffer, ListenerStreamConfig, PacketCache};
pub use network::ListenerSocket;
pub use pipeline::{ListenerEvent, ListenerOutputs, ListenerPipeline, ListenerReceivers};
pub use remb::RembController;
pub use rtcp_context::{RtcpContext, RtcpInfo};
pub use sender_report::SenderReporter;

use anyhow::Result;
use sfu_common::rtcp::{compound_bytes, RtcpPacket};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// RTCP packets sent to the peer in one compound datagram at most.
const MAX_RTCP_BATCH: usize = 16;

/// Runs the listener I/O loop until shutdown.
///
/// # Arguments
///
/// * `socket` - Session socket (relay RTP in, peer RTCP in, media out)
/// * `pipeline` - Running listener pipeline
/// * `receivers` - Receiving ends of the pipeline outputs
/// * `shutdown` - Session cancellation signal
///
/// # Errors
///
/// Returns error if network reception fails.
pub async fn listen_loop(
    mut socket: ListenerSocket,
    pipeline: ListenerPipeline,
    mut receivers: ListenerReceivers,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    // ---
    let mut buf = vec![0u8; network::MAX_DATAGRAM];
    info!("Delivering to listener {}", socket.peer());

    let result = loop {
        tokio::select! {
            _ = shutdown.changed() => break Ok(()),
            received = socket.recv(&mut buf) => match received {
                Ok((data, from)) => {
                    debug!("{} bytes from {}", data.len(), from);
                    pipeline.on_datagram(data, pipeline::now());
                }
                Err(e) => break Err(e),
            },
            Some(p) = receivers.rtp.recv() => socket.send_rtp(&p).await,
            Some(first) = receivers.rtcp.recv() => {
                let batch = drain_rtcp(first, &mut receivers.rtcp);
                socket.send_rtcp(&compound_bytes(&batch)).await;
            }
            Some(event) = receivers.events.recv() => info!("Listener event: {:?}", event),
        }
    };

    pipeline.join().await;
    let (packets, bytes) = socket.stats();
    info!("Listener loop stopped after {} datagrams ({} bytes)", packets, bytes);
    result
}

fn drain_rtcp(first: RtcpPacket, rx: &mut mpsc::Receiver<RtcpPacket>) -> Vec<RtcpPacket> {
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
