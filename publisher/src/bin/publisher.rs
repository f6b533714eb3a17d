//! SFU publisher - CLI binary.
//!
//! Receives RTP/RTCP from a publishing peer, sorts and repairs the
//! stream, sends feedback to the peer and relays the sorted packets.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use publisher::{publish_loop, JitterBufferConfig, PipelineOutputs, PublisherPipeline, PublisherSocket};
use sfu_common::{init_tracing, EndpointArgs, MetricsContext, MetricsServerConfig, SessionConfig, VideoCodec};

/// SFU publisher - ingest, repair and relay one publishing peer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Destination of the sorted stream
    #[arg(long, default_value = "127.0.0.1:6004")]
    relay: String,

    /// Video codec (h264 or vp8)
    #[arg(long, default_value = "h264")]
    codec: VideoCodec,

    /// Video SSRC
    #[arg(long, default_value = "1111")]
    video_ssrc: u32,

    /// Video payload type
    #[arg(long, default_value = "96")]
    video_pt: u8,

    /// RTX SSRC paired with the video stream
    #[arg(long)]
    rtx_ssrc: Option<u32>,

    /// RTX payload type
    #[arg(long, default_value = "97")]
    rtx_pt: u8,

    /// Audio SSRC (no audio stream when absent)
    #[arg(long)]
    audio_ssrc: Option<u32>,

    /// Audio payload type
    #[arg(long, default_value = "111")]
    audio_pt: u8,

    /// Fixed round-trip time hint in milliseconds (MCU window sizing)
    #[arg(long)]
    rtt_ms: Option<u64>,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.endpoint.color.into())?;
    info!("Starting SFU publisher v{VERSION}");

    let config = Arc::new(SessionConfig::from_env().context("invalid session configuration")?);
    info!("Mode: {:?}, video bitrate {:?}", config.mode, config.bitrates.video);

    let metrics = MetricsContext::new("publisher")?;
    let metrics_bind = args.endpoint.metrics_addr()?;
    info!("Metrics bind: {}", metrics_bind);
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let peer = args.endpoint.peer_addr()?;
    let relay = args.relay.parse().context("invalid --relay address")?;
    let socket = PublisherSocket::bind(args.endpoint.bind_addr()?)
        .await
        .context("failed to create publisher socket")?;

    let mut video = JitterBufferConfig::video(&config, args.codec, args.video_pt, args.video_ssrc);
    if let Some(rtx_ssrc) = args.rtx_ssrc {
        video = video.with_rtx(args.rtx_pt, rtx_ssrc);
    }
    let mut streams = vec![video];
    if let Some(audio_ssrc) = args.audio_ssrc {
        streams.push(JitterBufferConfig::audio(&config, args.audio_pt, audio_ssrc));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outputs, receivers) = PipelineOutputs::channel(&config);
    let pipeline = PublisherPipeline::spawn(
        &config,
        streams,
        outputs,
        shutdown_rx.clone(),
        Some(metrics),
    );
    if let Some(rtt_ms) = args.rtt_ms {
        pipeline.set_rtt(Duration::from_millis(rtt_ms));
    }

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down");
        shutdown_tx.send_replace(true);
    });

    info!("Ready to receive from {}", peer);
    publish_loop(socket, pipeline, receivers, peer, relay, shutdown_rx).await?;

    Ok(())
}
