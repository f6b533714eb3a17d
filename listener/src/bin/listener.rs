//! SFU listener - CLI binary.
//!
//! Receives the relayed stream, delivers it to one listening peer and
//! serves that peer's feedback (NACK, PLI/FIR, REMB, RR).

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use listener::{listen_loop, ListenerOutputs, ListenerPipeline, ListenerSocket, ListenerStreamConfig};
use sfu_common::{init_tracing, EndpointArgs, MetricsContext, MetricsServerConfig, SessionConfig, VideoCodec};

/// SFU listener - deliver a relayed stream to one peer
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    #[command(flatten)]
    endpoint: EndpointArgs,

    /// Video codec (h264 or vp8)
    #[arg(long, default_value = "h264")]
    codec: VideoCodec,

    /// Outbound video SSRC
    #[arg(long, default_value = "2222")]
    video_ssrc: u32,

    /// Video payload type
    #[arg(long, default_value = "96")]
    video_pt: u8,

    /// RTX SSRC for video retransmissions
    #[arg(long, default_value = "2223")]
    rtx_ssrc: u32,

    /// RTX payload type
    #[arg(long, default_value = "97")]
    rtx_pt: u8,

    /// Outbound audio SSRC (no audio stream when absent)
    #[arg(long)]
    audio_ssrc: Option<u32>,

    /// Audio payload type
    #[arg(long, default_value = "111")]
    audio_pt: u8,

    /// RTX SSRC for audio retransmissions (audio SSRC + 1 when absent)
    #[arg(long)]
    audio_rtx_ssrc: Option<u32>,

    /// Audio RTX payload type
    #[arg(long, default_value = "112")]
    audio_rtx_pt: u8,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.endpoint.color.into())?;
    info!("Starting SFU listener v{VERSION}");

    let config = SessionConfig::from_env().context("invalid session configuration")?;
    info!(
        "REMB algorithm {:?}, video bitrate {:?}",
        config.remb_algorithm, config.bitrates.video
    );

    let metrics = MetricsContext::new("listener")?;
    let metrics_bind = args.endpoint.metrics_addr()?;
    info!("Metrics bind: {}", metrics_bind);
    let _metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let socket = ListenerSocket::bind(args.endpoint.bind_addr()?, args.endpoint.peer_addr()?)
        .await
        .context("failed to create listener socket")?;

    let mut streams = vec![ListenerStreamConfig::video(
        &config,
        args.codec,
        args.video_pt,
        args.video_ssrc,
        (args.rtx_pt, args.rtx_ssrc),
    )];
    if let Some(audio_ssrc) = args.audio_ssrc {
        let audio_rtx_ssrc = args.audio_rtx_ssrc.unwrap_or(audio_ssrc.wrapping_add(1));
        streams.push(ListenerStreamConfig::audio(
            &config,
            args.audio_pt,
            audio_ssrc,
            (args.audio_rtx_pt, audio_rtx_ssrc),
        ));
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (outputs, receivers) = ListenerOutputs::channel(&config);
    let pipeline = ListenerPipeline::spawn(
        &config,
        streams,
        outputs,
        shutdown_rx.clone(),
        Some(metrics),
    );

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for Ctrl-C: {}", e);
            return;
        }
        info!("Shutting down");
        shutdown_tx.send_replace(true);
    });

    listen_loop(socket, pipeline, receivers, shutdown_rx).await?;

    Ok(())
}
