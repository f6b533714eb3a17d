//! Publisher pipeline wiring.
//!
//! Each inbound stream gets two tasks: a jitter-buffer actor and a
//! receiver-report actor. They own their state exclusively and talk to
//! the rest of the session through bounded queues only; every send goes
//! through [`try_forward_counted`] and drops when the queue is full.
//!
//! ```text
//!             +--> jitter buffer --+--> sorted RTP  (relay)
//!  datagram --+                    +--> RTCP NACK/PLI/REMB (peer)
//!   (demux)   |                    +--> JitterEvent (collaborators)
//!             +--> RR reporter ------> RTCP RR (peer)
//! ```

use crate::jitter_buffer::{JitterBuffer, JitterBufferConfig, JitterEvent, JitterOutput};
use crate::receiver_report::{ReceiverReporter, RR_INTERVAL};
use sfu_common::rtcp::{self, RtcpPacket, SenderReport};
use sfu_common::{try_forward_counted, MetricsContext, RtpPacket, SessionConfig};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Resolution of the jitter buffer timers (loss scan, pacing, PLI retry).
pub const TICK: Duration = Duration::from_millis(5);

/// SSRC the publisher uses as sender of its receiver reports.
pub const REPORTER_SSRC: u32 = 1;

/// Current time as seen by the tokio clock, so paused-time tests drive
/// the synchronous cores too.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Input of the receiver-report actor.
#[derive(Debug, Clone)]
pub enum ReporterInput {
    Rtp(RtpPacket),
    SenderReport(SenderReport),
}

/// Queues the pipeline writes to.
#[derive(Debug, Clone)]
pub struct PipelineOutputs {
    // ---
    /// Sorted packets for the relay
    pub rtp: mpsc::Sender<RtpPacket>,

    /// Feedback for the publishing peer
    pub rtcp: mpsc::Sender<RtcpPacket>,

    pub events: mpsc::Sender<JitterEvent>,
}

/// Receiving ends of [`PipelineOutputs`].
#[derive(Debug)]
pub struct PipelineReceivers {
    pub rtp: mpsc::Receiver<RtpPacket>,
    pub rtcp: mpsc::Receiver<RtcpPacket>,
    pub events: mpsc::Receiver<JitterEvent>,
}

impl PipelineOutputs {
    // ---
    pub fn channel(config: &SessionConfig) -> (Self, PipelineReceivers) {
        // ---
        let (rtp_tx, rtp_rx) = mpsc::channel(config.channel_capacity);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(config.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);

        let outputs = Self {
            rtp: rtp_tx,
            rtcp: rtcp_tx,
            events: events_tx,
        };
        let receivers = PipelineReceivers {
            rtp: rtp_rx,
            rtcp: rtcp_rx,
            events: events_rx,
        };
        (outputs, receivers)
    }
}

/// Drives one jitter buffer until shutdown or until its input closes.
///
/// # Arguments
///
/// * `jb` - Buffer for one media SSRC (and its RTX SSRC)
/// * `packets` - Raw RTP demultiplexed for this stream
/// * `outputs` - Where sorted RTP, RTCP and events go
/// * `rtt` - Latest round-trip time sample, if any
/// * `shutdown` - Session cancellation signal
/// * `metrics` - Counts full-queue drops
pub async fn run_jitter_buffer(
    mut jb: JitterBuffer,
    mut packets: mpsc::Receiver<RtpPacket>,
    outputs: PipelineOutputs,
    mut rtt: watch::Receiver<Option<Duration>>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Option<MetricsContext>,
) {
    // ---
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut rtt_open = true;
    info!("Jitter buffer task started for ssrc {:#010x}", jb.ssrc());

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = packets.recv() => match packet {
                Some(p) => jb.on_packet(p, now()),
                None => break,
            },
            _ = ticker.tick() => jb.on_tick(now()),
            changed = rtt.changed(), if rtt_open => {
                if changed.is_err() {
                    debug!("RTT source closed");
                    rtt_open = false;
                    continue;
                }
                let sample = *rtt.borrow_and_update();
                if let Some(sample) = sample {
                    jb.set_rtt(sample);
                }
            }
        }

        while let Some(output) = jb.poll_output() {
            dispatch(output, &outputs, metrics.as_ref());
        }
    }

    info!(
        "Jitter buffer task for ssrc {:#010x} stopped ({} key frame requests after loss)",
        jb.ssrc(),
        jb.packet_loss()
    );
}

fn dispatch(output: JitterOutput, outputs: &PipelineOutputs, metrics: Option<&MetricsContext>) {
    // ---
    match output {
        JitterOutput::Rtp(p) => {
            try_forward_counted(&outputs.rtp, p, "sorted RTP", metrics);
        }
        JitterOutput::Rtcp(p) => {
            try_forward_counted(&outputs.rtcp, p, "publisher RTCP", metrics);
        }
        JitterOutput::Event(e) => {
            try_forward_counted(&outputs.events, e, "jitter event", metrics);
        }
    }
}

/// Drives one receiver reporter, emitting an RR every [`RR_INTERVAL`].
pub async fn run_receiver_reporter(
    mut reporter: ReceiverReporter,
    mut inputs: mpsc::Receiver<ReporterInput>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Option<MetricsContext>,
) {
    // ---
    let mut ticker = interval(RR_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            input = inputs.recv() => match input {
                Some(ReporterInput::Rtp(p)) => {
                    if let Some(stats) = reporter.on_rtp(&p) {
                        debug!(
                            "Frame D = {} J = {} for ssrc {:#010x}",
                            stats.interarrival_difference, stats.interarrival_jitter, stats.ssrc
                        );
                    }
                }
                Some(ReporterInput::SenderReport(sr)) => reporter.on_sender_report(&sr, now()),
                None => break,
            },
            _ = ticker.tick() => {
                let Some(rr) = reporter.on_tick(now()) else {
                    continue;
                };
                if let Some(m) = &metrics {
                    m.interarrival_jitter_seconds.observe(reporter.jitter_seconds());
                }
                try_forward_counted(&rtcp_tx, RtcpPacket::ReceiverReport(rr), "publisher RTCP", metrics.as_ref());
            }
        }
    }

    debug!("Receiver reporter for ssrc {:#010x} stopped", reporter.media_ssrc());
}

/// Queues feeding the tasks of one stream.
#[derive(Debug)]
struct StreamRoute {
    // ---
    media_ssrc: u32,
    rtx_ssrc: Option<u32>,
    packets: mpsc::Sender<RtpPacket>,
    reports: mpsc::Sender<ReporterInput>,
}

/// Running publisher pipeline for one publishing peer.
pub struct PublisherPipeline {
    // ---
    routes: Vec<StreamRoute>,
    rtt_tx: watch::Sender<Option<Duration>>,
    tasks: Vec<JoinHandle<()>>,
    metrics: Option<MetricsContext>,
}

impl PublisherPipeline {
    // ---
    /// Spawns the tasks of every stream.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        config: &SessionConfig,
        streams: Vec<JitterBufferConfig>,
        outputs: PipelineOutputs,
        shutdown: watch::Receiver<bool>,
        metrics: Option<MetricsContext>,
    ) -> Self {
        // ---
        let (rtt_tx, rtt_rx) = watch::channel(None);
        let epoch = now();
        let mut routes = Vec::with_capacity(streams.len());
        let mut tasks = Vec::with_capacity(streams.len() * 2);

        for stream in streams {
            let (packets_tx, packets_rx) = mpsc::channel(config.channel_capacity);
            let (reports_tx, reports_rx) = mpsc::channel(config.channel_capacity);

            routes.push(StreamRoute {
                media_ssrc: stream.ssrc,
                rtx_ssrc: stream.rtx.map(|rtx| rtx.ssrc),
                packets: packets_tx,
                reports: reports_tx,
            });

            let reporter =
                ReceiverReporter::new(stream.ssrc, REPORTER_SSRC, stream.clock_rate, epoch);
            let mut jb = JitterBuffer::new(stream, epoch);
            if let Some(m) = &metrics {
                jb = jb.with_metrics(m.clone());
            }

            tasks.push(tokio::spawn(run_jitter_buffer(
                jb,
                packets_rx,
                outputs.clone(),
                rtt_rx.clone(),
                shutdown.clone(),
                metrics.clone(),
            )));
            tasks.push(tokio::spawn(run_receiver_reporter(
                reporter,
                reports_rx,
                outputs.rtcp.clone(),
                shutdown.clone(),
                metrics.clone(),
            )));
        }

        Self {
            routes,
            rtt_tx,
            tasks,
            metrics,
        }
    }

    /// Publishes a round-trip time sample to every jitter buffer.
    pub fn set_rtt(&self, rtt: Duration) {
        self.rtt_tx.send_replace(Some(rtt));
    }

    /// Demultiplexes one decrypted datagram from the publishing peer.
    pub fn on_datagram(&self, data: Vec<u8>, received_at: Instant) {
        // ---
        if rtcp::is_rtcp_packet(&data) {
            self.on_rtcp(&data, received_at);
            return;
        }

        let p = match RtpPacket::parse(data, received_at) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping invalid RTP datagram: {}", e);
                if let Some(m) = &self.metrics {
                    m.rtp_dropped_total.inc();
                }
                return;
            }
        };
        self.route_rtp(p);
    }

    /// Sends `p` to the stream owning its SSRC.
    pub fn route_rtp(&self, p: RtpPacket) {
        // ---
        let ssrc = p.ssrc();
        let metrics = self.metrics.as_ref();

        if let Some(route) = self.routes.iter().find(|r| r.media_ssrc == ssrc) {
            try_forward_counted(&route.reports, ReporterInput::Rtp(p.clone()), "RR input", metrics);
            try_forward_counted(&route.packets, p, "jitter buffer input", metrics);
        } else if let Some(route) = self.routes.iter().find(|r| r.rtx_ssrc == Some(ssrc)) {
            try_forward_counted(&route.packets, p, "jitter buffer input", metrics);
        } else {
            debug!("No stream for ssrc {:#010x}, dropping packet", ssrc);
            if let Some(m) = &self.metrics {
                m.rtp_dropped_total.inc();
            }
        }
    }

    fn on_rtcp(&self, data: &[u8], received_at: Instant) {
        // ---
        let (packets, error) = rtcp::parse_compound(data);
        if let Some(e) = error {
            warn!("Malformed RTCP from publisher: {}", e);
            if let Some(m) = &self.metrics {
                m.rtcp_malformed_total.inc();
            }
        }

        for packet in packets {
            if let Some(m) = &self.metrics {
                m.rtcp_parsed_total.with_label_values(&[packet.kind()]).inc();
            }
            match packet {
                RtcpPacket::SenderReport(sr) => {
                    match self.routes.iter().find(|r| r.media_ssrc == sr.ssrc) {
                        Some(route) => {
                            try_forward_counted(
                                &route.reports,
                                ReporterInput::SenderReport(sr),
                                "RR input",
                                self.metrics.as_ref(),
                            );
                        }
                        None => debug!("SR for unknown ssrc {:#010x}", sr.ssrc),
                    }
                }
                RtcpPacket::Goodbye(bye) => info!("Publisher said goodbye: {}", bye),
                other => debug!("Ignoring publisher RTCP {} at {:?}", other, received_at),
            }
        }
    }

    /// Waits for every task to stop. Closes the stream inputs first so the
    /// tasks also end without a shutdown signal.
    pub async fn join(self) {
        // ---
        drop(self.routes);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Publisher task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::jitter_buffer::StreamKind;
    use sfu_common::keyframe::VideoCodec;
    use sfu_common::rtcp::SenderInfo;

    const SSRC: u32 = 0x1234;

    fn video_stream(config: &SessionConfig) -> JitterBufferConfig {
        JitterBufferConfig::video(config, VideoCodec::H264, 96, SSRC).with_rtx(97, 0x5678)
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_forwards_sorted_rtp() {
        // ---
        let config = SessionConfig::default();
        let (outputs, mut receivers) = PipelineOutputs::channel(&config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline =
            PublisherPipeline::spawn(&config, vec![video_stream(&config)], outputs, shutdown_rx, None);

        for seq in [1u16, 3, 2] {
            let nal = if seq == 1 { 0x78 } else { 0x41 };
            let p = RtpPacket::new(96, seq, seq as u32 * 3000, SSRC, true, &[nal, 0, 0]);
            pipeline.on_datagram(p.into_data(), now());
        }

        let mut seqs = Vec::new();
        for _ in 0..3 {
            let p = receivers.rtp.recv().await.unwrap();
            seqs.push(p.sequence());
        }
        assert_eq!(seqs, vec![1, 2, 3]);

        pipeline.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_receiver_report_follows_sender_report() {
        // ---
        let config = SessionConfig::default();
        let (outputs, mut receivers) = PipelineOutputs::channel(&config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline =
            PublisherPipeline::spawn(&config, vec![video_stream(&config)], outputs, shutdown_rx, None);

        let sr = SenderReport {
            ssrc: SSRC,
            sender_info: SenderInfo::default(),
            reports: Vec::new(),
        };
        pipeline.on_datagram(sr.to_bytes(), now());
        for seq in 0..10u16 {
            let p = RtpPacket::new(96, seq, seq as u32 * 3000, SSRC, false, &[0x78]);
            pipeline.on_datagram(p.into_data(), now());
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let rr = loop {
            match receivers.rtcp.recv().await.unwrap() {
                RtcpPacket::ReceiverReport(rr) => break rr,
                _ => continue,
            }
        };
        assert_eq!(rr.ssrc, REPORTER_SSRC);
        assert_eq!(rr.reports[0].ssrc, SSRC);

        shutdown_tx.send_replace(true);
        pipeline.join().await;
    }

    #[tokio::test]
    async fn test_unknown_ssrc_is_dropped() {
        // ---
        let config = SessionConfig::default();
        let (outputs, mut receivers) = PipelineOutputs::channel(&config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let stream = JitterBufferConfig::audio(&config, 111, SSRC);
        assert_eq!(stream.kind, StreamKind::Audio);
        let pipeline = PublisherPipeline::spawn(&config, vec![stream], outputs, shutdown_rx, None);

        let p = RtpPacket::new(111, 1, 0, 0xDEAD, true, &[1]);
        pipeline.on_datagram(p.into_data(), now());
        pipeline.join().await;

        assert!(receivers.rtp.try_recv().is_err());
    }
}
