//! Listener pipeline wiring.
//!
//! Per outbound stream a buffer actor and a sender-report actor; per
//! session one RTCP-context actor and one router that turns the feedback
//! of the listening peer into work for the buffers or events for the
//! collaborators upstream. Every hop is a bounded queue fed through
//! [`try_forward_counted`].
//!
//! ```text
//!  relay RTP --> buffer --+--> RTP / RTX (peer)
//!                  ^      +--> SR reporter --> RTCP SR (peer)
//!                  |
//!  peer RTCP --> RTCP context --> router --+--> ListenerEvent
//!                                 (NACK)---+
//! ```

use crate::jitter_buffer::{ListenerBuffer, ListenerStreamConfig};
use crate::remb::{RembController, REMB_TICK};
use crate::rtcp_context::{RtcpContext, RtcpInfo};
use crate::sender_report::{SenderReporter, SR_INTERVAL};
use sfu_common::rtcp::{self, RtcpPacket};
use sfu_common::{try_forward_counted, MetricsContext, RtpPacket, SessionConfig};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Current time as seen by the tokio clock.
pub fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Input of a buffer actor.
#[derive(Debug, Clone)]
pub enum ListenerInput {
    Rtp(RtpPacket),
    Retransmit { seqs: Vec<u16>, media_ssrc: u32 },
}

/// Notifications for the collaborators feeding this listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// The peer asked for a key frame (PLI or FIR)
    KeyFrameRequested { media_ssrc: u32 },

    BitrateChanged(u64),
    RoundTripTime(Duration),
}

/// Queues the pipeline writes to.
#[derive(Debug, Clone)]
pub struct ListenerOutputs {
    // ---
    /// Media and RTX packets for the peer
    pub rtp: mpsc::Sender<RtpPacket>,

    /// Sender reports for the peer
    pub rtcp: mpsc::Sender<RtcpPacket>,

    pub events: mpsc::Sender<ListenerEvent>,
}

/// Receiving ends of [`ListenerOutputs`].
#[derive(Debug)]
pub struct ListenerReceivers {
    pub rtp: mpsc::Receiver<RtpPacket>,
    pub rtcp: mpsc::Receiver<RtcpPacket>,
    pub events: mpsc::Receiver<ListenerEvent>,
}

impl ListenerOutputs {
    // ---
    pub fn channel(config: &SessionConfig) -> (Self, ListenerReceivers) {
        // ---
        let (rtp_tx, rtp_rx) = mpsc::channel(config.channel_capacity);
        let (rtcp_tx, rtcp_rx) = mpsc::channel(config.channel_capacity);
        let (events_tx, events_rx) = mpsc::channel(config.event_capacity);

        let outputs = Self {
            rtp: rtp_tx,
            rtcp: rtcp_tx,
            events: events_tx,
        };
        let receivers = ListenerReceivers {
            rtp: rtp_rx,
            rtcp: rtcp_rx,
            events: events_rx,
        };
        (outputs, receivers)
    }
}

/// Drives one listener buffer until shutdown or until its input closes.
pub async fn run_listener_buffer(
    mut buffer: ListenerBuffer,
    mut inputs: mpsc::Receiver<ListenerInput>,
    rtp_tx: mpsc::Sender<RtpPacket>,
    sent_tx: mpsc::Sender<RtpPacket>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Option<MetricsContext>,
) {
    // ---
    let metrics = metrics.as_ref();
    info!("Listener buffer task started for ssrc {:#010x}", buffer.ssrc());

    loop {
        let input = tokio::select! {
            _ = shutdown.changed() => break,
            input = inputs.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };

        match input {
            ListenerInput::Rtp(p) => {
                if let Some(p) = buffer.on_packet(p) {
                    try_forward_counted(&sent_tx, p.clone(), "SR input", metrics);
                    try_forward_counted(&rtp_tx, p, "listener RTP", metrics);
                }
            }
            ListenerInput::Retransmit { seqs, media_ssrc } => {
                for rtx in buffer.serve_retransmission(&seqs, media_ssrc) {
                    try_forward_counted(&rtp_tx, rtx, "listener RTP", metrics);
                }
            }
        }
    }

    debug!("Listener buffer for ssrc {:#010x} stopped", buffer.ssrc());
}

/// Drives one sender reporter, emitting an SR every [`SR_INTERVAL`].
pub async fn run_sender_reporter(
    mut reporter: SenderReporter,
    mut sent: mpsc::Receiver<RtpPacket>,
    rtcp_tx: mpsc::Sender<RtcpPacket>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Option<MetricsContext>,
) {
    // ---
    let mut ticker = interval(SR_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = sent.recv() => match packet {
                Some(p) => reporter.on_rtp(&p, now()),
                None => break,
            },
            _ = ticker.tick() => {
                if let Some(sr) = reporter.on_tick(now(), SystemTime::now()) {
                    try_forward_counted(&rtcp_tx, RtcpPacket::SenderReport(sr), "listener RTCP", metrics.as_ref());
                }
            }
        }
    }

    debug!(
        "Sender reporter for ssrc {:#010x} stopped after {} packets",
        reporter.ssrc(),
        reporter.packet_count()
    );
}

/// Drives the RTCP context: feedback as it arrives, a controller decision
/// every [`REMB_TICK`].
pub async fn run_rtcp_context(
    mut context: RtcpContext,
    mut feedback: mpsc::Receiver<RtcpPacket>,
    mut shutdown: watch::Receiver<bool>,
) {
    // ---
    let mut ticker = interval(REMB_TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            packet = feedback.recv() => match packet {
                Some(p) => context.push(p, now(), SystemTime::now()),
                None => break,
            },
            _ = ticker.tick() => context.on_tick(now()),
        }
    }

    debug!("RTCP context stopped at {} bits/s", context.bitrate());
}

/// Queue feeding the buffer of one stream.
#[derive(Debug, Clone)]
struct StreamRoute {
    ssrc: u32,
    inputs: mpsc::Sender<ListenerInput>,
}

/// Acts on [`RtcpInfo`]: NACKs go to the buffer owning the SSRC, the rest
/// becomes [`ListenerEvent`]s.
async fn run_info_router(
    mut infos: mpsc::Receiver<RtcpInfo>,
    routes: Vec<StreamRoute>,
    events: mpsc::Sender<ListenerEvent>,
    mut shutdown: watch::Receiver<bool>,
    metrics: Option<MetricsContext>,
) {
    // ---
    let metrics = metrics.as_ref();
    let event = |e: ListenerEvent| {
        try_forward_counted(&events, e, "listener event", metrics);
    };

    loop {
        let info = tokio::select! {
            _ = shutdown.changed() => break,
            info = infos.recv() => match info {
                Some(info) => info,
                None => break,
            },
        };

        match info {
            RtcpInfo::Nack(nack) => {
                match routes.iter().find(|r| r.ssrc == nack.media_ssrc) {
                    Some(route) => {
                        let input = ListenerInput::Retransmit {
                            seqs: nack.sequences(),
                            media_ssrc: nack.media_ssrc,
                        };
                        try_forward_counted(&route.inputs, input, "listener buffer input", metrics);
                    }
                    None => debug!("NACK for unknown ssrc {:#010x}", nack.media_ssrc),
                }
            }
            RtcpInfo::Pli(pli) => {
                info!("PLI from listener for {:#010x}", pli.media_ssrc);
                event(ListenerEvent::KeyFrameRequested {
                    media_ssrc: pli.media_ssrc,
                });
            }
            RtcpInfo::Fir(fir) => {
                for entry in fir.entries {
                    info!("FIR #{} from listener for {:#010x}", entry.seq_nr, entry.ssrc);
                    event(ListenerEvent::KeyFrameRequested {
                        media_ssrc: entry.ssrc,
                    });
                }
            }
            RtcpInfo::Remb(bitrate) => event(ListenerEvent::BitrateChanged(bitrate)),
            RtcpInfo::ReceiverReport { report, rtt } => {
                for block in &report.reports {
                    debug!(
                        "RR for {:#010x}: fraction lost {}/256, {} lost, jitter {}",
                        block.ssrc, block.fraction_lost, block.total_lost, block.jitter
                    );
                }
                if let Some(rtt) = rtt {
                    event(ListenerEvent::RoundTripTime(rtt));
                }
            }
        }
    }

    debug!("RTCP info router stopped");
}

/// Running listener pipeline for one listening peer.
pub struct ListenerPipeline {
    // ---
    routes: Vec<StreamRoute>,
    feedback: mpsc::Sender<RtcpPacket>,
    tasks: Vec<JoinHandle<()>>,
    metrics: Option<MetricsContext>,
}

impl ListenerPipeline {
    // ---
    /// Spawns the tasks of every stream plus the session feedback tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        config: &SessionConfig,
        streams: Vec<ListenerStreamConfig>,
        outputs: ListenerOutputs,
        shutdown: watch::Receiver<bool>,
        metrics: Option<MetricsContext>,
    ) -> Self {
        // ---
        let mut routes = Vec::with_capacity(streams.len());
        let mut tasks = Vec::with_capacity(streams.len() * 2 + 2);

        for stream in streams {
            let (inputs_tx, inputs_rx) = mpsc::channel(config.channel_capacity);
            let (sent_tx, sent_rx) = mpsc::channel(config.channel_capacity);
            routes.push(StreamRoute {
                ssrc: stream.ssrc,
                inputs: inputs_tx,
            });

            let reporter = SenderReporter::new(stream.ssrc, stream.clock_rate);
            let mut buffer = ListenerBuffer::new(stream, rand::random());
            if let Some(m) = &metrics {
                buffer = buffer.with_metrics(m.clone());
            }

            tasks.push(tokio::spawn(run_listener_buffer(
                buffer,
                inputs_rx,
                outputs.rtp.clone(),
                sent_tx,
                shutdown.clone(),
                metrics.clone(),
            )));
            tasks.push(tokio::spawn(run_sender_reporter(
                reporter,
                sent_rx,
                outputs.rtcp.clone(),
                shutdown.clone(),
                metrics.clone(),
            )));
        }

        let (feedback_tx, feedback_rx) = mpsc::channel(config.channel_capacity);
        let (info_tx, info_rx) = mpsc::channel(config.event_capacity);
        let controller = RembController::new(
            config.remb_algorithm,
            config.bitrates.video,
            config.remb_history,
        );
        let mut context = RtcpContext::new(controller, info_tx);
        if let Some(m) = &metrics {
            context = context.with_metrics(m.clone());
        }

        tasks.push(tokio::spawn(run_rtcp_context(
            context,
            feedback_rx,
            shutdown.clone(),
        )));
        tasks.push(tokio::spawn(run_info_router(
            info_rx,
            routes.clone(),
            outputs.events,
            shutdown,
            metrics.clone(),
        )));

        Self {
            routes,
            feedback: feedback_tx,
            tasks,
            metrics,
        }
    }

    /// Sends a packet from the relay to the buffer owning its SSRC.
    pub fn on_relay_rtp(&self, p: RtpPacket) {
        // ---
        match self.routes.iter().find(|r| r.ssrc == p.ssrc()) {
            Some(route) => {
                try_forward_counted(
                    &route.inputs,
                    ListenerInput::Rtp(p),
                    "listener buffer input",
                    self.metrics.as_ref(),
                );
            }
            None => {
                debug!("No listener stream for ssrc {:#010x}, dropping", p.ssrc());
                if let Some(m) = &self.metrics {
                    m.rtp_dropped_total.inc();
                }
            }
        }
    }

    /// Demultiplexes one datagram: RTCP is feedback from the peer, anything
    /// else is RTP from the relay.
    pub fn on_datagram(&self, data: Vec<u8>, received_at: Instant) {
        // ---
        if rtcp::is_rtcp_packet(&data) {
            self.on_peer_rtcp(&data);
            return;
        }

        match RtpPacket::parse(data, received_at) {
            Ok(p) => self.on_relay_rtp(p),
            Err(e) => {
                warn!("Dropping invalid RTP datagram: {}", e);
                if let Some(m) = &self.metrics {
                    m.rtp_dropped_total.inc();
                }
            }
        }
    }

    /// Parses a compound RTCP datagram from the peer and queues every
    /// packet read before an error.
    pub fn on_peer_rtcp(&self, data: &[u8]) {
        // ---
        let (packets, error) = rtcp::parse_compound(data);
        if let Some(e) = error {
            warn!("Malformed RTCP from listener: {}", e);
            if let Some(m) = &self.metrics {
                m.rtcp_malformed_total.inc();
            }
        }

        for packet in packets {
            if let Some(m) = &self.metrics {
                m.rtcp_parsed_total.with_label_values(&[packet.kind()]).inc();
            }
            try_forward_counted(&self.feedback, packet, "RTCP context input", self.metrics.as_ref());
        }
    }

    /// Waits for every task to stop. Dropping the inputs lets the tasks
    /// drain and end without a shutdown signal.
    pub async fn join(self) {
        // ---
        drop(self.routes);
        drop(self.feedback);
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Listener task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use sfu_common::rtcp::{Nack, Pli, Remb};

    const SSRC: u32 = 0x2222;
    const RTX_SSRC: u32 = 0x3333;

    fn audio_stream(config: &SessionConfig) -> ListenerStreamConfig {
        ListenerStreamConfig::audio(config, 111, SSRC, (112, RTX_SSRC))
    }

    #[tokio::test]
    async fn test_nack_from_peer_is_answered_with_rtx() {
        // ---
        let config = SessionConfig::default();
        let (outputs, mut receivers) = ListenerOutputs::channel(&config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline =
            ListenerPipeline::spawn(&config, vec![audio_stream(&config)], outputs, shutdown_rx, None);

        for seq in 1..=5u16 {
            pipeline.on_relay_rtp(RtpPacket::new(111, seq, seq as u32 * 960, SSRC, false, &[seq as u8]));
        }
        for _ in 1..=5 {
            receivers.rtp.recv().await.unwrap();
        }

        let mut nack = Nack::new(9, SSRC);
        nack.lost(3);
        pipeline.on_peer_rtcp(&RtcpPacket::Nack(nack).to_bytes());

        let rtx = receivers.rtp.recv().await.unwrap();
        assert_eq!(rtx.ssrc(), RTX_SSRC);
        assert_eq!(rtx.payload_type(), 112);
        assert_eq!(rtx.payload(), &[0, 3, 3]);

        pipeline.join().await;
    }

    #[tokio::test]
    async fn test_pli_becomes_key_frame_request() {
        // ---
        let config = SessionConfig::default();
        let (outputs, mut receivers) = ListenerOutputs::channel(&config);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline =
            ListenerPipeline::spawn(&config, vec![audio_stream(&config)], outputs, shutdown_rx, None);

        let pli = Pli {
            sender_ssrc: 9,
            media_ssrc: SSRC,
        };
        pipeline.on_peer_rtcp(&RtcpPacket::Pli(pli).to_bytes());

        assert_eq!(
            receivers.events.recv().await,
            Some(ListenerEvent::KeyFrameRequested { media_ssrc: SSRC })
        );
        pipeline.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_remb_changes_bitrate_and_sr_follows_traffic() {
        // ---
        let config = SessionConfig::default();
        let (outputs, mut receivers) = ListenerOutputs::channel(&config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let pipeline =
            ListenerPipeline::spawn(&config, vec![audio_stream(&config)], outputs, shutdown_rx, None);

        pipeline.on_relay_rtp(RtpPacket::new(111, 1, 960, SSRC, false, &[0; 10]));
        pipeline.on_peer_rtcp(&RtcpPacket::Remb(Remb::new(9, 1_000_000, vec![SSRC])).to_bytes());

        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert_eq!(
            receivers.events.recv().await,
            Some(ListenerEvent::BitrateChanged(960_000))
        );
        let sr = match receivers.rtcp.recv().await.unwrap() {
            RtcpPacket::SenderReport(sr) => sr,
            other => panic!("unexpected {other}"),
        };
        assert_eq!(sr.ssrc, SSRC);
        assert_eq!(sr.sender_info.packet_count, 1);
        assert_eq!(sr.sender_info.octet_count, 10);

        shutdown_tx.send_replace(true);
        pipeline.join().await;
    }
}
