//! Publisher-side jitter buffer.
//!
//! Ingests raw RTP from a publishing peer, restores sequence order, detects
//! loss and escalates NACK to PLI, adapts the video bitrate estimate and
//! releases sorted packets paced against the newest received packet.
//!
//! The buffer is a synchronous state machine: every input carries the
//! current `Instant`, and every effect (sorted RTP, RTCP feedback, events)
//! is queued as a [`JitterOutput`] for the owning task to dispatch. The
//! async wrapper lives in [`crate::pipeline`].
//!
//! ```text
//!   WaitingKeyFrame --key frame--> FindingFirstSequence --window--> Streaming
//!          ^                                                            |
//!          +------------------- NACKs exhausted (PLI) -----------------+
//! ```

use crate::nack::{Escalation, NackTable};
use sfu_common::config::{Bitrate, Mode, SessionConfig};
use sfu_common::cycle::{CycleRule, CycleTracker};
use sfu_common::keyframe::{vp8_picture_id, VideoCodec};
use sfu_common::rtcp::{Nack, Pli, Remb, RtcpPacket};
use sfu_common::rtp::wire_seq;
use sfu_common::store::SortedStore;
use sfu_common::{MetricsContext, RtpPacket};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Extra delay granted to reordered packets before they count as lost.
pub const REORDER_MAX_DELAY: Duration = Duration::from_millis(100);

/// Added to the reorder delay before a missing packet is NACKed.
const NACK_GRACE: Duration = Duration::from_millis(10);

/// Interval between PLI retries while waiting for a key frame.
pub const PLI_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// Cadence of the delay/bitrate monitor and the RTT average.
const MONITOR_INTERVAL: Duration = Duration::from_secs(1);

const FPS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Audio gap after which the unsorted buffer is flushed with holes.
const AUDIO_STALL: Duration = Duration::from_millis(50);

/// Loss-scan period used until an average packet interval is known.
const DEFAULT_SCAN_INTERVAL: Duration = Duration::from_millis(20);

/// Media carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Audio,
    Video(VideoCodec),
}

/// RTX stream paired with a media stream (RFC 4588).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtxParams {
    pub payload_type: u8,
    pub ssrc: u32,
}

/// Static parameters of one publisher stream.
#[derive(Debug, Clone)]
pub struct JitterBufferConfig {
    // ---
    pub kind: StreamKind,
    pub payload_type: u8,
    pub ssrc: u32,
    pub rtx: Option<RtxParams>,
    pub clock_rate: u32,

    /// Video bitrate bounds driving REMB feedback
    pub bitrate: Bitrate,

    pub mode: Mode,
}

impl JitterBufferConfig {
    // ---
    pub fn audio(config: &SessionConfig, payload_type: u8, ssrc: u32) -> Self {
        // ---
        Self {
            kind: StreamKind::Audio,
            payload_type,
            ssrc,
            rtx: None,
            clock_rate: config.audio_clock_rate,
            bitrate: config.bitrates.audio,
            mode: config.mode,
        }
    }

    pub fn video(config: &SessionConfig, codec: VideoCodec, payload_type: u8, ssrc: u32) -> Self {
        // ---
        Self {
            kind: StreamKind::Video(codec),
            payload_type,
            ssrc,
            rtx: None,
            clock_rate: config.video_clock_rate,
            bitrate: config.bitrates.video,
            mode: config.mode,
        }
    }

    pub fn with_rtx(mut self, payload_type: u8, ssrc: u32) -> Self {
        self.rtx = Some(RtxParams { payload_type, ssrc });
        self
    }

    fn is_video(&self) -> bool {
        matches!(self.kind, StreamKind::Video(_))
    }
}

/// Notifications for collaborators outside the media path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JitterEvent {
    /// New video bitrate target (bits/s), already announced by REMB
    BitrateChanged(u64),

    /// Buffering window adopted from the RTT average (MCU mode)
    SetJitterSize(Duration),
}

/// Effect produced by the jitter buffer.
#[derive(Debug, Clone)]
pub enum JitterOutput {
    /// Sorted packet for the relay / transcoder
    Rtp(RtpPacket),

    /// Feedback for the publishing peer
    Rtcp(RtcpPacket),

    Event(JitterEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    WaitingKeyFrame,
    FindingFirstSequence { since: Instant },
    Streaming,
}

/// Publisher jitter buffer for one media SSRC.
pub struct JitterBuffer {
    // ---
    config: JitterBufferConfig,
    state: State,
    cycles: CycleTracker,
    store: SortedStore,
    nacks: NackTable,
    outputs: VecDeque<JitterOutput>,
    metrics: Option<MetricsContext>,

    /// Reference for arrival times in clock units
    epoch: Instant,

    /// Next extended sequence expected in the sorted store
    in_seq: Option<u64>,

    /// Highest extended sequence received
    last_in: Option<RtpPacket>,

    /// Extended sequence of the next packet released downstream
    out_seq: Option<u64>,

    window: Duration,
    video_bitrate: u64,

    // arrival-delay accounting, clock units
    prev_arrival: Option<(i64, i64)>,
    cumul_delay: i64,
    cumul_delay_at: Option<Instant>,

    rtt: Option<Duration>,
    avg_rtt: Duration,
    rtt_count: u32,

    // VP8 picture batching
    picture_id: Option<u16>,
    last_picture_id: Option<u16>,
    frame: Vec<RtpPacket>,
    fps: u32,

    // timers
    next_scan: Instant,
    next_monitor: Instant,
    next_fps_log: Instant,
    pli_retry_at: Option<Instant>,

    packet_loss: u64,
}

impl JitterBuffer {
    // ---
    /// Creates a buffer. Video starts waiting for a key frame, audio goes
    /// straight to finding its first sequence.
    pub fn new(config: JitterBufferConfig, now: Instant) -> Self {
        // ---
        let state = if config.is_video() {
            State::WaitingKeyFrame
        } else {
            State::FindingFirstSequence { since: now }
        };
        let window = config.mode.initial_window();
        let video_bitrate = config.bitrate.start;
        let store = SortedStore::new(config.clock_rate, 0);

        info!(
            "Jitter buffer for ssrc {:#010x} ({:?}), window {:?}, state {:?}",
            config.ssrc, config.kind, window, state
        );

        Self {
            config,
            state,
            cycles: CycleTracker::new(CycleRule::Publisher),
            store,
            nacks: NackTable::new(),
            outputs: VecDeque::new(),
            metrics: None,
            epoch: now,
            in_seq: None,
            last_in: None,
            out_seq: None,
            window,
            video_bitrate,
            prev_arrival: None,
            cumul_delay: 0,
            cumul_delay_at: None,
            rtt: None,
            avg_rtt: Duration::ZERO,
            rtt_count: 0,
            picture_id: None,
            last_picture_id: None,
            frame: Vec::new(),
            fps: 0,
            next_scan: now,
            next_monitor: now + MONITOR_INTERVAL,
            next_fps_log: now + FPS_LOG_INTERVAL,
            pli_retry_at: None,
            packet_loss: 0,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        // ---
        metrics.video_bitrate_bps.set(self.video_bitrate as i64);
        metrics.buffer_window_ms.set(self.window.as_millis() as i64);
        self.metrics = Some(metrics);
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.config.ssrc
    }

    /// True for the media SSRC and its RTX SSRC.
    pub fn owns_ssrc(&self, ssrc: u32) -> bool {
        // ---
        ssrc == self.config.ssrc || self.config.rtx.is_some_and(|rtx| rtx.ssrc == ssrc)
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn video_bitrate(&self) -> u64 {
        self.video_bitrate
    }

    /// Times the stream was given up on and a key frame requested.
    pub fn packet_loss(&self) -> u64 {
        self.packet_loss
    }

    /// Latest RTT sample, averaged on the next monitor tick.
    pub fn set_rtt(&mut self, rtt: Duration) {
        self.rtt = Some(rtt);
    }

    /// Next queued effect, oldest first.
    pub fn poll_output(&mut self) -> Option<JitterOutput> {
        self.outputs.pop_front()
    }

    /// Feeds one packet received from the publishing peer.
    pub fn on_packet(&mut self, p: RtpPacket, now: Instant) {
        // ---
        if let Some(m) = &self.metrics {
            m.rtp_received_total.inc();
        }

        let pt = p.payload_type();
        if pt == self.config.payload_type {
            self.on_media_packet(p, now);
        } else if let Some(rtx) = self.config.rtx.filter(|rtx| rtx.payload_type == pt) {
            self.on_rtx_packet(p, rtx, now);
        } else {
            warn!(
                "Unknown payload type {} on ssrc {:#010x} (media {}, rtx {:?})",
                pt, self.config.ssrc, self.config.payload_type, self.config.rtx
            );
            self.count_drop();
        }
        self.release();
        self.update_gauges();
    }

    /// Runs the time-driven part: first-sequence timeout, loss scan,
    /// PLI retries, the delay monitor and pacing.
    pub fn on_tick(&mut self, now: Instant) {
        // ---
        if let State::FindingFirstSequence { since } = self.state {
            if now >= since + self.window {
                self.flush_first_sequence();
            }
        }

        if self.config.is_video() {
            if now >= self.next_scan {
                self.scan_for_losses(now);
                self.next_scan = now + self.scan_interval();
            }
            if let Some(at) = self.pli_retry_at {
                if now >= at {
                    info!("Key frame not received, sending PLI again");
                    self.change_bitrate(-0.3);
                    self.send_pli();
                    self.pli_retry_at = Some(at + PLI_RETRY_INTERVAL);
                }
            }
            if now >= self.next_monitor {
                self.monitor(now);
                self.next_monitor = now + MONITOR_INTERVAL;
            }
        }

        if now >= self.next_fps_log {
            if self.fps != 0 {
                info!("FPS is {}", self.fps / FPS_LOG_INTERVAL.as_secs() as u32);
                self.fps = 0;
            }
            self.next_fps_log = now + FPS_LOG_INTERVAL;
        }

        self.release();
        self.update_gauges();
    }

    // --------------------------------------------------------------------
    // ingestion
    // --------------------------------------------------------------------

    fn on_media_packet(&mut self, mut p: RtpPacket, now: Instant) {
        // ---
        let reference = self.store.last_packet().or(self.last_in.as_ref());
        self.cycles.stamp(&mut p, reference);
        let seq = p.ext_seq();
        trace!("Received {}", p);

        if self.last_in.as_ref().map_or(true, |last| last.ext_seq() < seq) {
            self.last_in = Some(p.clone());
        }

        if self.state == State::WaitingKeyFrame {
            self.in_seq = Some(seq);
            if !self.is_key_frame(&p) {
                debug!("Packet {} is not a key frame, waiting", seq);
                self.count_drop();
                return;
            }
            info!("Key frame received at seq {}/{}, restarting", p.sequence(), seq);
            self.pli_retry_at = None;
            self.state = State::FindingFirstSequence { since: now };
        }

        if let State::FindingFirstSequence { since } = self.state {
            if self.in_seq == Some(seq) {
                self.state = State::Streaming;
            } else if now >= since + self.window {
                self.flush_first_sequence();
            } else {
                if self.in_seq.map_or(true, |expected| seq >= expected) {
                    debug!("Packet {} waits in the unsorted buffer", seq);
                    self.store.unsorted_mut().put(p);
                } else {
                    warn!("Dropping {} before first sequence {:?}", seq, self.in_seq);
                    self.count_drop();
                }
                return;
            }
        }

        self.check_received_delay(&p, now);
        self.on_streaming_packet(p);
    }

    fn on_streaming_packet(&mut self, p: RtpPacket) {
        // ---
        let seq = p.ext_seq();
        let expected = *self.in_seq.get_or_insert(seq);

        if seq == expected {
            if let Err(e) = self.store.push(p, false, !self.config.is_video()) {
                warn!("Could not push packet {} in sorted store: {}", seq, e);
                self.count_drop();
            }
        } else if seq < expected {
            warn!(
                "Packet {} already handled (expecting {}), duplicate?",
                seq, expected
            );
            self.count_drop();
            return;
        } else {
            let created_at = p.created_at();
            debug!("Packet {} waits in the unsorted buffer (expecting {})", seq, expected);
            self.store.unsorted_mut().put(p);

            if !self.config.is_video() {
                let stalled = self
                    .store
                    .last_packet()
                    .map_or(true, |last| created_at > last.created_at() + AUDIO_STALL);
                if stalled {
                    warn!(
                        "No audio progress for {:?}, skipping sequence {}",
                        AUDIO_STALL, expected
                    );
                    self.store.push_all_unsorted(true);
                }
            }
        }

        self.advance_in_seq();
    }

    fn on_rtx_packet(&mut self, p: RtpPacket, rtx: RtxParams, now: Instant) {
        // ---
        if p.payload_size() == 0 {
            trace!("Padding-only RTX packet {} on ssrc {:#010x}", p.sequence(), rtx.ssrc);
            return;
        }
        if self.state != State::Streaming {
            debug!("RTX packet ignored while not streaming");
            return;
        }

        let mut original = match p.rtx_extract_original(self.config.payload_type, self.config.ssrc) {
            Ok(original) => original,
            Err(e) => {
                warn!("Invalid RTX packet on ssrc {:#010x}: {}", rtx.ssrc, e);
                self.count_drop();
                return;
            }
        };

        let reference = self.store.last_packet().or(self.last_in.as_ref());
        self.cycles.stamp(&mut original, reference);
        let seq = original.ext_seq();
        let Some(expected) = self.in_seq else {
            return;
        };

        if seq < expected {
            debug!("RTX for {} arrived after the gap closed", seq);
            return;
        }

        info!("RTX recovered seq {}/{}", original.sequence(), seq);
        if let Some(m) = &self.metrics {
            m.rtx_recovered_total.inc();
        }
        self.check_received_delay(&original, now);

        if seq > expected {
            self.store.unsorted_mut().put(original);
        } else if let Err(e) = self.store.push(original, false, !self.config.is_video()) {
            warn!("RTX packet {} could not be reinserted: {}", seq, e);
        }
        self.advance_in_seq();
    }

    /// Ends the first-sequence search: everything waiting is sorted (with
    /// holes for audio) and streaming starts after the highest sequence.
    fn flush_first_sequence(&mut self) {
        // ---
        info!("Flushing disordered packets, first sequence search is over");
        self.store.push_all_unsorted(!self.config.is_video());
        self.state = State::Streaming;
        self.advance_in_seq();
        info!("Streaming starts at sequence {:?}", self.in_seq);
    }

    fn advance_in_seq(&mut self) {
        // ---
        if let Some(last) = self.store.last_packet() {
            let next = last.ext_seq() + 1;
            self.in_seq = Some(next);
            self.nacks.resolve_below(next);
        }
    }

    /// `D = (Rj - Sj) - (Ri - Si)` in clock units, accumulated.
    fn check_received_delay(&mut self, p: &RtpPacket, now: Instant) {
        // ---
        let arrival = clock_units(p.created_at(), self.epoch, self.config.clock_rate);
        let ts = p.ext_timestamp() as i64;

        if let Some((prev_arrival, prev_ts)) = self.prev_arrival {
            let delay = (arrival - ts) - (prev_arrival - prev_ts);
            self.cumul_delay += delay;
            trace!("Received delay {}, cumulated {}", delay, self.cumul_delay);
        }
        self.prev_arrival = Some((arrival, ts));
        self.cumul_delay_at = Some(now);
    }

    fn is_key_frame(&self, p: &RtpPacket) -> bool {
        // ---
        match self.config.kind {
            StreamKind::Video(codec) => codec.is_key_frame(p),
            StreamKind::Audio => true,
        }
    }

    // --------------------------------------------------------------------
    // loss recovery and bitrate
    // --------------------------------------------------------------------

    fn scan_interval(&self) -> Duration {
        // ---
        let avg = self.store.avg_interval();
        if avg.is_zero() {
            DEFAULT_SCAN_INTERVAL
        } else {
            avg
        }
    }

    /// Minimum time between two NACKs for the same sequence.
    fn nack_spacing(&self) -> Duration {
        (self.window * 2 / 5).max(self.scan_interval())
    }

    /// Walks the sequences expected after the last sorted packet and
    /// escalates those overdue by more than the reorder delay.
    fn scan_for_losses(&mut self, now: Instant) {
        // ---
        if self.state != State::Streaming {
            return;
        }
        let (Some(last), Some(last_in)) = (self.store.last_packet(), &self.last_in) else {
            return;
        };

        let interval = self.scan_interval();
        let spacing = self.nack_spacing();
        let last_in_seq = last_in.ext_seq();
        let seq_cycle = last.seq_cycle();
        let mut seq = last.ext_seq() + 1;
        let mut expected_at = last.created_at() + interval;

        while expected_at < now && seq <= last_in_seq && self.state == State::Streaming {
            if !self.store.unsorted().contains(seq) && now > expected_at + REORDER_MAX_DELAY + NACK_GRACE {
                match self.nacks.escalate(seq, seq_cycle, now, spacing) {
                    Escalation::Nack => {
                        info!("NACKing packet {}/{}", wire_seq(seq), seq);
                        self.send_nack(seq);
                        self.change_bitrate(-0.05);
                    }
                    Escalation::Pli => self.manage_pli(seq, now),
                    Escalation::Wait => {}
                }
            }
            seq += 1;
            expected_at += interval;
        }
    }

    /// Gives up on the stream: purge, wait for a key frame, lower the
    /// bitrate and ask for one.
    fn manage_pli(&mut self, seq: u64, now: Instant) {
        // ---
        warn!(
            "Packet {}/{} lost after NACKs, waiting for a key frame",
            wire_seq(seq),
            seq
        );
        self.state = State::WaitingKeyFrame;
        self.in_seq = None;
        self.store.purge();
        self.nacks.clear();
        self.frame.clear();
        self.picture_id = None;
        self.packet_loss += 1;

        if self.pli_retry_at.is_some() {
            warn!("A key frame request is already pending");
            return;
        }
        self.change_bitrate(-0.3);
        self.send_pli();
        self.pli_retry_at = Some(now + PLI_RETRY_INTERVAL);
    }

    /// Once per second: follow the arrival-delay trend and, in MCU mode,
    /// size the window from the RTT average.
    fn monitor(&mut self, now: Instant) {
        // ---
        debug!("Cumulated delay is {}", self.cumul_delay);
        let threshold = self.config.clock_rate as i64 / 200;
        let recent = self
            .cumul_delay_at
            .is_some_and(|at| at + self.store.avg_interval() * 2 > now);

        if self.cumul_delay <= 0 && self.state != State::WaitingKeyFrame && recent {
            info!("Cumulated delay {} is not positive, raising bitrate", self.cumul_delay);
            self.change_bitrate(0.05);
        } else if self.cumul_delay > threshold {
            info!("Cumulated delay {} over 5 ms, lowering bitrate", self.cumul_delay);
            self.change_bitrate(-0.1);
        }

        let Some(rtt) = self.rtt else {
            return;
        };
        let n = self.rtt_count;
        self.avg_rtt = (self.avg_rtt * n + rtt) / (n + 1);
        self.rtt_count = n.saturating_add(1);

        if self.config.mode == Mode::Mcu {
            let window = self.avg_rtt + REORDER_MAX_DELAY;
            let delta = window.abs_diff(self.window);
            if delta > self.window * 5 / 100 {
                info!("Setting jitter buffer window to {:?}", window);
                self.window = window;
                self.outputs
                    .push_back(JitterOutput::Event(JitterEvent::SetJitterSize(window)));
            }
        }
    }

    /// Scales the video bitrate by `1 + pct` and announces it with REMB.
    ///
    /// The result is clamped up to `min`; a result above `max` is ignored.
    /// Nothing is sent when the bitrate does not change.
    fn change_bitrate(&mut self, pct: f64) {
        // ---
        let bounds = self.config.bitrate;
        let mut bitrate = (self.video_bitrate as f64 * (1.0 + pct)).max(0.0) as u64;

        if bitrate < bounds.min {
            info!("Bitrate is at the minimum ({} bits/s)", bounds.min);
            bitrate = bounds.min;
        } else if bitrate > bounds.max {
            info!("Bitrate is at the maximum ({} bits/s)", bounds.max);
            return;
        }
        if bitrate == self.video_bitrate {
            return;
        }

        info!("Bitrate change with REMB to {} kbits/s", bitrate / 1000);
        self.video_bitrate = bitrate;
        let remb = Remb::new(0, bitrate, vec![self.config.ssrc]);
        self.outputs.push_back(JitterOutput::Rtcp(RtcpPacket::Remb(remb)));
        self.outputs
            .push_back(JitterOutput::Event(JitterEvent::BitrateChanged(bitrate)));
        if let Some(m) = &self.metrics {
            m.rembs_sent_total.inc();
        }
    }

    fn send_nack(&mut self, seq: u64) {
        // ---
        let mut nack = Nack::new(0, self.config.ssrc);
        nack.lost(wire_seq(seq));
        self.outputs.push_back(JitterOutput::Rtcp(RtcpPacket::Nack(nack)));
        if let Some(m) = &self.metrics {
            m.nacks_sent_total.inc();
        }
    }

    fn send_pli(&mut self) {
        // ---
        info!("Sending PLI for ssrc {:#010x}", self.config.ssrc);
        let pli = Pli {
            sender_ssrc: 0,
            media_ssrc: self.config.ssrc,
        };
        self.outputs.push_back(JitterOutput::Rtcp(RtcpPacket::Pli(pli)));
        if let Some(m) = &self.metrics {
            m.plis_sent_total.inc();
        }
    }

    // --------------------------------------------------------------------
    // output
    // --------------------------------------------------------------------

    /// Pops sorted packets whose media time lies at least one window
    /// behind the newest received packet.
    fn release(&mut self) {
        // ---
        loop {
            let Some(next) = self.store.peek() else {
                return;
            };
            let newest = self.last_in.as_ref().map_or(0, |p| p.ext_timestamp());
            let behind = newest.saturating_sub(next.ext_timestamp());
            let behind = Duration::from_nanos(
                (behind as u128 * 1_000_000_000 / self.config.clock_rate as u128) as u64,
            );
            if behind < self.window {
                return;
            }
            let Some(p) = self.store.pop() else {
                return;
            };

            match self.config.kind {
                StreamKind::Video(VideoCodec::Vp8) => self.release_vp8(p),
                _ => self.emit(p),
            }
        }
    }

    /// Batches the fragments of one VP8 picture and releases them when the
    /// marker closes it. A picture whose marker carries another id lost a
    /// fragment and is dropped whole.
    fn release_vp8(&mut self, p: RtpPacket) {
        // ---
        let Some(id) = vp8_picture_id(&p) else {
            warn!("Could not read VP8 picture id of {}", p.ext_seq());
            self.emit(p);
            return;
        };

        if !p.marker() {
            let current = *self.picture_id.get_or_insert(id);
            if current == id {
                self.frame.push(p);
            } else {
                debug!("Fragment {} of picture {} dropped (assembling {})", p.ext_seq(), id, current);
            }
            return;
        }

        match self.picture_id.take() {
            Some(current) if current == id => {
                for fragment in std::mem::take(&mut self.frame) {
                    self.emit(fragment);
                }
                self.count_picture(id);
                self.emit(p);
            }
            Some(current) => {
                warn!(
                    "Picture {} is incomplete (marker of {}), dropping {} fragments",
                    current,
                    id,
                    self.frame.len() + 1
                );
                let dropped = self.frame.len() as u64 + 1;
                self.frame.clear();
                if let Some(m) = &self.metrics {
                    m.rtp_dropped_total.inc_by(dropped);
                }
                self.out_seq = Some(p.ext_seq() + 1);
            }
            None => {
                self.count_picture(id);
                self.emit(p);
            }
        }
    }

    fn count_picture(&mut self, id: u16) {
        // ---
        if self.last_picture_id != Some(id) {
            self.last_picture_id = Some(id);
            self.fps += 1;
        }
    }

    fn emit(&mut self, p: RtpPacket) {
        // ---
        let seq = p.ext_seq();
        if self.out_seq.is_some_and(|expected| expected != seq) {
            debug!("Output sequence broken: expected {:?}, sending {}", self.out_seq, seq);
        }
        if !self.config.is_video() && p.marker() {
            self.fps += 1;
        }
        self.out_seq = Some(seq + 1);
        if let Some(m) = &self.metrics {
            m.rtp_forwarded_total.inc();
        }
        self.outputs.push_back(JitterOutput::Rtp(p));
    }

    fn count_drop(&self) {
        // ---
        if let Some(m) = &self.metrics {
            m.rtp_dropped_total.inc();
        }
    }

    fn update_gauges(&self) {
        // ---
        if let Some(m) = &self.metrics {
            m.sorted_store_packets.set(self.store.len() as i64);
            m.video_bitrate_bps.set(self.video_bitrate as i64);
            m.buffer_window_ms.set(self.window.as_millis() as i64);
        }
    }
}

/// `at - epoch` expressed in clock units (negative if `at` is earlier).
fn clock_units(at: Instant, epoch: Instant, clock_rate: u32) -> i64 {
    // ---
    let nanos = match at.checked_duration_since(epoch) {
        Some(d) => d.as_nanos() as i128,
        None => -(epoch.duration_since(at).as_nanos() as i128),
    };
    (nanos * clock_rate as i128 / 1_000_000_000) as i64
}
