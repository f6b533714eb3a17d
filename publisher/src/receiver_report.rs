//! Receiver report generation for an inbound stream (RFC 3550 §6.4.2).
//!
//! Tracks reception statistics and interarrival jitter for one SSRC and
//! builds a report block every [`RR_INTERVAL`]. Jitter is computed both
//! per packet (reported in the RR) and per frame, the latter delimited by
//! the marker bit and surfaced as [`FrameStats`] for bitrate estimation.

use sfu_common::rtcp::{ReceiverReport, ReportBlock, SenderReport};
use sfu_common::RtpPacket;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cadence of receiver reports.
pub const RR_INTERVAL: Duration = Duration::from_millis(300);

/// Arrival jumps larger than this (clock units) are logged as suspicious.
const MAX_ARRIVAL_JUMP: i64 = 1_000_000;

/// Interarrival statistics computed between two complete frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    pub ssrc: u32,

    /// `D(i, j)` in clock units
    pub interarrival_difference: i64,

    /// Smoothed jitter in clock units
    pub interarrival_jitter: u32,
}

#[derive(Debug, Clone, Copy)]
struct Arrival {
    ext_seq: u64,
    rtp_ts: i64,

    /// Arrival time in clock units
    arrival: i64,
}

impl Arrival {
    /// `(Rj - Sj) - (Ri - Si)` against `prev`.
    fn difference(&self, prev: &Arrival) -> i64 {
        (self.arrival - self.rtp_ts) - (prev.arrival - prev.rtp_ts)
    }
}

/// RFC 3550 smoothing: `J += (|D| - J) / 16`.
fn smooth(jitter: f64, difference: i64) -> f64 {
    jitter + ((difference as f64).abs() - jitter) / 16.0
}

/// Reception statistics for one media SSRC.
#[derive(Debug)]
pub struct ReceiverReporter {
    // ---
    media_ssrc: u32,
    reporter_ssrc: u32,
    clock_rate: u32,

    /// Reference for arrival times in clock units
    epoch: Instant,

    seq_cycles: u64,
    first_seq: Option<u64>,
    highest_seq: u64,
    last: Option<Arrival>,
    last_frame: Option<Arrival>,

    received: u64,
    expected_prior: u64,
    received_prior: u64,
    first_interval: bool,

    jitter: f64,
    frame_jitter: f64,

    /// Middle 32 bits of the last SR NTP time and when it arrived
    last_sr: Option<(u32, Instant)>,
}

impl ReceiverReporter {
    // ---
    /// Creates a reporter for `media_ssrc`.
    ///
    /// # Arguments
    ///
    /// * `media_ssrc` - source the report blocks describe
    /// * `reporter_ssrc` - SSRC written in the RR header
    /// * `clock_rate` - RTP clock rate of the stream (Hz)
    /// * `epoch` - reference instant for arrival times
    pub fn new(media_ssrc: u32, reporter_ssrc: u32, clock_rate: u32, epoch: Instant) -> Self {
        // ---
        Self {
            media_ssrc,
            reporter_ssrc,
            clock_rate: clock_rate.max(1),
            epoch,
            seq_cycles: 0,
            first_seq: None,
            highest_seq: 0,
            last: None,
            last_frame: None,
            received: 0,
            expected_prior: 0,
            received_prior: 0,
            first_interval: true,
            jitter: 0.0,
            frame_jitter: 0.0,
            last_sr: None,
        }
    }

    pub fn media_ssrc(&self) -> u32 {
        self.media_ssrc
    }

    /// Per-packet interarrival jitter in clock units.
    pub fn jitter(&self) -> u32 {
        self.jitter as u32
    }

    /// Jitter in seconds, for the metrics histogram.
    pub fn jitter_seconds(&self) -> f64 {
        self.jitter / self.clock_rate as f64
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    /// `highest - first + 1`, 0 before the first packet.
    pub fn expected(&self) -> u64 {
        // ---
        self.first_seq
            .map_or(0, |first| self.highest_seq.saturating_sub(first) + 1)
    }

    /// Cumulative lost count, never negative (duplicates can make
    /// `received > expected`).
    pub fn lost(&self) -> u64 {
        self.expected().saturating_sub(self.received)
    }

    /// Accounts for an arriving packet. Returns frame statistics when the
    /// packet closes a frame and a previous frame is known.
    pub fn on_rtp(&mut self, p: &RtpPacket) -> Option<FrameStats> {
        // ---
        let seq = p.sequence() as u64;
        let current = Arrival {
            ext_seq: self.extend(seq),
            rtp_ts: p.timestamp() as i64,
            arrival: self.clock_units(p.created_at()),
        };

        let mut frame_stats = None;
        match self.last {
            None => {
                self.first_seq = Some(current.ext_seq);
                self.highest_seq = current.ext_seq;
            }
            Some(last) => {
                if (current.arrival - last.arrival).abs() > MAX_ARRIVAL_JUMP {
                    warn!(
                        "Suspicious arrival time {} (previous {})",
                        current.arrival, last.arrival
                    );
                }

                let difference = current.difference(&last);
                self.jitter = smooth(self.jitter, difference);
                debug!(
                    "D({}, {}) = {} J = {:.2}",
                    last.ext_seq, current.ext_seq, difference, self.jitter
                );

                if p.marker() {
                    frame_stats = self.on_frame(&current);
                }
            }
        }

        self.received += 1;
        self.highest_seq = self.highest_seq.max(current.ext_seq);
        self.last = Some(current);
        frame_stats
    }

    /// Records the LSR of an inbound SR for this source.
    pub fn on_sender_report(&mut self, sr: &SenderReport, now: Instant) {
        // ---
        if sr.ssrc != self.media_ssrc {
            debug!(
                "SR for {:#010x} ignored by reporter of {:#010x}",
                sr.ssrc, self.media_ssrc
            );
            return;
        }
        self.last_sr = Some((sr.sender_info.lsr(), now));
    }

    /// Builds the periodic report. Nothing is produced before the first
    /// packet, and the first tick after it only snapshots the counters.
    pub fn on_tick(&mut self, now: Instant) -> Option<ReceiverReport> {
        // ---
        if self.received == 0 {
            return None;
        }

        let expected = self.expected();
        let expected_interval = expected.saturating_sub(self.expected_prior);
        let received_interval = self.received.saturating_sub(self.received_prior);
        self.expected_prior = expected;
        self.received_prior = self.received;

        if self.first_interval {
            self.first_interval = false;
            return None;
        }

        let lost_interval = expected_interval.saturating_sub(received_interval);
        let fraction_lost = if expected_interval == 0 || lost_interval == 0 {
            0
        } else {
            ((lost_interval << 8) / expected_interval).min(255) as u8
        };

        let (lsr, dlsr) = match self.last_sr {
            Some((lsr, at)) => {
                let delay = now.saturating_duration_since(at).as_secs_f64();
                (lsr, (delay * 65536.0) as u32)
            }
            None => (0, 0),
        };

        Some(ReceiverReport {
            ssrc: self.reporter_ssrc,
            reports: vec![ReportBlock {
                ssrc: self.media_ssrc,
                fraction_lost,
                total_lost: self.lost().min(0x00FF_FFFF) as u32,
                highest_seq: self.highest_seq as u32,
                jitter: self.jitter(),
                lsr,
                dlsr,
            }],
        })
    }

    fn on_frame(&mut self, current: &Arrival) -> Option<FrameStats> {
        // ---
        let stats = self.last_frame.map(|frame| {
            let difference = current.difference(&frame);
            self.frame_jitter = smooth(self.frame_jitter, difference);
            FrameStats {
                ssrc: self.media_ssrc,
                interarrival_difference: difference,
                interarrival_jitter: self.frame_jitter as u32,
            }
        });
        self.last_frame = Some(*current);
        stats
    }

    /// Extends the wire sequence, counting a wrap when it jumps back by
    /// more than 0x0FFF.
    fn extend(&mut self, seq: u64) -> u64 {
        // ---
        if let Some(last) = &self.last {
            let last_seq = last.ext_seq % 65_536;
            if last_seq > seq && last_seq - seq > 0x0FFF {
                self.seq_cycles += 1;
            }
        }
        seq + self.seq_cycles * 65_536
    }

    fn clock_units(&self, at: Instant) -> i64 {
        // ---
        let nanos = match at.checked_duration_since(self.epoch) {
            Some(d) => d.as_nanos() as i128,
            None => -(self.epoch.duration_since(at).as_nanos() as i128),
        };
        (nanos * self.clock_rate as i128 / 1_000_000_000) as i64
    }
}
