//! Sender report generation for an outbound stream (RFC 3550 §6.4.1).

use sfu_common::rtcp::{ntp_time, SenderInfo, SenderReport};
use sfu_common::RtpPacket;
use std::time::{Duration, Instant, SystemTime};
use tracing::debug;

/// Cadence of sender reports.
pub const SR_INTERVAL: Duration = Duration::from_millis(500);

/// Counters of the packets sent on one SSRC.
#[derive(Debug)]
pub struct SenderReporter {
    // ---
    ssrc: u32,
    clock_rate: u32,

    /// RTP timestamp of the last packet sent and when it left
    last_sent: Option<(u32, Instant)>,

    packet_count: u32,
    octet_count: u32,
}

impl SenderReporter {
    // ---
    pub fn new(ssrc: u32, clock_rate: u32) -> Self {
        // ---
        Self {
            ssrc,
            clock_rate,
            last_sent: None,
            packet_count: 0,
            octet_count: 0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn packet_count(&self) -> u32 {
        self.packet_count
    }

    pub fn octet_count(&self) -> u32 {
        self.octet_count
    }

    /// Accounts for a packet sent at `now`. Packets of other SSRCs (RTX)
    /// are ignored.
    pub fn on_rtp(&mut self, p: &RtpPacket, now: Instant) {
        // ---
        if p.ssrc() != self.ssrc {
            return;
        }
        self.last_sent = Some((p.timestamp(), now));
        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(p.payload_size() as u32);
    }

    /// Builds the periodic report, extrapolating the RTP timestamp of the
    /// last packet to `now`. Nothing is produced before a packet is sent.
    ///
    /// # Arguments
    ///
    /// * `now` - Monotonic time, for the extrapolation
    /// * `wallclock` - Wall-clock time written as NTP timestamp
    pub fn on_tick(&self, now: Instant, wallclock: SystemTime) -> Option<SenderReport> {
        // ---
        let Some((last_ts, sent_at)) = self.last_sent else {
            debug!("No packet sent on {:#010x}, skipping SR", self.ssrc);
            return None;
        };

        let elapsed = now.saturating_duration_since(sent_at).as_secs_f64();
        let rtp_timestamp = last_ts.wrapping_add((elapsed * self.clock_rate as f64) as u32);
        let (ntp_sec, ntp_frac) = ntp_time(wallclock);

        Some(SenderReport {
            ssrc: self.ssrc,
            sender_info: SenderInfo {
                ntp_sec,
                ntp_frac,
                rtp_timestamp,
                packet_count: self.packet_count,
                octet_count: self.octet_count,
            },
            reports: Vec::new(),
        })
    }
}
