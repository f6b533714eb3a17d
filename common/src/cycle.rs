//! Sequence/timestamp cycle tracking.
//!
//! Turns the 16-bit sequence number and 32-bit timestamp of incoming
//! packets into 64-bit extended values by counting wraparounds. Detection
//! is windowed: a wrap is only recognised when the new packet is within
//! 1000 sequence numbers (500000 timestamp units) after zero and the
//! reference packet is equally close to the top of the range. Packets
//! reordered further than that are not disambiguated.

use crate::rtp::RtpPacket;
use tracing::debug;

/// Low window for sequence numbers after a wrap.
pub const SEQ_WRAP_LOW: u16 = 1000;

/// High window for sequence numbers before a wrap.
pub const SEQ_WRAP_HIGH: u16 = u16::MAX - 1000;

/// Low window for timestamps after a wrap.
pub const TS_WRAP_LOW: u32 = 500_000;

/// High window for timestamps before a wrap.
pub const TS_WRAP_HIGH: u32 = u32::MAX - 500_000;

/// How a packet that looks older than the last wrap is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleRule {
    /// Reference is the last sorted packet. A packet near the top of the
    /// range while the reference is near zero belongs to the previous cycle.
    Publisher,

    /// Reference is the last stored packet. A packet more than half the
    /// range ahead of the reference (in extended terms) belongs to the
    /// previous cycle.
    Listener,
}

#[derive(Debug, Clone)]
pub struct CycleTracker {
    // ---
    rule: CycleRule,
    seq_cycle: u32,
    ts_cycle: u32,

    /// Extended seq of the reference that caused the last sequence wrap
    seq_wrap_ref: Option<u64>,

    /// Extended timestamp of the reference that caused the last ts wrap
    ts_wrap_ref: Option<u64>,
}

impl CycleTracker {
    // ---
    pub fn new(rule: CycleRule) -> Self {
        // ---
        Self {
            rule,
            seq_cycle: 0,
            ts_cycle: 0,
            seq_wrap_ref: None,
            ts_wrap_ref: None,
        }
    }

    pub fn seq_cycle(&self) -> u32 {
        self.seq_cycle
    }

    pub fn ts_cycle(&self) -> u32 {
        self.ts_cycle
    }

    /// Stamps `p` with the current cycles, then corrects them against
    /// `reference` (last sorted or stored packet).
    ///
    /// A wrap seen twice against the same reference (a duplicate, or two
    /// early packets of the new cycle) advances the cycle only once.
    pub fn stamp(&mut self, p: &mut RtpPacket, reference: Option<&RtpPacket>) {
        // ---
        p.set_seq_cycle(self.seq_cycle);
        p.set_ts_cycle(self.ts_cycle);

        let Some(last) = reference else {
            return;
        };

        self.stamp_seq(p, last);
        self.stamp_ts(p, last);
    }

    fn stamp_seq(&mut self, p: &mut RtpPacket, last: &RtpPacket) {
        // ---
        let (p_seq, l_seq) = (p.sequence(), last.sequence());

        if p_seq <= SEQ_WRAP_LOW && l_seq >= SEQ_WRAP_HIGH && p_seq < l_seq {
            if self.seq_wrap_ref != Some(last.ext_seq()) {
                self.seq_cycle += 1;
                self.seq_wrap_ref = Some(last.ext_seq());
                debug!(
                    "Sequence wrap: seq {} after {}, cycle now {}",
                    p_seq, l_seq, self.seq_cycle
                );
            }
            p.set_seq_cycle(self.seq_cycle);
            return;
        }

        let previous_cycle = match self.rule {
            CycleRule::Publisher => {
                p_seq >= SEQ_WRAP_HIGH && l_seq <= SEQ_WRAP_LOW && p_seq > l_seq
            }
            CycleRule::Listener => p.ext_seq() > last.ext_seq() + 32_768,
        };
        if previous_cycle {
            debug!("Late packet seq {} from before the wrap (last {})", p_seq, l_seq);
            p.set_seq_cycle(self.seq_cycle.saturating_sub(1));
        }
    }

    fn stamp_ts(&mut self, p: &mut RtpPacket, last: &RtpPacket) {
        // ---
        let (p_ts, l_ts) = (p.timestamp(), last.timestamp());

        if p_ts <= TS_WRAP_LOW && l_ts >= TS_WRAP_HIGH && p_ts < l_ts {
            if self.ts_wrap_ref != Some(last.ext_timestamp()) {
                self.ts_cycle += 1;
                self.ts_wrap_ref = Some(last.ext_timestamp());
                debug!(
                    "Timestamp wrap: ts {} after {}, cycle now {}",
                    p_ts, l_ts, self.ts_cycle
                );
            }
            p.set_ts_cycle(self.ts_cycle);
            return;
        }

        let previous_cycle = match self.rule {
            CycleRule::Publisher => p_ts >= TS_WRAP_HIGH && l_ts <= TS_WRAP_LOW && p_ts > l_ts,
            CycleRule::Listener => p.ext_timestamp() > last.ext_timestamp() + (1 << 31),
        };
        if previous_cycle {
            p.set_ts_cycle(self.ts_cycle.saturating_sub(1));
        }
    }
}
