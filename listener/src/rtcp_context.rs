//! Feedback received from a listening peer.
//!
//! REMB estimates feed the [`RembController`]; key-frame requests, NACKs
//! and receiver reports are turned into [`RtcpInfo`] items on a bounded
//! queue. The queue never blocks: when the consumer lags, items are
//! dropped and counted.

use crate::remb::RembController;
use sfu_common::rtcp::{ntp_time, Fir, Nack, Pli, ReceiverReport, ReportBlock, RtcpPacket};
use sfu_common::{try_forward_counted, MetricsContext};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Something the listener pipeline must act on.
#[derive(Debug, Clone, PartialEq)]
pub enum RtcpInfo {
    /// The controller settled on a new video bitrate
    Remb(u64),

    Fir(Fir),
    Pli(Pli),
    Nack(Nack),

    /// Report from the peer, with the round-trip time derived from its
    /// first block carrying an LSR
    ReceiverReport {
        report: ReceiverReport,
        rtt: Option<Duration>,
    },
}

/// Round-trip time from a report block (RFC 3550 §6.4.1): arrival time
/// minus LSR minus DLSR, all in 1/65536 s. `None` when no SR was seen by
/// the peer or the result is not plausible.
pub fn round_trip_time(block: &ReportBlock, wallclock: SystemTime) -> Option<Duration> {
    // ---
    if block.lsr == 0 {
        return None;
    }

    let (sec, frac) = ntp_time(wallclock);
    let arrival = ((sec & 0xFFFF) << 16) | (frac >> 16);
    let rtt = arrival.wrapping_sub(block.lsr).wrapping_sub(block.dlsr);
    if rtt >= 1 << 31 {
        debug!("Report block for {:#010x} ends in the future", block.ssrc);
        return None;
    }

    Some(Duration::from_secs_f64(rtt as f64 / 65536.0))
}

pub struct RtcpContext {
    // ---
    controller: RembController,
    info_tx: mpsc::Sender<RtcpInfo>,
    metrics: Option<MetricsContext>,
}

impl RtcpContext {
    // ---
    pub fn new(controller: RembController, info_tx: mpsc::Sender<RtcpInfo>) -> Self {
        // ---
        Self {
            controller,
            info_tx,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn bitrate(&self) -> u64 {
        self.controller.bitrate()
    }

    /// Handles one parsed packet from the peer.
    ///
    /// # Arguments
    ///
    /// * `packet` - Inbound RTCP packet
    /// * `now` - Monotonic arrival time (REMB sample time)
    /// * `wallclock` - Wall-clock arrival time (RTT computation)
    pub fn push(&mut self, packet: RtcpPacket, now: Instant, wallclock: SystemTime) {
        // ---
        let info = match packet {
            RtcpPacket::Remb(remb) => {
                debug!("REMB {} bits/s from {:#010x}", remb.bitrate(), remb.sender_ssrc);
                self.controller.push(remb.bitrate(), now);
                return;
            }
            RtcpPacket::Fir(fir) => RtcpInfo::Fir(fir),
            RtcpPacket::Pli(pli) => RtcpInfo::Pli(pli),
            RtcpPacket::Nack(nack) => RtcpInfo::Nack(nack),
            RtcpPacket::ReceiverReport(report) => {
                let rtt = report
                    .reports
                    .iter()
                    .find_map(|block| round_trip_time(block, wallclock));
                RtcpInfo::ReceiverReport { report, rtt }
            }
            RtcpPacket::Goodbye(bye) => {
                info!("Listener said goodbye: {}", bye);
                return;
            }
            other => {
                debug!("Ignoring listener RTCP {}", other);
                return;
            }
        };
        self.emit(info);
    }

    /// Runs one controller decision, emitting [`RtcpInfo::Remb`] on change.
    pub fn on_tick(&mut self, now: Instant) {
        // ---
        if let Some(bitrate) = self.controller.on_tick(now) {
            info!(
                "Video bitrate for listener now {} bits/s ({:?})",
                bitrate,
                self.controller.algorithm()
            );
            if let Some(m) = &self.metrics {
                m.video_bitrate_bps.set(bitrate as i64);
            }
            self.emit(RtcpInfo::Remb(bitrate));
        }
    }

    fn emit(&self, info: RtcpInfo) {
        try_forward_counted(&self.info_tx, info, "RTCP info", self.metrics.as_ref());
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::remb::REMB_TICK;
    use sfu_common::rtcp::{FirEntry, Remb};
    use sfu_common::{Bitrate, RembAlgorithm};
    use std::time::UNIX_EPOCH;

    fn context(capacity: usize) -> (RtcpContext, mpsc::Receiver<RtcpInfo>) {
        // ---
        let bounds = Bitrate {
            start: 512_000,
            min: 128_000,
            max: 2_048_000,
            step: 64_000,
        };
        let (tx, rx) = mpsc::channel(capacity);
        let controller = RembController::new(RembAlgorithm::Simple, bounds, 30);
        (RtcpContext::new(controller, tx), rx)
    }

    #[test]
    fn test_feedback_becomes_info() {
        // ---
        let (mut ctx, mut rx) = context(8);
        let now = Instant::now();
        let wallclock = SystemTime::now();

        let mut nack = Nack::new(1, 2);
        nack.lost(100);
        ctx.push(RtcpPacket::Nack(nack.clone()), now, wallclock);
        let pli = Pli {
            sender_ssrc: 1,
            media_ssrc: 2,
        };
        ctx.push(RtcpPacket::Pli(pli.clone()), now, wallclock);
        let fir = Fir {
            sender_ssrc: 1,
            media_ssrc: 0,
            entries: vec![FirEntry { ssrc: 2, seq_nr: 1 }],
        };
        ctx.push(RtcpPacket::Fir(fir.clone()), now, wallclock);

        assert_eq!(rx.try_recv().unwrap(), RtcpInfo::Nack(nack));
        assert_eq!(rx.try_recv().unwrap(), RtcpInfo::Pli(pli));
        assert_eq!(rx.try_recv().unwrap(), RtcpInfo::Fir(fir));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_remb_feeds_controller() {
        // ---
        let (mut ctx, mut rx) = context(8);
        let now = Instant::now();

        ctx.push(RtcpPacket::Remb(Remb::new(1, 1_000_000, vec![2])), now, SystemTime::now());
        assert!(rx.try_recv().is_err());

        ctx.on_tick(now + REMB_TICK);
        assert_eq!(rx.try_recv().unwrap(), RtcpInfo::Remb(960_000));
        assert_eq!(ctx.bitrate(), 960_000);

        // no new decision, no info
        ctx.on_tick(now + REMB_TICK * 2);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_full_queue_drops_info() {
        // ---
        let (mut ctx, mut rx) = context(1);
        let pli = Pli {
            sender_ssrc: 1,
            media_ssrc: 2,
        };
        for _ in 0..3 {
            ctx.push(RtcpPacket::Pli(pli.clone()), Instant::now(), SystemTime::now());
        }
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_round_trip_time_from_report_block() {
        // ---
        // NTP seconds of a whole Unix second, fraction 0
        let wallclock = UNIX_EPOCH + Duration::from_secs(1_000);
        let (sec, _) = ntp_time(wallclock);
        let arrival = (sec & 0xFFFF) << 16;

        let block = ReportBlock {
            ssrc: 2,
            lsr: arrival - 3 * 65536,
            dlsr: 2 * 65536 + 32768,
            ..Default::default()
        };
        let rtt = round_trip_time(&block, wallclock).unwrap();
        assert_eq!(rtt, Duration::from_millis(500));

        let late = ReportBlock {
            lsr: arrival,
            dlsr: 65536,
            ..block
        };
        assert_eq!(round_trip_time(&late, wallclock), None);

        let no_sr = ReportBlock::default();
        assert_eq!(round_trip_time(&no_sr, wallclock), None);
    }
}
