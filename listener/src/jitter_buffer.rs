//! Listener-side jitter buffer.
//!
//! Receives the stream packetized for one listening peer, holds video back
//! until a key frame, forwards packets in arrival order and keeps the most
//! recent ones so NACKed sequences can be answered with RTX packets
//! (RFC 4588).

use sfu_common::cycle::{CycleRule, CycleTracker};
use sfu_common::keyframe::VideoCodec;
use sfu_common::rtp::{extend_seq, wire_seq};
use sfu_common::{MetricsContext, RtpPacket, SessionConfig};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Most recent packets keyed by extended sequence number. The lowest
/// sequence is evicted once the capacity is exceeded.
#[derive(Debug)]
pub struct PacketCache {
    // ---
    packets: BTreeMap<u64, RtpPacket>,
    capacity: usize,

    /// Highest sequence stored so far (survives eviction)
    last: Option<RtpPacket>,
}

impl PacketCache {
    // ---
    pub fn new(capacity: usize) -> Self {
        // ---
        Self {
            packets: BTreeMap::new(),
            capacity: capacity.max(1),
            last: None,
        }
    }

    pub fn push(&mut self, p: RtpPacket) {
        // ---
        let seq = p.ext_seq();
        if self.last.as_ref().map_or(true, |last| seq > last.ext_seq()) {
            self.last = Some(p.clone());
        }
        self.packets.insert(seq, p);

        while self.packets.len() > self.capacity {
            self.packets.pop_first();
        }
    }

    pub fn get(&self, seq: u64) -> Option<&RtpPacket> {
        self.packets.get(&seq)
    }

    pub fn last_packet(&self) -> Option<&RtpPacket> {
        self.last.as_ref()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

/// Static parameters of one listener stream.
#[derive(Debug, Clone)]
pub struct ListenerStreamConfig {
    // ---
    /// `None` for audio
    pub codec: Option<VideoCodec>,

    pub payload_type: u8,
    pub ssrc: u32,
    pub clock_rate: u32,

    pub rtx_payload_type: u8,
    pub rtx_ssrc: u32,

    pub cache_size: usize,
}

impl ListenerStreamConfig {
    // ---
    pub fn audio(config: &SessionConfig, payload_type: u8, ssrc: u32, rtx: (u8, u32)) -> Self {
        // ---
        Self {
            codec: None,
            payload_type,
            ssrc,
            clock_rate: config.audio_clock_rate,
            rtx_payload_type: rtx.0,
            rtx_ssrc: rtx.1,
            cache_size: config.listener_cache_size,
        }
    }

    pub fn video(
        config: &SessionConfig,
        codec: VideoCodec,
        payload_type: u8,
        ssrc: u32,
        rtx: (u8, u32),
    ) -> Self {
        // ---
        Self {
            codec: Some(codec),
            payload_type,
            ssrc,
            clock_rate: config.video_clock_rate,
            rtx_payload_type: rtx.0,
            rtx_ssrc: rtx.1,
            cache_size: config.listener_cache_size,
        }
    }
}

/// Listener jitter buffer for one outbound SSRC.
pub struct ListenerBuffer {
    // ---
    config: ListenerStreamConfig,
    cycles: CycleTracker,
    cache: PacketCache,
    waiting_key_frame: bool,

    /// Extended sequence expected next
    next_seq: Option<u64>,

    rtx_seq: u16,
    metrics: Option<MetricsContext>,
}

impl ListenerBuffer {
    // ---
    /// Creates a buffer. `rtx_seq` is the first RTX sequence number,
    /// normally random.
    pub fn new(config: ListenerStreamConfig, rtx_seq: u16) -> Self {
        // ---
        let waiting_key_frame = config.codec.is_some();
        let cache = PacketCache::new(config.cache_size);
        info!(
            "Listener buffer for ssrc {:#010x} (rtx {:#010x}), cache of {} packets",
            config.ssrc, config.rtx_ssrc, config.cache_size
        );

        Self {
            config,
            cycles: CycleTracker::new(CycleRule::Listener),
            cache,
            waiting_key_frame,
            next_seq: None,
            rtx_seq,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsContext) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn ssrc(&self) -> u32 {
        self.config.ssrc
    }

    pub fn is_waiting_key_frame(&self) -> bool {
        self.waiting_key_frame
    }

    pub fn cache(&self) -> &PacketCache {
        &self.cache
    }

    /// Accepts one packet for the peer. Returns it when it may be sent,
    /// `None` while video waits for a key frame.
    pub fn on_packet(&mut self, mut p: RtpPacket) -> Option<RtpPacket> {
        // ---
        if let Some(m) = &self.metrics {
            m.rtp_received_total.inc();
        }

        if let (true, Some(codec)) = (self.waiting_key_frame, self.config.codec) {
            if !codec.opens_listener_gate(&p) {
                debug!("Packet {} is not a key frame, searching", p.sequence());
                if let Some(m) = &self.metrics {
                    m.rtp_dropped_total.inc();
                }
                return None;
            }
            info!("Found the key frame, starting to send stream");
            self.waiting_key_frame = false;
        }

        self.cycles.stamp(&mut p, self.cache.last_packet());
        let seq = p.ext_seq();
        let expected = *self.next_seq.get_or_insert(seq);

        if seq != expected {
            warn!(
                "RTP discontinuity: expected seq {}/{}, got {}/{}",
                wire_seq(expected),
                expected,
                p.sequence(),
                seq
            );
        }
        self.next_seq = Some(seq + 1);

        self.cache.push(p.clone());
        if let Some(m) = &self.metrics {
            m.rtp_forwarded_total.inc();
        }
        Some(p)
    }

    /// Builds RTX packets for the wire sequences a peer NACKed. Sequences
    /// no longer cached are skipped.
    ///
    /// # Arguments
    ///
    /// * `seqs` - Lost wire sequence numbers
    /// * `media_ssrc` - SSRC the NACK was about
    pub fn serve_retransmission(&mut self, seqs: &[u16], media_ssrc: u32) -> Vec<RtpPacket> {
        // ---
        if media_ssrc != self.config.ssrc {
            debug!(
                "NACK for {:#010x} ignored by buffer of {:#010x}",
                media_ssrc, self.config.ssrc
            );
            return Vec::new();
        }
        let Some(next) = self.next_seq else {
            return Vec::new();
        };

        let current = wire_seq(next);
        let cycle = self.cycles.seq_cycle();
        let mut rtx = Vec::with_capacity(seqs.len());

        for &s in seqs {
            // a sequence above the current one was sent before the wrap
            let cycle = if s > current {
                cycle.saturating_sub(1)
            } else {
                cycle
            };
            let Some(original) = self.cache.get(extend_seq(s, cycle)) else {
                info!("Cannot retransmit seq {}, not in cache", s);
                continue;
            };

            let packet = original.to_rtx(
                self.config.rtx_payload_type,
                self.rtx_seq,
                self.config.rtx_ssrc,
            );
            info!(
                "RTX seq {} for original seq {} on ssrc {:#010x}",
                self.rtx_seq, s, self.config.rtx_ssrc
            );
            self.rtx_seq = self.rtx_seq.wrapping_add(1);
            if let Some(m) = &self.metrics {
                m.rtx_served_total.inc();
            }
            rtx.push(packet);
        }
        rtx
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    const SSRC: u32 = 0xAA;
    const RTX_SSRC: u32 = 0xBB;

    fn config(codec: Option<VideoCodec>, cache_size: usize) -> ListenerStreamConfig {
        // ---
        ListenerStreamConfig {
            codec,
            payload_type: 96,
            ssrc: SSRC,
            clock_rate: 90_000,
            rtx_payload_type: 97,
            rtx_ssrc: RTX_SSRC,
            cache_size,
        }
    }

    fn packet(seq: u16, nal: u8) -> RtpPacket {
        RtpPacket::new(96, seq, seq as u32 * 3000, SSRC, false, &[nal, 1, 2, 3])
    }

    #[test]
    fn test_video_waits_for_key_frame() {
        // ---
        let mut lb = ListenerBuffer::new(config(Some(VideoCodec::H264), 10), 0);
        assert!(lb.on_packet(packet(1, 0x41)).is_none());

        // FU-A opens the gate on the listener side
        assert!(lb.on_packet(packet(2, 0x7C)).is_some());
        assert!(lb.on_packet(packet(3, 0x41)).is_some());
        assert!(!lb.is_waiting_key_frame());
    }

    #[test]
    fn test_audio_forwards_immediately() {
        // ---
        let mut lb = ListenerBuffer::new(config(None, 10), 0);
        assert!(lb.on_packet(packet(7, 0x00)).is_some());
    }

    #[test]
    fn test_cache_evicts_oldest() {
        // ---
        let mut lb = ListenerBuffer::new(config(None, 3), 0);
        for seq in 0..5 {
            lb.on_packet(packet(seq, 0));
        }
        assert_eq!(lb.cache().len(), 3);
        assert!(lb.cache().get(1).is_none());
        assert!(lb.cache().get(2).is_some());
    }

    #[test]
    fn test_serve_retransmission_builds_rtx() {
        // ---
        let mut lb = ListenerBuffer::new(config(None, 100), 500);
        for seq in 10..20 {
            lb.on_packet(packet(seq, 0));
        }

        let rtx = lb.serve_retransmission(&[12, 15, 99], SSRC);
        assert_eq!(rtx.len(), 2);

        assert_eq!(rtx[0].payload_type(), 97);
        assert_eq!(rtx[0].ssrc(), RTX_SSRC);
        assert_eq!(rtx[0].sequence(), 500);
        assert_eq!(rtx[1].sequence(), 501);
        assert_eq!(rtx[0].timestamp(), 12 * 3000);
        assert_eq!(&rtx[0].payload()[..2], &12u16.to_be_bytes());
        assert_eq!(&rtx[0].payload()[2..], &[0, 1, 2, 3]);

        let original = rtx[1].rtx_extract_original(96, SSRC).unwrap();
        assert_eq!(original.sequence(), 15);
    }

    #[test]
    fn test_retransmission_across_wrap() {
        // ---
        let mut lb = ListenerBuffer::new(config(None, 100), 0);
        for seq in [65534u16, 65535, 0, 1] {
            lb.on_packet(packet(seq, 0));
        }

        let rtx = lb.serve_retransmission(&[65535, 0], SSRC);
        assert_eq!(rtx.len(), 2);
        assert_eq!(&rtx[0].payload()[..2], &65535u16.to_be_bytes());
        assert_eq!(&rtx[1].payload()[..2], &0u16.to_be_bytes());
    }

    #[test]
    fn test_rtx_sequence_wraps() {
        // ---
        let mut lb = ListenerBuffer::new(config(None, 100), u16::MAX);
        lb.on_packet(packet(1, 0));
        let rtx = lb.serve_retransmission(&[1, 1], SSRC);
        assert_eq!(rtx[0].sequence(), u16::MAX);
        assert_eq!(rtx[1].sequence(), 0);
    }

    #[test]
    fn test_nack_for_other_ssrc_is_ignored() {
        // ---
        let mut lb = ListenerBuffer::new(config(None, 100), 0);
        lb.on_packet(packet(1, 0));
        assert!(lb.serve_retransmission(&[1], 0xDEAD).is_empty());
    }
}
