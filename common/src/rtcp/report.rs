//! Sender and receiver reports (RFC 3550 §6.4).

use super::header::{get_u32, put_u32, Header, MAX_COUNT, PT_RR, PT_SR};
use crate::error::{ensure_len, Result};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Sender info section length in bytes.
pub const SENDER_INFO_LENGTH: usize = 20;

/// Report block length in bytes.
pub const REPORT_BLOCK_LENGTH: usize = 24;

/// Seconds between 1900-01-01 (NTP epoch) and 1970-01-01 (Unix epoch).
const NTP_UNIX_OFFSET_SECS: u64 = 2_208_988_800;

/// Converts a wall-clock time into a 64-bit NTP timestamp (seconds, fraction).
///
/// The fraction is rounded up so that converting back and forth never
/// drifts downwards.
pub fn ntp_time(t: SystemTime) -> (u32, u32) {
    // ---
    let since_unix = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let secs = since_unix.as_secs() + NTP_UNIX_OFFSET_SECS;
    let nanos = since_unix.subsec_nanos() as u64;
    let frac = ((nanos << 32) + 999_999_999) / 1_000_000_000;

    (secs as u32, frac as u32)
}

/// Sender information block of an SR.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SenderInfo {
    // ---
    pub ntp_sec: u32,
    pub ntp_frac: u32,
    pub rtp_timestamp: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

impl SenderInfo {
    // ---
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        ensure_len(buf, SENDER_INFO_LENGTH)?;

        Ok(Self {
            ntp_sec: get_u32(buf, 0),
            ntp_frac: get_u32(buf, 4),
            rtp_timestamp: get_u32(buf, 8),
            packet_count: get_u32(buf, 12),
            octet_count: get_u32(buf, 16),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        // ---
        put_u32(buf, self.ntp_sec);
        put_u32(buf, self.ntp_frac);
        put_u32(buf, self.rtp_timestamp);
        put_u32(buf, self.packet_count);
        put_u32(buf, self.octet_count);
    }

    /// Middle 32 bits of the NTP timestamp, echoed back as LSR in reports.
    pub fn lsr(&self) -> u32 {
        // ---
        ((self.ntp_sec & 0xFFFF) << 16) | (self.ntp_frac >> 16)
    }
}

/// Reception report block.
///
/// ```text
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |                 SSRC_1 (SSRC of first source)                 |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | fraction lost |       cumulative number of packets lost       |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           extended highest sequence number received           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                      interarrival jitter                      |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                         last SR (LSR)                         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                   delay since last SR (DLSR)                  |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportBlock {
    // ---
    pub ssrc: u32,
    pub fraction_lost: u8,

    /// Cumulative lost count, 24 bits on the wire
    pub total_lost: u32,

    pub highest_seq: u32,
    pub jitter: u32,
    pub lsr: u32,

    /// Delay since last SR in 1/65536 seconds
    pub dlsr: u32,
}

impl ReportBlock {
    // ---
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        ensure_len(buf, REPORT_BLOCK_LENGTH)?;

        let lost = get_u32(buf, 4);
        Ok(Self {
            ssrc: get_u32(buf, 0),
            fraction_lost: (lost >> 24) as u8,
            total_lost: lost & 0x00FF_FFFF,
            highest_seq: get_u32(buf, 8),
            jitter: get_u32(buf, 12),
            lsr: get_u32(buf, 16),
            dlsr: get_u32(buf, 20),
        })
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        // ---
        put_u32(buf, self.ssrc);
        put_u32(
            buf,
            ((self.fraction_lost as u32) << 24) | (self.total_lost & 0x00FF_FFFF),
        );
        put_u32(buf, self.highest_seq);
        put_u32(buf, self.jitter);
        put_u32(buf, self.lsr);
        put_u32(buf, self.dlsr);
    }
}

fn parse_blocks(buf: &[u8], count: u8) -> Result<Vec<ReportBlock>> {
    // ---
    ensure_len(buf, count as usize * REPORT_BLOCK_LENGTH)?;
    buf.chunks_exact(REPORT_BLOCK_LENGTH)
        .take(count as usize)
        .map(ReportBlock::parse)
        .collect()
}

fn capped_blocks(reports: &[ReportBlock]) -> &[ReportBlock] {
    // ---
    if reports.len() > MAX_COUNT {
        warn!(
            "{} report blocks exceed the RTCP limit, sending the first {}",
            reports.len(),
            MAX_COUNT
        );
        return &reports[..MAX_COUNT];
    }
    reports
}

/// Sender report (PT=200).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SenderReport {
    // ---
    pub ssrc: u32,
    pub sender_info: SenderInfo,
    pub reports: Vec<ReportBlock>,
}

impl SenderReport {
    // ---
    /// Parses a full SR packet (header included).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let header = Header::parse(buf)?;
        header.expect(PT_SR, None)?;
        let body = header.body(buf)?;
        ensure_len(body, 4 + SENDER_INFO_LENGTH)?;

        Ok(Self {
            ssrc: get_u32(body, 0),
            sender_info: SenderInfo::parse(&body[4..])?,
            reports: parse_blocks(&body[4 + SENDER_INFO_LENGTH..], header.count)?,
        })
    }

    /// Header for the current content: 1 + 5 + 6·n words after the header.
    pub fn header(&self) -> Header {
        // ---
        let blocks = capped_blocks(&self.reports).len();
        Header::new(
            blocks as u8,
            PT_SR,
            4 + SENDER_INFO_LENGTH + blocks * REPORT_BLOCK_LENGTH,
        )
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let header = self.header();
        let mut buf = Vec::with_capacity(header.full_packet_size());
        buf.extend_from_slice(&header.to_bytes());
        put_u32(&mut buf, self.ssrc);
        self.sender_info.write_to(&mut buf);
        for block in capped_blocks(&self.reports) {
            block.write_to(&mut buf);
        }
        buf
    }
}

impl fmt::Display for SenderReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SR ssrc={:#010x} ntp={}.{} rtp_ts={} packets={} octets={} blocks={}",
            self.ssrc,
            self.sender_info.ntp_sec,
            self.sender_info.ntp_frac,
            self.sender_info.rtp_timestamp,
            self.sender_info.packet_count,
            self.sender_info.octet_count,
            self.reports.len()
        )
    }
}

/// Receiver report (PT=201).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiverReport {
    // ---
    pub ssrc: u32,
    pub reports: Vec<ReportBlock>,
}

impl ReceiverReport {
    // ---
    /// Parses a full RR packet (header included).
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let header = Header::parse(buf)?;
        header.expect(PT_RR, None)?;
        let body = header.body(buf)?;
        ensure_len(body, 4)?;

        Ok(Self {
            ssrc: get_u32(body, 0),
            reports: parse_blocks(&body[4..], header.count)?,
        })
    }

    /// Header for the current content: 1 + 6·n words after the header.
    pub fn header(&self) -> Header {
        // ---
        let blocks = capped_blocks(&self.reports).len();
        Header::new(blocks as u8, PT_RR, 4 + blocks * REPORT_BLOCK_LENGTH)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let header = self.header();
        let mut buf = Vec::with_capacity(header.full_packet_size());
        buf.extend_from_slice(&header.to_bytes());
        put_u32(&mut buf, self.ssrc);
        for block in capped_blocks(&self.reports) {
            block.write_to(&mut buf);
        }
        buf
    }
}

impl fmt::Display for ReceiverReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RR ssrc={:#010x}", self.ssrc)?;
        for block in &self.reports {
            write!(
                f,
                " [src={:#010x} lost={}/{} hseq={} jitter={} lsr={} dlsr={}]",
                block.ssrc,
                block.fraction_lost,
                block.total_lost,
                block.highest_seq,
                block.jitter,
                block.lsr,
                block.dlsr
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::time::Duration;

    fn block(ssrc: u32) -> ReportBlock {
        ReportBlock {
            ssrc,
            fraction_lost: 25,
            total_lost: 0x00AB_CDEF,
            highest_seq: 70_000,
            jitter: 42,
            lsr: 0x1234_5678,
            dlsr: 65536,
        }
    }

    #[test]
    fn test_sender_report_roundtrip_with_blocks() {
        // ---
        let sr = SenderReport {
            ssrc: 0xCAFEBABE,
            sender_info: SenderInfo {
                ntp_sec: 3_900_000_000,
                ntp_frac: 0x8000_0000,
                rtp_timestamp: 123_456,
                packet_count: 10,
                octet_count: 12_000,
            },
            reports: vec![block(1), block(2)],
        };

        let bytes = sr.to_bytes();
        assert_eq!(bytes.len(), 4 + 4 + 20 + 2 * 24);

        let header = Header::parse(&bytes).unwrap();
        assert_eq!(header.length, 1 + 5 + 6 * 2);
        assert_eq!(header.count, 2);

        assert_eq!(SenderReport::parse(&bytes).unwrap(), sr);
    }

    #[test]
    fn test_receiver_report_roundtrip() {
        // ---
        let rr = ReceiverReport {
            ssrc: 7,
            reports: vec![block(9)],
        };

        let bytes = rr.to_bytes();
        assert_eq!(Header::parse(&bytes).unwrap().length, 1 + 6);
        assert_eq!(ReceiverReport::parse(&bytes).unwrap(), rr);
    }

    #[test]
    fn test_empty_receiver_report() {
        // ---
        let rr = ReceiverReport {
            ssrc: 7,
            reports: vec![],
        };
        let bytes = rr.to_bytes();
        assert_eq!(bytes, vec![0x80, 201, 0, 1, 0, 0, 0, 7]);
        assert_eq!(ReceiverReport::parse(&bytes).unwrap(), rr);
    }

    #[test]
    fn test_report_count_exceeds_body() {
        // ---
        let mut bytes = ReceiverReport {
            ssrc: 7,
            reports: vec![block(9)],
        }
        .to_bytes();
        bytes[0] = 0x82; // claims two blocks, only one present
        assert!(ReceiverReport::parse(&bytes).is_err());
    }

    #[test]
    fn test_parse_rejects_other_type() {
        // ---
        let bytes = ReceiverReport::default().to_bytes();
        assert!(SenderReport::parse(&bytes).is_err());
    }

    #[test]
    fn test_lsr_middle_bits() {
        // ---
        let info = SenderInfo {
            ntp_sec: 0xAABB_CCDD,
            ntp_frac: 0x1122_3344,
            ..Default::default()
        };
        assert_eq!(info.lsr(), 0xCCDD_1122);
    }

    #[test]
    fn test_ntp_time() {
        // ---
        let t = UNIX_EPOCH + Duration::from_millis(1_500);
        let (sec, frac) = ntp_time(t);
        assert_eq!(sec as u64, NTP_UNIX_OFFSET_SECS + 1);
        assert_eq!(frac, 0x8000_0000);
    }
}
