//! RTP packet wrapper.
//!
//! Owns the raw wire buffer (RFC 3550 fixed header, CSRC list, optional
//! header extension, payload) and reads header fields in place. Two cycle
//! counters injected by the cycle tracker extend the 16-bit sequence number
//! and the 32-bit timestamp into monotonic 64-bit values.

use crate::error::{ensure_len, Error, Result};
use std::fmt;
use std::time::Instant;

/// RTP version 2 (RFC 3550)
pub const RTP_VERSION: u8 = 2;

/// Fixed RTP header length in bytes.
pub const RTP_HEADER_LENGTH: usize = 12;

/// Number of distinct 16-bit sequence numbers.
pub const SEQ_MODULO: u64 = 1 << 16;

/// Number of distinct 32-bit timestamps.
pub const TS_MODULO: u64 = 1 << 32;

/// Extends a wire sequence number with its cycle count.
pub fn extend_seq(seq: u16, cycle: u32) -> u64 {
    // ---
    seq as u64 + cycle as u64 * SEQ_MODULO
}

/// Drops the cycle part of an extended sequence number.
pub fn wire_seq(ext_seq: u64) -> u16 {
    // ---
    (ext_seq % SEQ_MODULO) as u16
}

/// Extends a wire timestamp with its cycle count.
pub fn extend_timestamp(ts: u32, cycle: u32) -> u64 {
    // ---
    ts as u64 + cycle as u64 * TS_MODULO
}

/// RTP packet as received from (or sent to) the wire.
///
/// The header is never copied into separate fields: getters and setters
/// operate on `data`, so forwarding a packet is a plain buffer move.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|X|  CC   |M|     PT      |       sequence number         |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                           timestamp                           |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |           synchronization source (SSRC) identifier            |
/// +=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+=+
/// |            contributing source (CSRC) identifiers             |
/// |                             ....                              |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone)]
pub struct RtpPacket {
    // ---
    data: Vec<u8>,

    /// Local receive time (or creation time for internally built packets)
    created_at: Instant,

    seq_cycle: u32,
    ts_cycle: u32,
}

impl RtpPacket {
    // ---
    /// Wraps a received buffer after validating the header.
    ///
    /// # Errors
    ///
    /// Returns `TooShort` if the buffer cannot hold the fixed header, the
    /// CSRC list and any extension it announces, `BadVersion` if the
    /// version field is not 2, and `BadPadding` if the P bit is set with a
    /// padding count of zero or one reaching into the header.
    pub fn parse(data: Vec<u8>, created_at: Instant) -> Result<Self> {
        // ---
        ensure_len(&data, RTP_HEADER_LENGTH)?;

        let version = data[0] >> 6;
        if version != RTP_VERSION {
            return Err(Error::BadVersion(version));
        }

        let packet = Self {
            data,
            created_at,
            seq_cycle: 0,
            ts_cycle: 0,
        };
        let fixed = RTP_HEADER_LENGTH + packet.csrc_count() as usize * 4;
        ensure_len(&packet.data, fixed)?;
        if packet.has_extension() {
            ensure_len(&packet.data, fixed + 4)?;
        }
        ensure_len(&packet.data, packet.header_size())?;

        if packet.has_padding() {
            let available = packet.data.len() - packet.header_size();
            let count = packet.data.last().map_or(0, |n| *n as usize);
            if count == 0 || count > available {
                return Err(Error::BadPadding { count, available });
            }
        }

        Ok(packet)
    }

    /// Builds a packet with no CSRC and no extension.
    ///
    /// # Arguments
    ///
    /// * `payload_type` - 7-bit payload type
    /// * `sequence` - wire sequence number
    /// * `timestamp` - RTP timestamp in clock units
    /// * `ssrc` - synchronization source
    /// * `marker` - marker bit (end of frame for video)
    /// * `payload` - media payload
    pub fn new(
        payload_type: u8,
        sequence: u16,
        timestamp: u32,
        ssrc: u32,
        marker: bool,
        payload: &[u8],
    ) -> Self {
        // ---
        let mut data = Vec::with_capacity(RTP_HEADER_LENGTH + payload.len());
        data.push(RTP_VERSION << 6);
        data.push((payload_type & 0x7F) | if marker { 0x80 } else { 0 });
        data.extend_from_slice(&sequence.to_be_bytes());
        data.extend_from_slice(&timestamp.to_be_bytes());
        data.extend_from_slice(&ssrc.to_be_bytes());
        data.extend_from_slice(payload);

        Self {
            data,
            created_at: Instant::now(),
            seq_cycle: 0,
            ts_cycle: 0,
        }
    }

    /// Overrides the receive time (builder style, used by tests and replay).
    pub fn with_created_at(mut self, created_at: Instant) -> Self {
        // ---
        self.created_at = created_at;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn csrc_count(&self) -> u8 {
        self.data[0] & 0x0F
    }

    pub fn has_padding(&self) -> bool {
        self.data[0] & 0x20 != 0
    }

    /// Trailing padding bytes (count byte included), zero without the P bit.
    pub fn padding_size(&self) -> usize {
        // ---
        if !self.has_padding() {
            return 0;
        }
        let available = self.data.len().saturating_sub(self.header_size());
        self.data.last().map_or(0, |n| *n as usize).min(available)
    }

    fn has_extension(&self) -> bool {
        self.data[0] & 0x10 != 0
    }

    /// Header length including CSRC list and header extension.
    pub fn header_size(&self) -> usize {
        // ---
        let mut size = RTP_HEADER_LENGTH + self.csrc_count() as usize * 4;
        if self.has_extension() && self.data.len() >= size + 4 {
            let words = u16::from_be_bytes([self.data[size + 2], self.data[size + 3]]) as usize;
            size += 4 + words * 4;
        }
        size
    }

    /// Media payload, padding excluded.
    pub fn payload(&self) -> &[u8] {
        // ---
        let end = self.data.len() - self.padding_size();
        &self.data[self.header_size()..end]
    }

    pub fn payload_size(&self) -> usize {
        self.payload().len()
    }

    pub fn payload_type(&self) -> u8 {
        self.data[1] & 0x7F
    }

    /// Replaces the payload type, keeping the marker bit.
    pub fn set_payload_type(&mut self, payload_type: u8) {
        // ---
        self.data[1] = (self.data[1] & 0x80) | (payload_type & 0x7F);
    }

    pub fn marker(&self) -> bool {
        self.data[1] & 0x80 != 0
    }

    pub fn set_marker(&mut self, marker: bool) {
        // ---
        if marker {
            self.data[1] |= 0x80;
        } else {
            self.data[1] &= 0x7F;
        }
    }

    pub fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.data[2], self.data[3]])
    }

    pub fn set_sequence(&mut self, sequence: u16) {
        self.data[2..4].copy_from_slice(&sequence.to_be_bytes());
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.data[4], self.data[5], self.data[6], self.data[7]])
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.data[4..8].copy_from_slice(&timestamp.to_be_bytes());
    }

    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes([self.data[8], self.data[9], self.data[10], self.data[11]])
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.data[8..12].copy_from_slice(&ssrc.to_be_bytes());
    }

    pub fn seq_cycle(&self) -> u32 {
        self.seq_cycle
    }

    pub fn set_seq_cycle(&mut self, cycle: u32) {
        self.seq_cycle = cycle;
    }

    pub fn ts_cycle(&self) -> u32 {
        self.ts_cycle
    }

    pub fn set_ts_cycle(&mut self, cycle: u32) {
        self.ts_cycle = cycle;
    }

    /// Sequence number extended with the injected cycle count.
    pub fn ext_seq(&self) -> u64 {
        // ---
        extend_seq(self.sequence(), self.seq_cycle)
    }

    /// Timestamp extended with the injected cycle count.
    pub fn ext_timestamp(&self) -> u64 {
        // ---
        extend_timestamp(self.timestamp(), self.ts_cycle)
    }

    /// Recovers the original packet carried by an RTX packet (RFC 4588).
    ///
    /// The original sequence number (OSN) sits in the first two payload
    /// bytes. It is removed, and the payload type, sequence number and SSRC
    /// of the media stream are restored. RTX padding is not carried over.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRtx` if the payload cannot hold the OSN, which
    /// includes padding-only bandwidth probes.
    pub fn rtx_extract_original(&self, original_pt: u8, media_ssrc: u32) -> Result<RtpPacket> {
        // ---
        let header_size = self.header_size();
        let payload = self.payload();
        if payload.len() < 2 {
            return Err(Error::InvalidRtx("payload shorter than OSN"));
        }

        let osn = u16::from_be_bytes([payload[0], payload[1]]);
        let mut data = Vec::with_capacity(header_size + payload.len() - 2);
        data.extend_from_slice(&self.data[..header_size]);
        data.extend_from_slice(&payload[2..]);
        data[0] &= !0x20;

        let mut original = RtpPacket {
            data,
            created_at: self.created_at,
            seq_cycle: 0,
            ts_cycle: 0,
        };
        original.set_payload_type(original_pt);
        original.set_sequence(osn);
        original.set_ssrc(media_ssrc);

        Ok(original)
    }

    /// Wraps this packet into an RTX packet (RFC 4588).
    ///
    /// The header (fixed part plus CSRCs and extension) is kept, the
    /// original sequence number is inserted ahead of the payload, and the
    /// payload type, sequence number and SSRC are swapped for the RTX ones.
    /// The marker bit is preserved, padding is dropped.
    pub fn to_rtx(&self, rtx_pt: u8, rtx_seq: u16, rtx_ssrc: u32) -> RtpPacket {
        // ---
        let header_size = self.header_size();
        let mut data = Vec::with_capacity(self.data.len() + 2);
        data.extend_from_slice(&self.data[..header_size]);
        data.extend_from_slice(&self.sequence().to_be_bytes());
        data.extend_from_slice(self.payload());
        data[0] &= !0x20;

        let mut rtx = RtpPacket {
            data,
            created_at: Instant::now(),
            seq_cycle: 0,
            ts_cycle: 0,
        };
        rtx.set_payload_type(rtx_pt);
        rtx.set_sequence(rtx_seq);
        rtx.set_ssrc(rtx_ssrc);
        rtx
    }
}

impl fmt::Display for RtpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RTP pt={} seq={}/{} ts={} ssrc={:#010x} m={} len={}",
            self.payload_type(),
            self.sequence(),
            self.ext_seq(),
            self.timestamp(),
            self.ssrc(),
            self.marker(),
            self.data.len()
        )
    }
}
