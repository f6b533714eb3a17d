//! RTCP common header (RFC 3550 §6.4.1, RFC 4585 §6.1).

use crate::error::{ensure_len, Error, Result};

/// Length of the common header in bytes.
pub const HEADER_LENGTH: usize = 4;

/// RTCP protocol version.
pub const RTCP_VERSION: u8 = 2;

// Packet types
pub const PT_FIR_LEGACY: u8 = 192;
pub const PT_NACK_LEGACY: u8 = 193;
pub const PT_SR: u8 = 200;
pub const PT_RR: u8 = 201;
pub const PT_SDES: u8 = 202;
pub const PT_BYE: u8 = 203;
pub const PT_APP: u8 = 204;
pub const PT_RTPFB: u8 = 205;
pub const PT_PSFB: u8 = 206;

// Transport layer feedback (PT=205) message types
pub const FMT_NACK: u8 = 1;
pub const FMT_TMMBR: u8 = 3;
pub const FMT_TMMBN: u8 = 4;

// Payload specific feedback (PT=206) message types
pub const FMT_PLI: u8 = 1;
pub const FMT_SLI: u8 = 2;
pub const FMT_FIR: u8 = 4;
pub const FMT_TSTR: u8 = 5;
pub const FMT_TSTN: u8 = 6;
pub const FMT_AFB: u8 = 15;

/// Largest value of the 5-bit count / FMT field.
pub const MAX_COUNT: usize = 31;

/// Common header shared by every RTCP packet.
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |V=2|P|  RC/FMT |      PT       |             length            |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
///
/// `length` counts 32-bit words minus one, header included.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    // ---
    pub version: u8,
    pub padding: bool,

    /// Reception report count, source count or feedback FMT
    pub count: u8,

    pub packet_type: u8,
    pub length: u16,
}

impl Header {
    // ---
    /// Builds a header for a packet whose body (everything after the
    /// common header) is `body_len` bytes. `body_len` must be a multiple
    /// of 4.
    pub fn new(count: u8, packet_type: u8, body_len: usize) -> Self {
        // ---
        Self {
            version: RTCP_VERSION,
            padding: false,
            count: count & 0x1F,
            packet_type,
            length: (body_len / 4) as u16,
        }
    }

    /// Parses the first 4 bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns `TooShort` if fewer than 4 bytes are available. The version
    /// is not checked here, see [`is_rtcp`].
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        ensure_len(buf, HEADER_LENGTH)?;

        Ok(Self {
            version: buf[0] >> 6,
            padding: buf[0] & 0x20 != 0,
            count: buf[0] & 0x1F,
            packet_type: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
        })
    }

    /// Total size of the packet this header announces, header included.
    pub fn full_packet_size(&self) -> usize {
        // ---
        self.length as usize * 4 + 4
    }

    pub fn to_bytes(&self) -> [u8; HEADER_LENGTH] {
        // ---
        let length = self.length.to_be_bytes();
        [
            (self.version << 6) | (if self.padding { 0x20 } else { 0 }) | (self.count & 0x1F),
            self.packet_type,
            length[0],
            length[1],
        ]
    }

    /// Returns the body of the packet `buf` starts with: the bytes after
    /// the common header, up to the declared length, minus padding.
    ///
    /// # Errors
    ///
    /// Returns `LengthOverrun` if the declared size exceeds `buf`, and
    /// `TooShort` if the padding count is larger than the body.
    pub fn body<'a>(&self, buf: &'a [u8]) -> Result<&'a [u8]> {
        // ---
        let size = self.full_packet_size();
        if size > buf.len() {
            return Err(Error::LengthOverrun {
                declared: size,
                available: buf.len(),
            });
        }

        let mut end = size;
        if self.padding {
            let pad = buf[size - 1] as usize;
            if pad == 0 || pad > size - HEADER_LENGTH {
                return Err(Error::TooShort {
                    need: HEADER_LENGTH + pad,
                    have: size,
                });
            }
            end -= pad;
        }

        Ok(&buf[HEADER_LENGTH..end])
    }

    /// Checks that this header carries `packet_type` (and `fmt` when set).
    pub(crate) fn expect(&self, packet_type: u8, fmt: Option<u8>) -> Result<()> {
        // ---
        let fmt_ok = fmt.map_or(true, |f| f == self.count);
        if self.packet_type != packet_type || !fmt_ok {
            return Err(Error::WrongPacketType {
                packet_type: self.packet_type,
                fmt: self.count,
            });
        }
        Ok(())
    }
}

/// Distinguishes RTCP from RTP, STUN and DTLS on a multiplexed socket
/// (RFC 5761 / RFC 7983 ranges).
pub fn is_rtcp(header: &Header, first_byte: u8) -> bool {
    // ---
    header.version == RTCP_VERSION
        && (128..=191).contains(&first_byte)
        && (192..=213).contains(&header.packet_type)
}

/// Convenience wrapper over [`is_rtcp`] for a raw datagram.
pub fn is_rtcp_packet(buf: &[u8]) -> bool {
    // ---
    match Header::parse(buf) {
        Ok(header) => is_rtcp(&header, buf[0]),
        Err(_) => false,
    }
}

/// Appends a 32-bit big-endian value.
pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Reads a 32-bit big-endian value at `offset`. Callers check bounds.
pub(crate) fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}
