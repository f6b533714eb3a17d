//! Receiver estimated maximum bitrate: an AFB (PT=206, FMT=15) whose FCI
//! starts with the ASCII marker "REMB".
//!
//! ```text
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Unique identifier 'R' 'E' 'M' 'B'                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Num SSRC     | BR Exp    |  BR Mantissa                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   SSRC feedback                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use super::header::{get_u32, put_u32, Header, FMT_AFB, PT_PSFB};
use crate::error::{ensure_len, Error, Result};
use std::fmt;

pub const REMB_IDENTIFIER: &[u8; 4] = b"REMB";

/// Largest value the 18-bit mantissa can hold.
pub const MAX_MANTISSA: u32 = 0x3_FFFF;

/// True when an AFB FCI carries the REMB marker.
pub fn is_remb_fci(fci: &[u8]) -> bool {
    fci.len() >= 4 && &fci[..4] == REMB_IDENTIFIER
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Remb {
    // ---
    pub sender_ssrc: u32,

    /// Always 0 on the wire for REMB
    pub media_ssrc: u32,

    /// 6 bits
    pub exp: u8,

    /// 18 bits
    pub mantissa: u32,

    pub ssrcs: Vec<u32>,
}

impl Remb {
    // ---
    pub fn new(sender_ssrc: u32, bitrate: u64, ssrcs: Vec<u32>) -> Self {
        // ---
        let mut remb = Self {
            sender_ssrc,
            media_ssrc: 0,
            exp: 0,
            mantissa: 0,
            ssrcs,
        };
        remb.set_bitrate(bitrate);
        remb
    }

    /// Encodes `bitrate` (bits/s), shifting the mantissa right until it
    /// fits 18 bits. Precision below `1 << exp` is lost.
    pub fn set_bitrate(&mut self, bitrate: u64) {
        // ---
        let mut mantissa = bitrate;
        let mut exp = 0u8;
        while mantissa > MAX_MANTISSA as u64 {
            mantissa >>= 1;
            exp += 1;
        }
        self.mantissa = mantissa as u32;
        self.exp = exp;
    }

    /// Decoded bitrate in bits/s, `mantissa << exp`.
    pub fn bitrate(&self) -> u64 {
        // ---
        (self.mantissa as u64)
            .checked_shl(self.exp as u32)
            .filter(|b| b >> self.exp == self.mantissa as u64)
            .unwrap_or(u64::MAX)
    }

    /// Parses a full REMB packet.
    ///
    /// # Errors
    ///
    /// `MissingRembIdentifier` if the AFB FCI is not a REMB, `TooShort`
    /// if the SSRC list is truncated.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let header = Header::parse(buf)?;
        header.expect(PT_PSFB, Some(FMT_AFB))?;
        let body = header.body(buf)?;
        ensure_len(body, 8)?;

        let fci = &body[8..];
        if !is_remb_fci(fci) {
            return Err(Error::MissingRembIdentifier);
        }
        ensure_len(fci, 8)?;

        let num_ssrc = fci[4] as usize;
        ensure_len(fci, 8 + num_ssrc * 4)?;

        Ok(Self {
            sender_ssrc: get_u32(body, 0),
            media_ssrc: get_u32(body, 4),
            exp: fci[5] >> 2,
            mantissa: u32::from_be_bytes([0, fci[5] & 0x03, fci[6], fci[7]]),
            ssrcs: (0..num_ssrc).map(|i| get_u32(fci, 8 + i * 4)).collect(),
        })
    }

    /// Header with length = 2 + 2 + number of SSRCs.
    pub fn header(&self) -> Header {
        // ---
        let ssrcs = self.ssrcs.len().min(u8::MAX as usize);
        Header::new(FMT_AFB, PT_PSFB, 8 + 8 + ssrcs * 4)
    }

    /// Serializes at most 255 SSRCs (the count is one byte).
    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let header = self.header();
        let ssrcs = &self.ssrcs[..self.ssrcs.len().min(u8::MAX as usize)];

        let mut buf = Vec::with_capacity(header.full_packet_size());
        buf.extend_from_slice(&header.to_bytes());
        put_u32(&mut buf, self.sender_ssrc);
        put_u32(&mut buf, self.media_ssrc);
        buf.extend_from_slice(REMB_IDENTIFIER);
        buf.push(ssrcs.len() as u8);

        let mantissa = self.mantissa & MAX_MANTISSA;
        buf.push(((self.exp & 0x3F) << 2) | (mantissa >> 16) as u8);
        buf.extend_from_slice(&(mantissa as u16).to_be_bytes());
        for ssrc in ssrcs {
            put_u32(&mut buf, *ssrc);
        }
        buf
    }
}

impl fmt::Display for Remb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "REMB sender={:#010x} exp={} mantissa={} bitrate={} ssrcs={:x?}",
            self.sender_ssrc,
            self.exp,
            self.mantissa,
            self.bitrate(),
            self.ssrcs
        )
    }
}
