//! Errors raised while decoding RTP/RTCP wire data.
//!
//! Malformed input is never fatal: callers log the error and drop the
//! offending packet (or the rest of a compound packet).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Buffer is shorter than the fixed part of the structure.
    #[error("packet too short: need {need} bytes, have {have}")]
    TooShort { need: usize, have: usize },

    /// Version field is not 2.
    #[error("invalid version {0}, expected 2")]
    BadVersion(u8),

    /// Declared RTCP length reads past the end of the buffer.
    #[error("declared length {declared} overruns remaining {available} bytes")]
    LengthOverrun { declared: usize, available: usize },

    /// Packet type / FMT does not match the structure being parsed.
    #[error("wrong packet type {packet_type} (fmt {fmt})")]
    WrongPacketType { packet_type: u8, fmt: u8 },

    /// SDES item type outside 0..=8.
    #[error("unknown SDES item type {0}")]
    UnknownSdesItem(u8),

    /// AFB packet whose FCI does not start with "REMB".
    #[error("missing REMB identifier")]
    MissingRembIdentifier,

    /// More entries than the 5-bit count field (or a u8 length) can carry.
    #[error("too many items: {0}")]
    TooManyItems(usize),

    /// P bit set with a padding count of zero or larger than the payload.
    #[error("invalid padding count {count} for {available} bytes after the header")]
    BadPadding { count: usize, available: usize },

    /// RTX packet without room for the original sequence number.
    #[error("invalid RTX packet: {0}")]
    InvalidRtx(&'static str),
}

/// Returns `TooShort` unless `buf` holds at least `need` bytes.
pub(crate) fn ensure_len(buf: &[u8], need: usize) -> Result<()> {
    // ---
    if buf.len() < need {
        return Err(Error::TooShort {
            need,
            have: buf.len(),
        });
    }
    Ok(())
}
