//! Transport layer (PT=205) and payload specific (PT=206) feedback
//! messages: RFC 4585 and RFC 5104.
//!
//! Every feedback packet starts with the same two SSRCs:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |V=2|P|   FMT   |       PT      |          length               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SSRC of packet sender                        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                  SSRC of media source                         |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! :            Feedback Control Information (FCI)                 :
//! ```

use super::header::{
    get_u32, put_u32, Header, FMT_AFB, FMT_FIR, FMT_NACK, FMT_PLI, FMT_SLI, FMT_TMMBN, FMT_TMMBR,
    FMT_TSTN, FMT_TSTR, PT_PSFB, PT_RTPFB,
};
use crate::error::{ensure_len, Result};
use std::fmt;

/// NACK FCI entries emitted by [`Nack::lost_between`].
pub const MAX_NACK_ENTRIES_PER_RANGE: usize = 3;

/// Parses the shared feedback prefix and returns (sender, media, fci).
fn parse_feedback(buf: &[u8], packet_type: u8, fmt: u8) -> Result<(u32, u32, &[u8])> {
    // ---
    let header = Header::parse(buf)?;
    header.expect(packet_type, Some(fmt))?;
    let body = header.body(buf)?;
    ensure_len(body, 8)?;

    Ok((get_u32(body, 0), get_u32(body, 4), &body[8..]))
}

/// Writes header and SSRC pair; `fci_len` must be a multiple of 4.
fn feedback_prefix(fmt: u8, packet_type: u8, sender: u32, media: u32, fci_len: usize) -> Vec<u8> {
    // ---
    let header = Header::new(fmt, packet_type, 8 + fci_len);
    let mut buf = Vec::with_capacity(header.full_packet_size());
    buf.extend_from_slice(&header.to_bytes());
    put_u32(&mut buf, sender);
    put_u32(&mut buf, media);
    buf
}

// ------------------------------------------------------------------------
// Generic NACK (RTPFB FMT=1)
// ------------------------------------------------------------------------

/// One NACK FCI entry: a packet id and a bitmask of the 16 following ids.
///
/// Bit `i` (least significant first) set means `pid + i + 1` is lost too.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NackPair {
    pub pid: u16,
    pub blp: u16,
}

impl NackPair {
    // ---
    pub fn new(pid: u16) -> Self {
        Self { pid, blp: 0 }
    }

    /// Marks `pid + offset` as lost. `offset` must be in `1..=16`.
    pub fn mark_lost(&mut self, offset: u16) {
        // ---
        if (1..=16).contains(&offset) {
            self.blp |= 1 << (offset - 1);
        }
    }

    /// All sequence numbers this entry reports as lost.
    pub fn sequences(&self) -> Vec<u16> {
        // ---
        let mut seqs = vec![self.pid];
        for bit in 0..16u16 {
            if self.blp & (1 << bit) != 0 {
                seqs.push(self.pid.wrapping_add(bit + 1));
            }
        }
        seqs
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Nack {
    // ---
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub pairs: Vec<NackPair>,
}

impl Nack {
    // ---
    pub fn new(sender_ssrc: u32, media_ssrc: u32) -> Self {
        // ---
        Self {
            sender_ssrc,
            media_ssrc,
            pairs: Vec::new(),
        }
    }

    /// Adds a single lost sequence number.
    pub fn lost(&mut self, seq: u16) {
        // ---
        self.pairs.push(NackPair::new(seq));
    }

    /// Replaces the entries with the range strictly between `from` and `to`.
    ///
    /// At most 3 entries (3 × 17 sequence numbers) are produced; a caller
    /// facing a wider gap has to issue another NACK for the remainder.
    pub fn lost_between(&mut self, from: u16, to: u16) {
        // ---
        self.pairs.clear();
        if from >= to {
            return;
        }

        let to = to as u32;
        let mut pid = from as u32 + 1;
        while self.pairs.len() < MAX_NACK_ENTRIES_PER_RANGE && pid < to {
            let mut pair = NackPair::new(pid as u16);
            let mut j = 1u32;
            while j < 17 && pid + j < to {
                pair.mark_lost(j as u16);
                j += 1;
            }
            self.pairs.push(pair);
            pid += j;
        }
    }

    /// All sequence numbers reported lost, in entry order.
    pub fn sequences(&self) -> Vec<u16> {
        // ---
        self.pairs.iter().flat_map(NackPair::sequences).collect()
    }

    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let (sender_ssrc, media_ssrc, fci) = parse_feedback(buf, PT_RTPFB, FMT_NACK)?;
        let pairs = fci
            .chunks_exact(4)
            .map(|c| NackPair {
                pid: u16::from_be_bytes([c[0], c[1]]),
                blp: u16::from_be_bytes([c[2], c[3]]),
            })
            .collect();

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            pairs,
        })
    }

    /// Serializes with length = 2 + number of FCI entries.
    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let mut buf = feedback_prefix(
            FMT_NACK,
            PT_RTPFB,
            self.sender_ssrc,
            self.media_ssrc,
            self.pairs.len() * 4,
        );
        for pair in &self.pairs {
            buf.extend_from_slice(&pair.pid.to_be_bytes());
            buf.extend_from_slice(&pair.blp.to_be_bytes());
        }
        buf
    }
}

impl fmt::Display for Nack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NACK sender={:#010x} media={:#010x} seqs={:?}",
            self.sender_ssrc,
            self.media_ssrc,
            self.sequences()
        )
    }
}

// ------------------------------------------------------------------------
// TMMBR / TMMBN (RTPFB FMT=3/4)
// ------------------------------------------------------------------------

/// TMMBR/TMMBN FCI entry.
///
/// ```text
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                              SSRC                             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// | MxTBR Exp |  MxTBR Mantissa                 |Measured Overhead|
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TmmbEntry {
    // ---
    pub ssrc: u32,

    /// 6 bits
    pub exp: u8,

    /// 17 bits
    pub mantissa: u32,

    /// 9 bits
    pub overhead: u16,
}

impl TmmbEntry {
    // ---
    pub fn bitrate(&self) -> u64 {
        (self.mantissa as u64) << self.exp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TmmbKind {
    Request,
    Notification,
}

impl TmmbKind {
    fn fmt(self) -> u8 {
        match self {
            TmmbKind::Request => FMT_TMMBR,
            TmmbKind::Notification => FMT_TMMBN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tmmb {
    // ---
    pub kind: TmmbKind,
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub entries: Vec<TmmbEntry>,
}

impl Tmmb {
    // ---
    pub fn parse(buf: &[u8], kind: TmmbKind) -> Result<Self> {
        // ---
        let (sender_ssrc, media_ssrc, fci) = parse_feedback(buf, PT_RTPFB, kind.fmt())?;
        let entries = fci
            .chunks_exact(8)
            .map(|c| {
                let word = get_u32(c, 4);
                TmmbEntry {
                    ssrc: get_u32(c, 0),
                    exp: (word >> 26) as u8,
                    mantissa: (word >> 9) & 0x1_FFFF,
                    overhead: (word & 0x1FF) as u16,
                }
            })
            .collect();

        Ok(Self {
            kind,
            sender_ssrc,
            media_ssrc,
            entries,
        })
    }

    /// Serializes with length = 2 + 2 per entry.
    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let mut buf = feedback_prefix(
            self.kind.fmt(),
            PT_RTPFB,
            self.sender_ssrc,
            self.media_ssrc,
            self.entries.len() * 8,
        );
        for entry in &self.entries {
            put_u32(&mut buf, entry.ssrc);
            put_u32(
                &mut buf,
                ((entry.exp as u32 & 0x3F) << 26)
                    | ((entry.mantissa & 0x1_FFFF) << 9)
                    | (entry.overhead as u32 & 0x1FF),
            );
        }
        buf
    }
}

// ------------------------------------------------------------------------
// PLI (PSFB FMT=1)
// ------------------------------------------------------------------------

/// Picture loss indication: no FCI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Pli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

impl Pli {
    // ---
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let (sender_ssrc, media_ssrc, _) = parse_feedback(buf, PT_PSFB, FMT_PLI)?;
        Ok(Self {
            sender_ssrc,
            media_ssrc,
        })
    }

    /// Always 12 bytes, length = 2.
    pub fn to_bytes(&self) -> Vec<u8> {
        feedback_prefix(FMT_PLI, PT_PSFB, self.sender_ssrc, self.media_ssrc, 0)
    }
}

// ------------------------------------------------------------------------
// SLI (PSFB FMT=2)
// ------------------------------------------------------------------------

/// Slice loss entry: first macroblock (13 bits), count (13 bits) and
/// picture id (6 bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SliEntry {
    pub first: u16,
    pub number: u16,
    pub picture_id: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sli {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub entries: Vec<SliEntry>,
}

impl Sli {
    // ---
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let (sender_ssrc, media_ssrc, fci) = parse_feedback(buf, PT_PSFB, FMT_SLI)?;
        let entries = fci
            .chunks_exact(4)
            .map(|c| {
                let word = get_u32(c, 0);
                SliEntry {
                    first: (word >> 19) as u16,
                    number: ((word >> 6) & 0x1FFF) as u16,
                    picture_id: (word & 0x3F) as u8,
                }
            })
            .collect();

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            entries,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let mut buf = feedback_prefix(
            FMT_SLI,
            PT_PSFB,
            self.sender_ssrc,
            self.media_ssrc,
            self.entries.len() * 4,
        );
        for e in &self.entries {
            put_u32(
                &mut buf,
                ((e.first as u32 & 0x1FFF) << 19)
                    | ((e.number as u32 & 0x1FFF) << 6)
                    | (e.picture_id as u32 & 0x3F),
            );
        }
        buf
    }
}

// ------------------------------------------------------------------------
// FIR (PSFB FMT=4)
// ------------------------------------------------------------------------

/// Full intra request entry: target SSRC and command sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirEntry {
    pub ssrc: u32,
    pub seq_nr: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fir {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub entries: Vec<FirEntry>,
}

impl Fir {
    // ---
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let (sender_ssrc, media_ssrc, fci) = parse_feedback(buf, PT_PSFB, FMT_FIR)?;
        let entries = fci
            .chunks_exact(8)
            .map(|c| FirEntry {
                ssrc: get_u32(c, 0),
                seq_nr: c[4],
            })
            .collect();

        Ok(Self {
            sender_ssrc,
            media_ssrc,
            entries,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let mut buf = feedback_prefix(
            FMT_FIR,
            PT_PSFB,
            self.sender_ssrc,
            self.media_ssrc,
            self.entries.len() * 8,
        );
        for e in &self.entries {
            put_u32(&mut buf, e.ssrc);
            buf.extend_from_slice(&[e.seq_nr, 0, 0, 0]);
        }
        buf
    }
}

// ------------------------------------------------------------------------
// TSTR / TSTN (PSFB FMT=5/6)
// ------------------------------------------------------------------------

/// Temporal-spatial trade-off entry; `index` is 5 bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TstEntry {
    pub ssrc: u32,
    pub seq_nr: u8,
    pub index: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TstKind {
    Request,
    Notification,
}

impl TstKind {
    fn fmt(self) -> u8 {
        match self {
            TstKind::Request => FMT_TSTR,
            TstKind::Notification => FMT_TSTN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tst {
    pub kind: TstKind,
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub entries: Vec<TstEntry>,
}

impl Tst {
    // ---
    pub fn parse(buf: &[u8], kind: TstKind) -> Result<Self> {
        // ---
        let (sender_ssrc, media_ssrc, fci) = parse_feedback(buf, PT_PSFB, kind.fmt())?;
        let entries = fci
            .chunks_exact(8)
            .map(|c| TstEntry {
                ssrc: get_u32(c, 0),
                seq_nr: c[4],
                index: c[7] & 0x1F,
            })
            .collect();

        Ok(Self {
            kind,
            sender_ssrc,
            media_ssrc,
            entries,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let mut buf = feedback_prefix(
            self.kind.fmt(),
            PT_PSFB,
            self.sender_ssrc,
            self.media_ssrc,
            self.entries.len() * 8,
        );
        for e in &self.entries {
            put_u32(&mut buf, e.ssrc);
            buf.extend_from_slice(&[e.seq_nr, 0, 0, e.index & 0x1F]);
        }
        buf
    }
}

// ------------------------------------------------------------------------
// Application layer feedback (PSFB FMT=15)
// ------------------------------------------------------------------------

/// Generic AFB with an opaque FCI (anything that is not a REMB).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Afb {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub fci: Vec<u8>,
}

impl Afb {
    // ---
    /// Parses an AFB packet. The FCI is kept in whole 32-bit words: when
    /// RTCP padding leaves a partial word, it is zero-filled the way
    /// [`Afb::to_bytes`] writes it.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let (sender_ssrc, media_ssrc, fci) = parse_feedback(buf, PT_PSFB, FMT_AFB)?;
        let mut fci = fci.to_vec();
        fci.resize((fci.len() + 3) & !3, 0);
        Ok(Self {
            sender_ssrc,
            media_ssrc,
            fci,
        })
    }

    /// Serializes the FCI zero-padded to a 32-bit boundary.
    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let padded = (self.fci.len() + 3) & !3;
        let mut buf = feedback_prefix(FMT_AFB, PT_PSFB, self.sender_ssrc, self.media_ssrc, padded);
        buf.extend_from_slice(&self.fci);
        buf.resize(buf.len() + padded - self.fci.len(), 0);
        buf
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_nack_mark_lost_bit_order() {
        // ---
        let mut pair = NackPair::new(100);
        pair.mark_lost(1);
        pair.mark_lost(16);
        assert_eq!(pair.blp, 0x8001);
        assert_eq!(pair.sequences(), vec![100, 101, 116]);

        // out of range offsets are ignored
        pair.mark_lost(0);
        pair.mark_lost(17);
        assert_eq!(pair.blp, 0x8001);
    }

    #[test]
    fn test_nack_roundtrip() {
        // ---
        let mut nack = Nack::new(0, 0xDEADBEEF);
        nack.lost(42);
        nack.lost(65535);
        let bytes = nack.to_bytes();

        assert_eq!(Header::parse(&bytes).unwrap().length, 2 + 2);
        assert_eq!(Nack::parse(&bytes).unwrap(), nack);
        assert_eq!(nack.sequences(), vec![42, 65535]);
    }

    #[test]
    fn test_nack_lost_between_small_gap() {
        // ---
        let mut nack = Nack::new(0, 1);
        nack.lost_between(10, 14);
        assert_eq!(nack.pairs.len(), 1);
        assert_eq!(nack.sequences(), vec![11, 12, 13]);
    }

    #[test]
    fn test_nack_lost_between_is_capped_at_three_entries() {
        // ---
        // The range builder only covers 3 x 17 sequence numbers; the rest of
        // a wider gap has to be requested by a later NACK.
        let mut nack = Nack::new(0, 1);
        nack.lost_between(0, 200);

        assert_eq!(nack.pairs.len(), MAX_NACK_ENTRIES_PER_RANGE);
        let seqs = nack.sequences();
        assert_eq!(seqs.len(), 51);
        assert_eq!(seqs.first(), Some(&1));
        assert_eq!(seqs.last(), Some(&51));
    }

    #[test]
    fn test_nack_lost_between_empty_range() {
        // ---
        let mut nack = Nack::new(0, 1);
        nack.lost(7);
        nack.lost_between(5, 5);
        assert!(nack.pairs.is_empty());
        nack.lost_between(5, 6);
        assert!(nack.pairs.is_empty());
    }

    #[test]
    fn test_tmmbr_roundtrip() {
        // ---
        let tmmbr = Tmmb {
            kind: TmmbKind::Request,
            sender_ssrc: 1,
            media_ssrc: 2,
            entries: vec![TmmbEntry {
                ssrc: 3,
                exp: 5,
                mantissa: 0x1_2345,
                overhead: 40,
            }],
        };
        let bytes = tmmbr.to_bytes();

        assert_eq!(Header::parse(&bytes).unwrap().length, 2 + 2);
        assert_eq!(Tmmb::parse(&bytes, TmmbKind::Request).unwrap(), tmmbr);
        assert!(Tmmb::parse(&bytes, TmmbKind::Notification).is_err());
        assert_eq!(tmmbr.entries[0].bitrate(), 0x1_2345 << 5);
    }

    #[test]
    fn test_pli_bytes() {
        // ---
        let pli = Pli {
            sender_ssrc: 0,
            media_ssrc: 0x01020304,
        };
        let bytes = pli.to_bytes();
        assert_eq!(bytes, vec![0x81, 206, 0, 2, 0, 0, 0, 0, 1, 2, 3, 4]);
        assert_eq!(Pli::parse(&bytes).unwrap(), pli);
    }

    #[test]
    fn test_sli_roundtrip() {
        // ---
        let sli = Sli {
            sender_ssrc: 1,
            media_ssrc: 2,
            entries: vec![SliEntry {
                first: 0x1ABC,
                number: 0x0123,
                picture_id: 0x2A,
            }],
        };
        assert_eq!(Sli::parse(&sli.to_bytes()).unwrap(), sli);
    }

    #[test]
    fn test_fir_seq_nr_position() {
        // ---
        let fir = Fir {
            sender_ssrc: 1,
            media_ssrc: 0,
            entries: vec![FirEntry {
                ssrc: 0xAABBCCDD,
                seq_nr: 7,
            }],
        };
        let bytes = fir.to_bytes();
        assert_eq!(&bytes[12..20], &[0xAA, 0xBB, 0xCC, 0xDD, 7, 0, 0, 0]);
        assert_eq!(Fir::parse(&bytes).unwrap(), fir);
    }

    #[test]
    fn test_tstn_roundtrip() {
        // ---
        let tstn = Tst {
            kind: TstKind::Notification,
            sender_ssrc: 1,
            media_ssrc: 0,
            entries: vec![TstEntry {
                ssrc: 9,
                seq_nr: 3,
                index: 17,
            }],
        };
        assert_eq!(Tst::parse(&tstn.to_bytes(), TstKind::Notification).unwrap(), tstn);
    }

    #[test]
    fn test_afb_pads_fci() {
        // ---
        let afb = Afb {
            sender_ssrc: 1,
            media_ssrc: 0,
            fci: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let bytes = afb.to_bytes();
        assert_eq!(bytes.len(), 20);
        assert_eq!(Afb::parse(&bytes).unwrap(), afb);
    }

    #[test]
    fn test_afb_from_padded_packet_keeps_whole_words() {
        // ---
        // 5 FCI bytes then 3 bytes of RTCP padding, count in the last one
        let mut bytes = feedback_prefix(FMT_AFB, PT_PSFB, 1, 0, 8);
        bytes[0] |= 0x20;
        bytes.extend_from_slice(&[1, 2, 3, 4, 5, 0, 0, 3]);

        let afb = Afb::parse(&bytes).unwrap();
        assert_eq!(afb.fci, vec![1, 2, 3, 4, 5, 0, 0, 0]);

        let reparsed = Afb::parse(&afb.to_bytes()).unwrap();
        assert_eq!(reparsed, afb);
    }

    #[test]
    fn test_feedback_too_short() {
        // ---
        // PLI header announcing 1 word only: missing media SSRC
        let bytes = [0x81, 206, 0, 1, 0, 0, 0, 0];
        assert!(Pli::parse(&bytes).is_err());
    }
}
