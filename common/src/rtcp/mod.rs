//! RTCP packet family (RFC 3550, RFC 4585, RFC 5104, REMB draft).
//!
//! Every packet type is a plain struct holding its typed fields; the
//! common header is recomputed from those fields on serialization, so
//! `parse(to_bytes(x)) == x` for any packet built in range.

pub mod bye;
pub mod feedback;
pub mod header;
pub mod parser;
pub mod remb;
pub mod report;
pub mod sdes;

pub use bye::Goodbye;
pub use feedback::{
    Afb, Fir, FirEntry, Nack, NackPair, Pli, Sli, SliEntry, Tmmb, TmmbEntry, TmmbKind, Tst,
    TstEntry, TstKind,
};
pub use header::{is_rtcp, is_rtcp_packet, Header};
pub use parser::parse_compound;
pub use remb::Remb;
pub use report::{ntp_time, ReceiverReport, ReportBlock, SenderInfo, SenderReport};
pub use sdes::{SdesChunk, SdesItem, SdesItemType, SourceDescription};

use std::fmt;

/// One packet of a (possibly compound) RTCP datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    ReceiverReport(ReceiverReport),
    SourceDescription(SourceDescription),
    Goodbye(Goodbye),
    Nack(Nack),
    Tmmb(Tmmb),
    Pli(Pli),
    Sli(Sli),
    Fir(Fir),
    Tst(Tst),
    Afb(Afb),
    Remb(Remb),
}

impl RtcpPacket {
    // ---
    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        match self {
            RtcpPacket::SenderReport(p) => p.to_bytes(),
            RtcpPacket::ReceiverReport(p) => p.to_bytes(),
            RtcpPacket::SourceDescription(p) => p.to_bytes(),
            RtcpPacket::Goodbye(p) => p.to_bytes(),
            RtcpPacket::Nack(p) => p.to_bytes(),
            RtcpPacket::Tmmb(p) => p.to_bytes(),
            RtcpPacket::Pli(p) => p.to_bytes(),
            RtcpPacket::Sli(p) => p.to_bytes(),
            RtcpPacket::Fir(p) => p.to_bytes(),
            RtcpPacket::Tst(p) => p.to_bytes(),
            RtcpPacket::Afb(p) => p.to_bytes(),
            RtcpPacket::Remb(p) => p.to_bytes(),
        }
    }

    /// Short name used in logs and metric labels.
    pub fn kind(&self) -> &'static str {
        // ---
        match self {
            RtcpPacket::SenderReport(_) => "sr",
            RtcpPacket::ReceiverReport(_) => "rr",
            RtcpPacket::SourceDescription(_) => "sdes",
            RtcpPacket::Goodbye(_) => "bye",
            RtcpPacket::Nack(_) => "nack",
            RtcpPacket::Tmmb(t) if t.kind == TmmbKind::Request => "tmmbr",
            RtcpPacket::Tmmb(_) => "tmmbn",
            RtcpPacket::Pli(_) => "pli",
            RtcpPacket::Sli(_) => "sli",
            RtcpPacket::Fir(_) => "fir",
            RtcpPacket::Tst(t) if t.kind == TstKind::Request => "tstr",
            RtcpPacket::Tst(_) => "tstn",
            RtcpPacket::Afb(_) => "afb",
            RtcpPacket::Remb(_) => "remb",
        }
    }
}

/// Concatenates packets into one compound datagram.
pub fn compound_bytes(packets: &[RtcpPacket]) -> Vec<u8> {
    // ---
    packets.iter().flat_map(RtcpPacket::to_bytes).collect()
}

impl fmt::Display for RtcpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RtcpPacket::SenderReport(p) => write!(f, "{p}"),
            RtcpPacket::ReceiverReport(p) => write!(f, "{p}"),
            RtcpPacket::SourceDescription(p) => write!(f, "{p}"),
            RtcpPacket::Goodbye(p) => write!(f, "{p}"),
            RtcpPacket::Nack(p) => write!(f, "{p}"),
            RtcpPacket::Remb(p) => write!(f, "{p}"),
            RtcpPacket::Pli(p) => write!(
                f,
                "PLI sender={:#010x} media={:#010x}",
                p.sender_ssrc, p.media_ssrc
            ),
            RtcpPacket::Fir(p) => write!(
                f,
                "FIR sender={:#010x} entries={:?}",
                p.sender_ssrc, p.entries
            ),
            other => write!(f, "{}", other.kind().to_uppercase()),
        }
    }
}
