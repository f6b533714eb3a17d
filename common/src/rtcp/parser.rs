//! Compound RTCP datagram parsing.

use super::feedback::{Afb, Fir, Nack, Pli, Sli, Tmmb, TmmbKind, Tst, TstKind};
use super::header::{
    Header, FMT_AFB, FMT_FIR, FMT_NACK, FMT_PLI, FMT_SLI, FMT_TMMBN, FMT_TMMBR, FMT_TSTN, FMT_TSTR,
    PT_BYE, PT_PSFB, PT_RR, PT_RTPFB, PT_SDES, PT_SR,
};
use super::remb::{is_remb_fci, Remb};
use super::report::{ReceiverReport, SenderReport};
use super::sdes::SourceDescription;
use super::{Goodbye, RtcpPacket};
use crate::error::{Error, Result};
use tracing::{trace, warn};

/// Parses packets back-to-back until `buf` is exhausted.
///
/// Returns every packet decoded so far together with the first error.
/// A packet whose declared size overruns the remaining bytes, or that
/// fails to decode, stops the walk: the rest of the datagram is abandoned.
/// Packet types this core does not handle (APP, legacy FIR/NACK, RPSI and
/// the other unimplemented feedback formats) are skipped with a warning.
pub fn parse_compound(buf: &[u8]) -> (Vec<RtcpPacket>, Option<Error>) {
    // ---
    let mut packets = Vec::new();
    let mut rest = buf;

    while !rest.is_empty() {
        let header = match Header::parse(rest) {
            Ok(h) => h,
            Err(e) => return (packets, Some(e)),
        };

        let size = header.full_packet_size();
        if size > rest.len() {
            return (
                packets,
                Some(Error::LengthOverrun {
                    declared: size,
                    available: rest.len(),
                }),
            );
        }

        let (current, tail) = rest.split_at(size);
        match parse_one(&header, current) {
            Ok(Some(packet)) => {
                trace!("RTCP <- {}", packet);
                packets.push(packet);
            }
            Ok(None) => {
                warn!(
                    "Skipping unhandled RTCP packet type={} fmt={}",
                    header.packet_type, header.count
                );
            }
            Err(e) => return (packets, Some(e)),
        }
        rest = tail;
    }

    (packets, None)
}

/// Like [`parse_compound`] but fails on the first error.
pub fn parse_compound_strict(buf: &[u8]) -> Result<Vec<RtcpPacket>> {
    // ---
    match parse_compound(buf) {
        (packets, None) => Ok(packets),
        (_, Some(e)) => Err(e),
    }
}

fn parse_one(header: &Header, buf: &[u8]) -> Result<Option<RtcpPacket>> {
    // ---
    let packet = match (header.packet_type, header.count) {
        (PT_SR, _) => RtcpPacket::SenderReport(SenderReport::parse(buf)?),
        (PT_RR, _) => RtcpPacket::ReceiverReport(ReceiverReport::parse(buf)?),
        (PT_SDES, _) => RtcpPacket::SourceDescription(SourceDescription::parse(buf)?),
        (PT_BYE, _) => RtcpPacket::Goodbye(Goodbye::parse(buf)?),

        (PT_RTPFB, FMT_NACK) => RtcpPacket::Nack(Nack::parse(buf)?),
        (PT_RTPFB, FMT_TMMBR) => RtcpPacket::Tmmb(Tmmb::parse(buf, TmmbKind::Request)?),
        (PT_RTPFB, FMT_TMMBN) => RtcpPacket::Tmmb(Tmmb::parse(buf, TmmbKind::Notification)?),

        (PT_PSFB, FMT_PLI) => RtcpPacket::Pli(Pli::parse(buf)?),
        (PT_PSFB, FMT_SLI) => RtcpPacket::Sli(Sli::parse(buf)?),
        (PT_PSFB, FMT_FIR) => RtcpPacket::Fir(Fir::parse(buf)?),
        (PT_PSFB, FMT_TSTR) => RtcpPacket::Tst(Tst::parse(buf, TstKind::Request)?),
        (PT_PSFB, FMT_TSTN) => RtcpPacket::Tst(Tst::parse(buf, TstKind::Notification)?),
        (PT_PSFB, FMT_AFB) => {
            // REMB marker sits after the two SSRCs
            let body = header.body(buf)?;
            if body.len() >= 8 && is_remb_fci(&body[8..]) {
                RtcpPacket::Remb(Remb::parse(buf)?)
            } else {
                RtcpPacket::Afb(Afb::parse(buf)?)
            }
        }

        _ => return Ok(None),
    };
    Ok(Some(packet))
}
