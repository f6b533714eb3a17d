//! Codec-specific payload inspection for key-frame gating.
//!
//! Offsets are relative to the start of the RTP payload (after the CSRC
//! list and any header extension). Every read is bounds-checked; a short
//! payload is never a key frame.

use crate::rtp::RtpPacket;

/// H.264 STAP-A aggregation unit (carries SPS/PPS ahead of an IDR).
pub const H264_NAL_STAP_A: u8 = 24;

/// H.264 FU-A fragmentation unit.
pub const H264_NAL_FU_A: u8 = 28;

/// Video codec carried by a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoCodec {
    H264,
    Vp8,
}

/// NAL unit type of the first payload byte.
pub fn h264_nal_type(p: &RtpPacket) -> Option<u8> {
    // ---
    p.payload().first().map(|b| b & 0x1F)
}

/// H.264 key-frame start as seen by the publisher: a STAP-A unit.
pub fn is_h264_key_frame(p: &RtpPacket) -> bool {
    h264_nal_type(p) == Some(H264_NAL_STAP_A)
}

/// VP8 key frame: the P bit of the VP8 payload header is 0.
///
/// Assumes the 4-byte payload descriptor written by browsers (X, I and M
/// set, 15-bit picture id), so the VP8 header starts at payload byte 4.
pub fn is_vp8_key_frame(p: &RtpPacket) -> bool {
    // ---
    p.payload().get(4).is_some_and(|b| b & 0x01 == 0)
}

/// VP8 picture id from the payload descriptor: 7 bits when the M bit of
/// byte 2 is clear, 15 bits otherwise.
pub fn vp8_picture_id(p: &RtpPacket) -> Option<u16> {
    // ---
    let payload = p.payload();
    let first = *payload.get(2)?;
    if first & 0x80 == 0 {
        return Some(first as u16);
    }
    let second = *payload.get(3)?;
    Some(u16::from_be_bytes([first, second]) & 0x7FFF)
}

impl VideoCodec {
    // ---
    /// Key-frame test used by the publisher jitter buffer.
    pub fn is_key_frame(self, p: &RtpPacket) -> bool {
        // ---
        match self {
            VideoCodec::H264 => is_h264_key_frame(p),
            VideoCodec::Vp8 => is_vp8_key_frame(p),
        }
    }

    /// Key-frame test used by the listener: an H.264 FU-A also opens the
    /// gate since encoders fragment large IDR slices.
    pub fn opens_listener_gate(self, p: &RtpPacket) -> bool {
        // ---
        match self {
            VideoCodec::H264 => matches!(
                h264_nal_type(p),
                Some(H264_NAL_STAP_A) | Some(H264_NAL_FU_A)
            ),
            VideoCodec::Vp8 => is_vp8_key_frame(p),
        }
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        // ---
        match s.to_ascii_lowercase().as_str() {
            "h264" => Ok(VideoCodec::H264),
            "vp8" => Ok(VideoCodec::Vp8),
            other => anyhow::bail!("unknown video codec {other:?}, expected h264 or vp8"),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn with_payload(payload: &[u8]) -> RtpPacket {
        RtpPacket::new(96, 1, 0, 1, false, payload)
    }

    #[test]
    fn test_h264_stap_a_is_key_frame() {
        // ---
        assert!(is_h264_key_frame(&with_payload(&[0x78, 0, 1])));
        assert!(!is_h264_key_frame(&with_payload(&[0x41, 0, 1])));
        assert!(!is_h264_key_frame(&with_payload(&[])));
    }

    #[test]
    fn test_listener_gate_accepts_fu_a() {
        // ---
        let fu_a = with_payload(&[0x7C, 0x85]);
        assert!(!VideoCodec::H264.is_key_frame(&fu_a));
        assert!(VideoCodec::H264.opens_listener_gate(&fu_a));
    }

    #[test]
    fn test_vp8_key_frame_bit() {
        // ---
        // descriptor 0x90 0x80 0x81 0x23, then VP8 header with P=0
        let key = with_payload(&[0x90, 0x80, 0x81, 0x23, 0x10, 0x02]);
        let delta = with_payload(&[0x90, 0x80, 0x81, 0x23, 0x11, 0x02]);
        assert!(is_vp8_key_frame(&key));
        assert!(!is_vp8_key_frame(&delta));
        assert!(!is_vp8_key_frame(&with_payload(&[0x90, 0x80])));
    }

    #[test]
    fn test_vp8_picture_id_widths() {
        // ---
        assert_eq!(
            vp8_picture_id(&with_payload(&[0x90, 0x80, 0x81, 0x23])),
            Some(0x0123)
        );
        assert_eq!(vp8_picture_id(&with_payload(&[0x90, 0x80, 0x45])), Some(0x45));
        assert_eq!(vp8_picture_id(&with_payload(&[0x90, 0x80, 0x81])), None);
    }

    #[test]
    fn test_codec_from_str() {
        // ---
        assert_eq!("VP8".parse::<VideoCodec>().unwrap(), VideoCodec::Vp8);
        assert!("av1".parse::<VideoCodec>().is_err());
    }
}
