//! Goodbye (PT=203, RFC 3550 §6.6).

use super::header::{get_u32, put_u32, Header, MAX_COUNT, PT_BYE};
use crate::error::{ensure_len, Result};
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Goodbye {
    // ---
    pub sources: Vec<u32>,

    /// Optional reason for leaving, at most 255 bytes on the wire
    pub reason: Option<String>,
}

impl Goodbye {
    // ---
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let header = Header::parse(buf)?;
        header.expect(PT_BYE, None)?;
        let body = header.body(buf)?;

        let count = header.count as usize;
        ensure_len(body, count * 4)?;
        let sources = (0..count).map(|i| get_u32(body, i * 4)).collect();

        let rest = &body[count * 4..];
        let reason = match rest.first() {
            Some(&len) if len > 0 => {
                ensure_len(rest, 1 + len as usize)?;
                Some(String::from_utf8_lossy(&rest[1..1 + len as usize]).into_owned())
            }
            _ => None,
        };

        Ok(Self { sources, reason })
    }

    fn reason_bytes(&self) -> &[u8] {
        // ---
        let bytes = self.reason.as_deref().unwrap_or("").as_bytes();
        &bytes[..bytes.len().min(u8::MAX as usize)]
    }

    pub fn header(&self) -> Header {
        // ---
        let sources = self.sources.len().min(MAX_COUNT);
        let reason = self.reason_bytes().len();
        let reason_words = if reason == 0 { 0 } else { (1 + reason + 3) & !3 };
        Header::new(sources as u8, PT_BYE, sources * 4 + reason_words)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let header = self.header();
        let mut buf = Vec::with_capacity(header.full_packet_size());
        buf.extend_from_slice(&header.to_bytes());
        for ssrc in self.sources.iter().take(MAX_COUNT) {
            put_u32(&mut buf, *ssrc);
        }

        let reason = self.reason_bytes();
        if !reason.is_empty() {
            buf.push(reason.len() as u8);
            buf.extend_from_slice(reason);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        }
        buf
    }
}

impl fmt::Display for Goodbye {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BYE sources={:x?}", self.sources)?;
        if let Some(reason) = &self.reason {
            write!(f, " reason={reason:?}")?;
        }
        Ok(())
    }
}
