//! Source description (PT=202, RFC 3550 §6.5).

use super::header::{get_u32, put_u32, Header, MAX_COUNT, PT_SDES};
use crate::error::{ensure_len, Error, Result};
use std::fmt;

/// SDES item types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SdesItemType {
    End = 0,
    Cname = 1,
    Name = 2,
    Email = 3,
    Phone = 4,
    Loc = 5,
    Tool = 6,
    Note = 7,
    Priv = 8,
}

impl TryFrom<u8> for SdesItemType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        // ---
        Ok(match value {
            0 => SdesItemType::End,
            1 => SdesItemType::Cname,
            2 => SdesItemType::Name,
            3 => SdesItemType::Email,
            4 => SdesItemType::Phone,
            5 => SdesItemType::Loc,
            6 => SdesItemType::Tool,
            7 => SdesItemType::Note,
            8 => SdesItemType::Priv,
            other => return Err(Error::UnknownSdesItem(other)),
        })
    }
}

/// One SDES item. For `Priv` the text holds the raw prefix-length,
/// prefix and value bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesItem {
    pub item_type: SdesItemType,
    pub text: Vec<u8>,
}

/// Items describing one source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    // ---
    pub ssrc: u32,
    pub items: Vec<SdesItem>,
}

impl SdesChunk {
    // ---
    /// Wire size: SSRC, items, then at least one null octet, padded to 32 bits.
    fn size(&self) -> usize {
        // ---
        let items: usize = self.items.iter().map(|i| 2 + i.text.len()).sum();
        (4 + items + 1 + 3) & !3
    }

    /// Parses one chunk, returning it and the number of bytes consumed.
    fn parse(buf: &[u8]) -> Result<(Self, usize)> {
        // ---
        ensure_len(buf, 4)?;
        let ssrc = get_u32(buf, 0);
        let mut items = Vec::new();
        let mut offset = 4;

        loop {
            ensure_len(buf, offset + 1)?;
            let item_type = SdesItemType::try_from(buf[offset])?;
            if item_type == SdesItemType::End {
                // null item, then pad to the next 32-bit boundary
                offset = (offset + 1 + 3) & !3;
                break;
            }

            ensure_len(buf, offset + 2)?;
            let len = buf[offset + 1] as usize;
            ensure_len(buf, offset + 2 + len)?;
            items.push(SdesItem {
                item_type,
                text: buf[offset + 2..offset + 2 + len].to_vec(),
            });
            offset += 2 + len;
        }

        Ok((Self { ssrc, items }, offset.min(buf.len())))
    }

    fn write_to(&self, buf: &mut Vec<u8>) {
        // ---
        let start = buf.len();
        put_u32(buf, self.ssrc);
        for item in &self.items {
            let len = item.text.len().min(u8::MAX as usize);
            buf.push(item.item_type as u8);
            buf.push(len as u8);
            buf.extend_from_slice(&item.text[..len]);
        }
        buf.push(SdesItemType::End as u8);
        while (buf.len() - start) % 4 != 0 {
            buf.push(0);
        }
    }
}

/// Source description packet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceDescription {
    pub chunks: Vec<SdesChunk>,
}

impl SourceDescription {
    // ---
    /// Single-chunk SDES carrying a CNAME.
    pub fn with_cname(ssrc: u32, cname: &str) -> Self {
        // ---
        Self {
            chunks: vec![SdesChunk {
                ssrc,
                items: vec![SdesItem {
                    item_type: SdesItemType::Cname,
                    text: cname.as_bytes().to_vec(),
                }],
            }],
        }
    }

    /// Parses a full SDES packet (header included).
    ///
    /// # Errors
    ///
    /// Fails on truncated chunks and on item types outside 0..=8.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        // ---
        let header = Header::parse(buf)?;
        header.expect(PT_SDES, None)?;
        let body = header.body(buf)?;

        let mut chunks = Vec::with_capacity(header.count as usize);
        let mut offset = 0;
        for _ in 0..header.count {
            let (chunk, used) = SdesChunk::parse(&body[offset..])?;
            chunks.push(chunk);
            offset += used;
        }

        Ok(Self { chunks })
    }

    pub fn header(&self) -> Header {
        // ---
        let chunks = self.chunks.len().min(MAX_COUNT);
        let body: usize = self.chunks[..chunks].iter().map(SdesChunk::size).sum();
        Header::new(chunks as u8, PT_SDES, body)
    }

    /// Serializes at most 31 chunks; item text longer than 255 bytes is cut.
    pub fn to_bytes(&self) -> Vec<u8> {
        // ---
        let header = self.header();
        let mut buf = Vec::with_capacity(header.full_packet_size());
        buf.extend_from_slice(&header.to_bytes());
        for chunk in self.chunks.iter().take(MAX_COUNT) {
            chunk.write_to(&mut buf);
        }
        buf
    }

    /// First CNAME found, if any.
    pub fn cname(&self) -> Option<String> {
        // ---
        self.chunks
            .iter()
            .flat_map(|c| c.items.iter())
            .find(|i| i.item_type == SdesItemType::Cname)
            .map(|i| String::from_utf8_lossy(&i.text).into_owned())
    }
}

impl fmt::Display for SourceDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SDES chunks={}", self.chunks.len())?;
        if let Some(cname) = self.cname() {
            write!(f, " cname={cname}")?;
        }
        Ok(())
    }
}
