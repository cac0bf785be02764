//! Netlink-style TLV decoding for datapath flow keys.
//!
//! Each attribute is a 4-byte header (`u16` length including the header,
//! `u16` type, both in the producing host's byte order) followed by the
//! payload; the next attribute starts at the 4-byte-aligned end of the
//! declared region. Flow keys arrive capacity-truncated, so the decoder never
//! fails: it stops at the first thing it cannot read and reports why.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::registry;

/// Size of the attribute header.
pub const NLA_HDRLEN: usize = 4;

const NLA_ALIGNTO: usize = 4;

#[inline]
fn nla_align(len: usize) -> usize {
    (len + NLA_ALIGNTO - 1) & !(NLA_ALIGNTO - 1)
}

/// One attribute as it appeared in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute<'a> {
    pub kind: u16,
    /// Length from the header, header included.
    pub declared_len: u16,
    /// Payload with the header stripped; shorter than declared if `truncated`.
    pub value: &'a [u8],
    pub truncated: bool,
}

impl Attribute<'_> {
    pub fn name(&self) -> &'static str {
        registry::name_for(i64::from(self.kind))
    }
}

/// Why decoding stopped early. Never fatal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeTruncation {
    #[error("decode truncated; can't read header")]
    HeaderUnreadable { offset: usize, remaining: usize },

    #[error("decode truncated; nla_len < 4")]
    LengthBelowHeader { offset: usize, declared: u16 },

    #[error("decode truncated; nla_len > msg_len[{remaining}]")]
    ExceedsBuffer {
        offset: usize,
        declared: u16,
        remaining: usize,
    },
}

/// Result of [`decode`].
///
/// `attributes` keeps every occurrence in buffer order; `map` keeps the last
/// complete occurrence per type.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded<'a> {
    pub attributes: Vec<Attribute<'a>>,
    pub map: BTreeMap<u16, &'a [u8]>,
    pub diagnostics: Vec<DecodeTruncation>,
}

impl<'a> Decoded<'a> {
    pub fn get(&self, kind: u16) -> Option<&'a [u8]> {
        self.map.get(&kind).copied()
    }

    /// Datapath input port, `OVS_KEY_ATTR_IN_PORT` read as a native `u32`.
    pub fn in_port(&self) -> Option<u32> {
        let raw = self.get(registry::attr::IN_PORT)?;
        let bytes: [u8; 4] = raw.get(..4)?.try_into().ok()?;
        Some(u32::from_ne_bytes(bytes))
    }

    pub fn is_truncated(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Decode at most `limit` bytes of `buf`.
///
/// `limit` is normally the captured key length; passing a limit past the end
/// of the buffer is the same as passing `buf.len()`.
pub fn decode(buf: &[u8], limit: usize) -> Decoded<'_> {
    let buf = &buf[..limit.min(buf.len())];
    let mut out = Decoded::default();
    let mut offset = 0usize;
    let mut remaining = buf.len();

    while remaining > 0 {
        if remaining < NLA_HDRLEN {
            out.diagnostics
                .push(DecodeTruncation::HeaderUnreadable { offset, remaining });
            break;
        }

        let declared = u16::from_ne_bytes([buf[offset], buf[offset + 1]]);
        let kind = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]);
        let len = usize::from(declared);

        if len < NLA_HDRLEN {
            out.diagnostics
                .push(DecodeTruncation::LengthBelowHeader { offset, declared });
            break;
        }

        let payload_start = offset + NLA_HDRLEN;
        if len > remaining {
            out.attributes.push(Attribute {
                kind,
                declared_len: declared,
                value: &buf[payload_start..offset + remaining],
                truncated: true,
            });
            out.diagnostics.push(DecodeTruncation::ExceedsBuffer {
                offset,
                declared,
                remaining,
            });
            break;
        }

        let value = &buf[payload_start..offset + len];
        out.attributes.push(Attribute {
            kind,
            declared_len: declared,
            value,
            truncated: false,
        });
        out.map.insert(kind, value);

        // The padded step must fit too; a short tail means the next header
        // cannot be read.
        let step = nla_align(len);
        if step > remaining {
            out.diagnostics.push(DecodeTruncation::HeaderUnreadable {
                offset: offset + len,
                remaining: remaining - len,
            });
            break;
        }
        offset += step;
        remaining -= step;
    }

    out
}

/// Build a well-formed attribute stream, padding each payload to 4 bytes.
pub fn encode<'a, I>(attrs: I) -> Vec<u8>
where
    I: IntoIterator<Item = (u16, &'a [u8])>,
{
    let mut out = Vec::new();
    for (kind, value) in attrs {
        let len = NLA_HDRLEN + value.len();
        let declared = u16::try_from(len).unwrap_or(u16::MAX);
        out.extend_from_slice(&declared.to_ne_bytes());
        out.extend_from_slice(&kind.to_ne_bytes());
        out.extend_from_slice(value);
        out.resize(out.len() + nla_align(len) - len, 0);
    }
    out
}
