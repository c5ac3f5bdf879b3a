//! Entry (index tuple) codec.
//!
//! An encoded entry is laid out as:
//!
//! ```text
//! size: u16        self-reported total encoded size
//! info: u16        bits 0..=11 attribute count, bit 12 pivot,
//!                  bit 13 link present, bit 14 tie-breaker present
//! link: u32        optional; child downlink, or top-parent pointer on the
//!                  high key of a half-dead page
//! tiebreak: u32+u16  optional; row reference breaking key ties
//! attrs: ...       attribute values, each with a 1-byte header
//! ```
//!
//! Attribute headers: `0x00..=0x7f` is a short plain value of that length,
//! `0x80` is a long plain value (u32 length follows), `0x81` is a
//! run-length-compressed value (u32 raw length, u32 compressed length,
//! then the compressed bytes). All integers little-endian.
//!
//! Equal values can be stored under different encodings, so anything that
//! fingerprints entries must go through [`Entry::normalized`], which rewrites
//! every attribute to its minimal plain encoding.

use bitflags::bitflags;
use smallvec::SmallVec;

use crate::{BlockId, RowId, TIEBREAK_SIZE};

/// Bytes of the fixed entry header (size and info words).
pub const ENTRY_HEADER_SIZE: usize = 4;

/// Largest attribute count the info word can carry.
pub const MAX_NATTS: u16 = 0x0fff;

const INFO_NATTS_MASK: u16 = 0x0fff;
const INFO_PIVOT: u16 = 0x1000;
const INFO_HAS_LINK: u16 = 0x2000;
const INFO_HAS_TIEBREAK: u16 = 0x4000;

const ATTR_LONG: u8 = 0x80;
const ATTR_COMPRESSED: u8 = 0x81;

bitflags! {
    /// Entry status bits. Link and tie-breaker presence are represented by
    /// the `Option` fields on [`Entry`], not here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EntryFlags: u16 {
        /// Separator entry (high key or downlink carrier); its attributes
        /// bound a range rather than describe one row.
        const PIVOT = 0x0001;
    }
}

/// Storage encoding of one attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrEncoding {
    /// 1-byte header, value shorter than 128 bytes.
    Short,
    /// 5-byte header, any length.
    Long,
    /// Run-length compressed.
    Compressed,
}

/// One attribute: the logical value plus how it was (or will be) stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attr {
    pub encoding: AttrEncoding,
    pub value: Vec<u8>,
}

impl Attr {
    /// A value under its minimal plain encoding.
    pub fn plain(value: impl Into<Vec<u8>>) -> Self {
        let value = value.into();
        let encoding = if value.len() < 128 {
            AttrEncoding::Short
        } else {
            AttrEncoding::Long
        };
        Self { encoding, value }
    }

    /// The same value, re-encoded minimally. Idempotent.
    pub fn normalized(&self) -> Self {
        Self::plain(self.value.clone())
    }

    fn encoded_len(&self) -> usize {
        match self.encoding {
            AttrEncoding::Short => 1 + self.value.len(),
            AttrEncoding::Long => 5 + self.value.len(),
            AttrEncoding::Compressed => 9 + rle_compress(&self.value).len(),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self.encoding {
            AttrEncoding::Short => {
                debug_assert!(self.value.len() < 128);
                out.push(self.value.len() as u8);
                out.extend_from_slice(&self.value);
            }
            AttrEncoding::Long => {
                out.push(ATTR_LONG);
                out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
                out.extend_from_slice(&self.value);
            }
            AttrEncoding::Compressed => {
                let comp = rle_compress(&self.value);
                out.push(ATTR_COMPRESSED);
                out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
                out.extend_from_slice(&(comp.len() as u32).to_le_bytes());
                out.extend_from_slice(&comp);
            }
        }
    }
}

/// A decoded entry.
///
/// `link` is only legal on pivot entries. A tie-breaker may appear on any
/// entry; whether its absence is legal depends on the format version and is
/// judged by the caller, not the codec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub flags: EntryFlags,
    pub link: Option<BlockId>,
    pub tiebreak: Option<RowId>,
    pub attrs: SmallVec<[Attr; 4]>,
}

impl Entry {
    /// Number of key attributes present. Pivot entries may carry fewer than
    /// the index-wide attribute count after suffix truncation.
    pub fn natts(&self) -> u16 {
        self.attrs.len() as u16
    }

    pub const fn is_pivot(&self) -> bool {
        self.flags.contains(EntryFlags::PIVOT)
    }

    /// Total encoded size this entry would occupy.
    pub fn encoded_size(&self) -> usize {
        ENTRY_HEADER_SIZE
            + self.link.map_or(0, |_| 4)
            + self.tiebreak.map_or(0, |_| TIEBREAK_SIZE)
            + self.attrs.iter().map(Attr::encoded_len).sum::<usize>()
    }

    pub fn encode(&self) -> Vec<u8> {
        let size = self.encoded_size();
        let mut out = Vec::with_capacity(size);
        let mut info = self.natts() & INFO_NATTS_MASK;
        if self.is_pivot() {
            info |= INFO_PIVOT;
        }
        if self.link.is_some() {
            info |= INFO_HAS_LINK;
        }
        if self.tiebreak.is_some() {
            info |= INFO_HAS_TIEBREAK;
        }
        out.extend_from_slice(&(size as u16).to_le_bytes());
        out.extend_from_slice(&info.to_le_bytes());
        if let Some(link) = self.link {
            out.extend_from_slice(&link.get().to_le_bytes());
        }
        if let Some(tid) = self.tiebreak {
            out.extend_from_slice(&tid.block.to_le_bytes());
            out.extend_from_slice(&tid.slot.to_le_bytes());
        }
        for attr in &self.attrs {
            attr.encode_into(&mut out);
        }
        out
    }

    /// Decode an entry from the bytes a slot points at.
    ///
    /// The slice is the slot's full storage; the entry's self-reported size
    /// may legitimately be smaller (that discrepancy is the caller's check,
    /// not a decode failure), but never larger.
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < ENTRY_HEADER_SIZE {
            return Err(format!("{} bytes is too short for an entry", bytes.len()));
        }
        let size = u16::from_le_bytes([bytes[0], bytes[1]]) as usize;
        let info = u16::from_le_bytes([bytes[2], bytes[3]]);
        if size > bytes.len() {
            return Err(format!(
                "self-reported size {size} exceeds {} bytes of storage",
                bytes.len()
            ));
        }
        if size < ENTRY_HEADER_SIZE {
            return Err(format!("self-reported size {size} below header size"));
        }
        if info & !(INFO_NATTS_MASK | INFO_PIVOT | INFO_HAS_LINK | INFO_HAS_TIEBREAK) != 0 {
            return Err(format!("reserved info bits set in {info:#06x}"));
        }
        let natts = info & INFO_NATTS_MASK;
        let pivot = info & INFO_PIVOT != 0;
        if info & INFO_HAS_LINK != 0 && !pivot {
            return Err("link on non-pivot entry".to_owned());
        }

        let body = &bytes[..size];
        let mut at = ENTRY_HEADER_SIZE;
        let link = if info & INFO_HAS_LINK != 0 {
            let raw = read_u32(body, &mut at).ok_or("truncated link")?;
            Some(BlockId::new(raw).ok_or("zero link block")?)
        } else {
            None
        };
        let tiebreak = if info & INFO_HAS_TIEBREAK != 0 {
            let block = read_u32(body, &mut at).ok_or("truncated tie-breaker")?;
            let slot = read_u16(body, &mut at).ok_or("truncated tie-breaker")?;
            Some(RowId::new(block, slot))
        } else {
            None
        };

        let mut attrs = SmallVec::new();
        while at < size {
            attrs.push(decode_attr(body, &mut at)?);
        }
        if attrs.len() != natts as usize {
            return Err(format!(
                "info word declares {natts} attributes, decoded {}",
                attrs.len()
            ));
        }
        let flags = if pivot {
            EntryFlags::PIVOT
        } else {
            EntryFlags::empty()
        };
        Ok(Self {
            flags,
            link,
            tiebreak,
            attrs,
        })
    }

    /// This entry with every attribute re-encoded minimally, so that
    /// logically equal entries have byte-equal encodings. Idempotent.
    pub fn normalized(&self) -> Self {
        Self {
            flags: self.flags,
            link: self.link,
            tiebreak: self.tiebreak,
            attrs: self.attrs.iter().map(Attr::normalized).collect(),
        }
    }
}

/// Self-reported size prefix of an encoded entry, without a full decode.
pub fn declared_size(bytes: &[u8]) -> Option<usize> {
    (bytes.len() >= 2).then(|| u16::from_le_bytes([bytes[0], bytes[1]]) as usize)
}

/// Render key bytes for error messages: each attribute's logical value in
/// hex, comma separated.
pub fn render_key(attrs: &[Attr]) -> String {
    let mut out = String::new();
    for (i, attr) in attrs.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        for byte in &attr.value {
            out.push_str(&format!("{byte:02x}"));
        }
    }
    out
}

fn decode_attr(body: &[u8], at: &mut usize) -> Result<Attr, String> {
    let header = body[*at];
    *at += 1;
    match header {
        0x00..=0x7f => {
            let len = header as usize;
            let value = take(body, at, len).ok_or("truncated short attribute")?;
            Ok(Attr {
                encoding: AttrEncoding::Short,
                value: value.to_vec(),
            })
        }
        ATTR_LONG => {
            let len = read_u32(body, at).ok_or("truncated long attribute header")? as usize;
            let value = take(body, at, len).ok_or("truncated long attribute")?;
            Ok(Attr {
                encoding: AttrEncoding::Long,
                value: value.to_vec(),
            })
        }
        ATTR_COMPRESSED => {
            let raw_len = read_u32(body, at).ok_or("truncated compressed attribute header")?;
            let comp_len =
                read_u32(body, at).ok_or("truncated compressed attribute header")? as usize;
            let comp = take(body, at, comp_len).ok_or("truncated compressed attribute")?;
            let value = rle_decompress(comp, raw_len as usize)
                .ok_or("compressed attribute does not decompress to its declared length")?;
            Ok(Attr {
                encoding: AttrEncoding::Compressed,
                value,
            })
        }
        other => Err(format!("unknown attribute encoding {other:#04x}")),
    }
}

fn take<'a>(body: &'a [u8], at: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = at.checked_add(len)?;
    let out = body.get(*at..end)?;
    *at = end;
    Some(out)
}

fn read_u32(body: &[u8], at: &mut usize) -> Option<u32> {
    let b = take(body, at, 4)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

fn read_u16(body: &[u8], at: &mut usize) -> Option<u16> {
    let b = take(body, at, 2)?;
    Some(u16::from_le_bytes([b[0], b[1]]))
}

/// Run-length compress: (count, byte) pairs, runs capped at 255.
pub fn rle_compress(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut iter = raw.iter().peekable();
    while let Some(&byte) = iter.next() {
        let mut run = 1u8;
        while run < u8::MAX && iter.peek() == Some(&&byte) {
            iter.next();
            run += 1;
        }
        out.push(run);
        out.push(byte);
    }
    out
}

/// Expand RLE pairs. Returns `None` unless the input is well-formed pairs
/// expanding to exactly `raw_len` bytes.
pub fn rle_decompress(comp: &[u8], raw_len: usize) -> Option<Vec<u8>> {
    if comp.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(raw_len);
    for pair in comp.chunks_exact(2) {
        let (run, byte) = (pair[0], pair[1]);
        if run == 0 || out.len() + run as usize > raw_len {
            return None;
        }
        out.resize(out.len() + run as usize, byte);
    }
    (out.len() == raw_len).then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn leaf_entry(values: &[&[u8]], tid: RowId) -> Entry {
        Entry {
            flags: EntryFlags::empty(),
            link: None,
            tiebreak: Some(tid),
            attrs: values.iter().map(|v| Attr::plain(v.to_vec())).collect(),
        }
    }

    #[test]
    fn round_trip_leaf_entry() {
        let entry = leaf_entry(&[b"apple", b"x"], RowId::new(12, 3));
        let bytes = entry.encode();
        assert_eq!(declared_size(&bytes), Some(bytes.len()));
        assert_eq!(Entry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn round_trip_pivot_with_link() {
        let entry = Entry {
            flags: EntryFlags::PIVOT,
            link: BlockId::new(42),
            tiebreak: None,
            attrs: smallvec::smallvec![Attr::plain(b"m".to_vec())],
        };
        let decoded = Entry::decode(&entry.encode()).unwrap();
        assert!(decoded.is_pivot());
        assert_eq!(decoded.link, BlockId::new(42));
        assert_eq!(decoded, entry);
    }

    #[test]
    fn decode_allows_slack_after_declared_size() {
        let entry = leaf_entry(&[b"k"], RowId::new(1, 1));
        let mut bytes = entry.encode();
        bytes.extend_from_slice(&[0xde, 0xad]);
        assert_eq!(Entry::decode(&bytes).unwrap(), entry);
        assert_eq!(declared_size(&bytes), Some(bytes.len() - 2));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(Entry::decode(&[1, 0]).is_err());

        // Size beyond storage.
        let mut bytes = leaf_entry(&[b"k"], RowId::new(1, 1)).encode();
        let bloated = (bytes.len() as u16 + 10).to_le_bytes();
        bytes[0..2].copy_from_slice(&bloated);
        let err = Entry::decode(&bytes).unwrap_err();
        assert!(err.contains("exceeds"), "detail: {err}");

        // Link flag on a non-pivot entry.
        let mut bytes = leaf_entry(&[b"k"], RowId::new(1, 1)).encode();
        bytes[3] |= (INFO_HAS_LINK >> 8) as u8;
        let err = Entry::decode(&bytes).unwrap_err();
        assert!(err.contains("non-pivot"), "detail: {err}");

        // Attribute count disagreeing with the attribute stream.
        let mut bytes = leaf_entry(&[b"a", b"b"], RowId::new(1, 1)).encode();
        bytes[2] = 3;
        let err = Entry::decode(&bytes).unwrap_err();
        assert!(err.contains("declares 3"), "detail: {err}");
    }

    #[test]
    fn compressed_and_plain_normalize_identically() {
        let value = vec![7u8; 300];
        let compressed = Entry {
            flags: EntryFlags::empty(),
            link: None,
            tiebreak: Some(RowId::new(2, 5)),
            attrs: smallvec::smallvec![Attr {
                encoding: AttrEncoding::Compressed,
                value: value.clone(),
            }],
        };
        let plain = Entry {
            attrs: smallvec::smallvec![Attr::plain(value)],
            ..compressed.clone()
        };
        assert_ne!(compressed.encode(), plain.encode());
        assert_eq!(
            compressed.normalized().encode(),
            plain.normalized().encode()
        );

        // Compressed round-trips through the codec unchanged.
        let decoded = Entry::decode(&compressed.encode()).unwrap();
        assert_eq!(decoded.attrs[0].encoding, AttrEncoding::Compressed);
        assert_eq!(decoded, compressed);
    }

    #[test]
    fn rle_rejects_bad_streams() {
        assert!(rle_decompress(&[1], 1).is_none());
        assert!(rle_decompress(&[0, 7], 0).is_none());
        assert!(rle_decompress(&[2, 7], 1).is_none());
        assert_eq!(rle_decompress(&[3, 9], 3).unwrap(), vec![9, 9, 9]);
    }

    proptest! {
        #[test]
        fn rle_round_trip(raw in proptest::collection::vec(any::<u8>(), 0..600)) {
            let comp = rle_compress(&raw);
            prop_assert_eq!(rle_decompress(&comp, raw.len()).unwrap(), raw);
        }

        #[test]
        fn normalize_is_idempotent(
            values in proptest::collection::vec(
                proptest::collection::vec(any::<u8>(), 0..200), 1..4),
            compress_first in any::<bool>(),
        ) {
            let attrs: SmallVec<[Attr; 4]> = values
                .iter()
                .enumerate()
                .map(|(i, v)| {
                    if compress_first && i == 0 {
                        Attr { encoding: AttrEncoding::Compressed, value: v.clone() }
                    } else {
                        Attr::plain(v.clone())
                    }
                })
                .collect();
            let entry = Entry {
                flags: EntryFlags::empty(),
                link: None,
                tiebreak: Some(RowId::new(1, 1)),
                attrs,
            };
            let once = entry.normalized();
            prop_assert_eq!(once.normalized().encode(), once.encode());

            // Normalized form round-trips and stays normalized.
            let decoded = Entry::decode(&once.encode()).unwrap();
            prop_assert_eq!(decoded.normalized().encode(), once.encode());
        }
    }
}
