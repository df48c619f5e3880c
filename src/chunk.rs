//! Chunk framing — the atomic on-disk record, mandatory header checksum.
//!
//! # On-disk header layout (32 bytes, all fields little-endian)
//!
//! ```text
//! Offset  Size  Field
//!    0      8   item_next            next chunk of the same kind (0 = none)
//!    8      8   item_prev            previous chunk of the same kind (0 = none)
//!   16      1   tag                  chunk kind, see [`Tag`]
//!   17      1   rsv0                 written as 0
//!   18      2   chunk_meta           kind-specific, see below
//!   20      4   payload_length       bytes following this header
//!   24      4   payload_prev_length  payload_length of the previously written
//!                                    chunk of ANY kind (linear, not per-chain)
//!   28      4   crc32                CRC32([0..28))  ← LAST
//! ```
//!
//! # chunk_meta
//! - `SourceDef`: low 8 bits = source id.
//! - `SignalDef` and track chunks: low 12 bits = signal id; INDEX and SUMMARY
//!   chunks carry the summary level in the high 4 bits.
//! - `UserData`: high 4 bits = [`StorageType`], low 12 bits = caller metadata.
//!
//! # Checksums
//! `crc32` covers the 28 header bytes before it.  This detects header
//! corruption before any payload seek is attempted.  The payload is not
//! covered: the in-place payload rewrite used for track HEAD updates must
//! leave the header bytes untouched.
//!
//! # Item chains
//! `item_next` of the most recently added chunk of a kind is back-patched
//! when its successor is appended, so a crash can leave the forward link of
//! the final chunk broken.  `item_prev` is always valid at write time; the
//! reader's forward scan tolerates the broken tail.

use crc32fast::Hasher;

/// Fixed byte size of the chunk header (including the trailing crc32).
pub const HEADER_SIZE: usize = 32;

/// Mask selecting the signal id from `chunk_meta` of signal/track chunks.
pub const META_SIGNAL_ID_MASK: u16 = 0x0FFF;

/// Shift of the summary level (INDEX/SUMMARY chunks) or the storage type
/// (user-data chunks) within `chunk_meta`.
pub const META_HIGH_SHIFT: u16 = 12;

// ── Track types ──────────────────────────────────────────────────────────────

/// One of the four per-signal streams.  Encoded in tag bits 3–4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackType {
    Fsr        = 0,
    Vsr        = 1,
    Annotation = 2,
    Utc        = 3,
}

/// Number of [`TrackType`] variants; sizes the per-signal track tables.
pub const TRACK_TYPE_COUNT: usize = 4;

impl TrackType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TrackType::Fsr),
            1 => Some(TrackType::Vsr),
            2 => Some(TrackType::Annotation),
            3 => Some(TrackType::Utc),
            _ => None,
        }
    }
}

// ── Track roles ──────────────────────────────────────────────────────────────

/// Role of a track chunk, encoded in the low 3 bits of the tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TrackRole {
    Def     = 0,
    Head    = 1,
    Index   = 2,
    Data    = 3,
    Summary = 4,
}

impl TrackRole {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(TrackRole::Def),
            1 => Some(TrackRole::Head),
            2 => Some(TrackRole::Index),
            3 => Some(TrackRole::Data),
            4 => Some(TrackRole::Summary),
            _ => None,
        }
    }
}

// ── Tags ─────────────────────────────────────────────────────────────────────

/// Bit flagging a tag as a per-track chunk.
const TAG_TRACK_FLAG: u8 = 0x20;
const TAG_SOURCE_DEF: u8 = 0x01;
const TAG_SIGNAL_DEF: u8 = 0x02;
const TAG_USER_DATA:  u8 = 0x03;

/// Chunk kind discriminant — a closed set over one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tag {
    SourceDef,
    SignalDef,
    UserData,
    Track(TrackType, TrackRole),
}

impl Tag {
    pub fn to_u8(self) -> u8 {
        match self {
            Tag::SourceDef            => TAG_SOURCE_DEF,
            Tag::SignalDef            => TAG_SIGNAL_DEF,
            Tag::UserData             => TAG_USER_DATA,
            Tag::Track(track, role)   => TAG_TRACK_FLAG | (track as u8) << 3 | role as u8,
        }
    }

    /// Decode a tag byte.  Returns `None` for bytes outside the closed set.
    pub fn from_u8(v: u8) -> Option<Self> {
        if v & TAG_TRACK_FLAG != 0 {
            let track = TrackType::from_u8((v >> 3) & 0x03)?;
            let role  = TrackRole::from_u8(v & 0x07)?;
            // Bits above the track flag are not assigned.
            if v & !(TAG_TRACK_FLAG | 0x1F) != 0 {
                return None;
            }
            Some(Tag::Track(track, role))
        } else {
            match v {
                TAG_SOURCE_DEF => Some(Tag::SourceDef),
                TAG_SIGNAL_DEF => Some(Tag::SignalDef),
                TAG_USER_DATA  => Some(Tag::UserData),
                _              => None,
            }
        }
    }
}

// ── Storage types ────────────────────────────────────────────────────────────

/// Interpretation of a user-data or annotation body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StorageType {
    Invalid = 0,
    /// Raw bytes, opaque to the library.
    Binary  = 1,
    /// NUL-terminated UTF-8.
    String  = 2,
    /// NUL-terminated UTF-8 holding a JSON document.
    Json    = 3,
}

impl StorageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(StorageType::Invalid),
            1 => Some(StorageType::Binary),
            2 => Some(StorageType::String),
            3 => Some(StorageType::Json),
            _ => None,
        }
    }
}

// ── Chunk header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub item_next:           u64,
    pub item_prev:           u64,
    pub tag:                 Tag,
    pub chunk_meta:          u16,
    pub payload_length:      u32,
    pub payload_prev_length: u32,
    // crc32 is computed/verified internally — not stored as a field to
    // prevent callers from carrying a stale value through a rewrite.
}

impl ChunkHeader {
    /// Serialize to the 32-byte on-disk form.  `crc32` is computed here.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&self.item_next.to_le_bytes());
        buf[8..16].copy_from_slice(&self.item_prev.to_le_bytes());
        buf[16] = self.tag.to_u8();
        buf[17] = 0; // rsv0
        buf[18..20].copy_from_slice(&self.chunk_meta.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_length.to_le_bytes());
        buf[24..28].copy_from_slice(&self.payload_prev_length.to_le_bytes());

        let mut h = Hasher::new();
        h.update(&buf[..28]);
        buf[28..32].copy_from_slice(&h.finalize().to_le_bytes());
        buf
    }

    /// Parse and validate a 32-byte header.
    ///
    /// Returns `None` on CRC mismatch or an unknown tag byte.  The caller
    /// must not attempt a payload read in that case.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let mut h = Hasher::new();
        h.update(&buf[..28]);
        let stored = u32::from_le_bytes(buf[28..32].try_into().unwrap());
        if h.finalize() != stored {
            return None;
        }

        let tag = Tag::from_u8(buf[16])?;
        Some(Self {
            item_next:           u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            item_prev:           u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            tag,
            chunk_meta:          u16::from_le_bytes(buf[18..20].try_into().unwrap()),
            payload_length:      u32::from_le_bytes(buf[20..24].try_into().unwrap()),
            payload_prev_length: u32::from_le_bytes(buf[24..28].try_into().unwrap()),
        })
    }

    /// Signal id carried by signal-def and track chunks.
    #[inline]
    pub fn signal_id(&self) -> u16 { self.chunk_meta & META_SIGNAL_ID_MASK }

    /// Summary level carried by INDEX/SUMMARY chunks.
    #[inline]
    pub fn summary_level(&self) -> u8 { (self.chunk_meta >> META_HIGH_SHIFT) as u8 }

    /// Storage type of a user-data chunk; `None` for a reserved nibble value.
    #[inline]
    pub fn storage_type(&self) -> Option<StorageType> {
        StorageType::from_u8((self.chunk_meta >> META_HIGH_SHIFT) as u8)
    }
}

/// Build `chunk_meta` for a signal or track chunk.
#[inline]
pub fn signal_meta(signal_id: u16, level: u8) -> u16 {
    (signal_id & META_SIGNAL_ID_MASK) | (level as u16) << META_HIGH_SHIFT
}

/// Build `chunk_meta` for a user-data chunk.
#[inline]
pub fn user_data_meta(meta: u16, storage: StorageType) -> u16 {
    (meta & META_SIGNAL_ID_MASK) | (storage as u16) << META_HIGH_SHIFT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> ChunkHeader {
        ChunkHeader {
            item_next:           0,
            item_prev:           0x1000,
            tag:                 Tag::Track(TrackType::Fsr, TrackRole::Data),
            chunk_meta:          signal_meta(5, 0),
            payload_length:      400_016,
            payload_prev_length: 64,
        }
    }

    #[test]
    fn header_roundtrip() {
        let h = header();
        let buf = h.encode();
        assert_eq!(ChunkHeader::decode(&buf), Some(h));
    }

    #[test]
    fn corrupt_header_rejected() {
        let mut buf = header().encode();
        buf[16] ^= 0xFF;
        assert_eq!(ChunkHeader::decode(&buf), None);
    }

    #[test]
    fn tag_bytes_are_stable() {
        assert_eq!(Tag::SourceDef.to_u8(), 0x01);
        assert_eq!(Tag::SignalDef.to_u8(), 0x02);
        assert_eq!(Tag::UserData.to_u8(), 0x03);
        assert_eq!(Tag::Track(TrackType::Fsr, TrackRole::Def).to_u8(), 0x20);
        assert_eq!(Tag::Track(TrackType::Utc, TrackRole::Data).to_u8(), 0x3B);
        for byte in 0u8..=255 {
            if let Some(tag) = Tag::from_u8(byte) {
                assert_eq!(tag.to_u8(), byte);
            }
        }
    }

    #[test]
    fn meta_packing() {
        let m = user_data_meta(0xFFFF, StorageType::Json);
        assert_eq!(m & META_SIGNAL_ID_MASK, 0x0FFF);
        assert_eq!(m >> META_HIGH_SHIFT, StorageType::Json as u16);

        let s = signal_meta(42, 3);
        assert_eq!(s & META_SIGNAL_ID_MASK, 42);
        assert_eq!(s >> META_HIGH_SHIFT, 3);
    }
}
