//! # jls — JLS (Jetperch Log Storage) container reference implementation
//!
//! Format guarantees (frozen):
//! - All numeric fields are little-endian; never negotiated
//! - Every chunk carries a 32-byte header with a mandatory CRC32; corrupt
//!   headers abort reads
//! - Chunks of one logical kind are doubly linked through `item_next` /
//!   `item_prev`; forward links are back-patched, so a crash leaves at worst
//!   a forward-broken tail that the reader's scan tolerates
//! - Each FSR track carries a summary pyramid (INDEX + SUMMARY chunk pairs
//!   per level) and a HEAD chunk, rewritten in place, naming the most recent
//!   chunk at every level — length and seek are O(log N)
//! - Strings are UTF-8 terminated by `{0x00, 0x1F}`
//!
//! The library is single-threaded and synchronous: a [`Writer`] or
//! [`Reader`] handle is owned by one caller, performs no internal threading,
//! and blocks only on ordinary file I/O.

pub mod arena;
pub mod chunk;
pub mod def;
pub mod error;
pub mod raw;
pub mod reader;
pub mod serializer;
pub mod writer;

// Flat re-exports for the most common types.
pub use chunk::{ChunkHeader, StorageType, Tag, TrackRole, TrackType, HEADER_SIZE};
pub use def::{
    AnnotationType, DataType, SignalDef, SignalType, SourceDef, SummaryEntry, SIGNAL_COUNT,
    SOURCE_COUNT, SUMMARY_LEVEL_COUNT,
};
pub use error::{Error, Result};
pub use reader::{Reader, SignalInfo, SourceInfo, UserData};
pub use writer::Writer;
