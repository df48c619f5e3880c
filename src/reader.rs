//! Container reader — directory materialization and pyramid navigation.
//!
//! # Open path
//! `open` scans forward from offset 0 to locate the first chunk of each
//! container kind (source, signal, user-data), then walks the source and
//! signal item chains to materialize the in-RAM directory: descriptor
//! tables, per-track DEF/HEAD offsets, and the HEAD payload (one chunk
//! offset per summary level) captured at open time.
//!
//! # Queries
//! `fsr_length` and `seek` start from the highest summary level with a
//! non-zero HEAD offset and descend the pyramid one level at a time, so both
//! are O(log N) in the signal length.  `fsr_f32` seeks to level 0 and copies
//! across data chunks following the track's data chain; `fsr_summary_f32`
//! does the same over a summary level for range statistics.
//!
//! # Tolerance
//! A file whose tail was truncated mid-chunk still opens: the scan and the
//! chain walks stop at the break and everything before it is served.  Reads
//! that run past the break return `Empty`.  Malformed chunks inside a chain
//! are warned about and skipped when safe; payloads shorter than their fixed
//! prefix are `ParameterInvalid`.

use std::fs::File;
use std::path::Path;

use byteorder::{ByteOrder, LittleEndian};
use tracing::warn;

use crate::arena::{StrRef, StringArena};
use crate::chunk::{ChunkHeader, StorageType, Tag, TrackRole, TrackType, HEADER_SIZE, TRACK_TYPE_COUNT};
use crate::def::{
    AnnotationType, DataType, SignalDef, SignalType, SummaryEntry, SIGNAL_COUNT,
    SIGNAL_DEF_FIXED, SOURCE_COUNT, SOURCE_DEF_RESERVED, SUMMARY_ENTRY_SIZE,
    SUMMARY_LEVEL_COUNT, TRACK_HEAD_SIZE,
};
use crate::error::{Error, Result};
use crate::raw::Raw;

/// Initial payload buffer size; grows by doubling on `TooBig`.
pub const PAYLOAD_BUFFER_INITIAL: usize = 32 << 20;

// ── Directory entries ────────────────────────────────────────────────────────

struct SourceEntry {
    name:    StrRef,
    vendor:  StrRef,
    model:   StrRef,
    version: StrRef,
    serial:  StrRef,
}

struct SignalEntry {
    def:             SignalDef,
    name:            StrRef,
    si_units:        StrRef,
    track_defs:      [u64; TRACK_TYPE_COUNT],
    track_heads:     [u64; TRACK_TYPE_COUNT],
    /// HEAD payload captured at open: offsets[level] of the most recent
    /// chunk per summary level, per track.
    track_head_data: [[u64; SUMMARY_LEVEL_COUNT]; TRACK_TYPE_COUNT],
}

/// Borrowed view of a source descriptor.
#[derive(Debug, Clone, Copy)]
pub struct SourceInfo<'a> {
    pub source_id: u16,
    pub name:      &'a str,
    pub vendor:    &'a str,
    pub model:     &'a str,
    pub version:   &'a str,
    pub serial:    &'a str,
}

/// Borrowed view of a signal descriptor.
#[derive(Debug, Clone, Copy)]
pub struct SignalInfo<'a> {
    pub signal_id:               u16,
    pub source_id:               u16,
    pub signal_type:             SignalType,
    pub data_type:               DataType,
    pub sample_rate:             u32,
    pub samples_per_data:        u32,
    pub sample_decimate_factor:  u32,
    pub entries_per_summary:     u32,
    pub summary_decimate_factor: u32,
    pub utc_rate_auto:           u32,
    pub name:                    &'a str,
    pub si_units:                &'a str,
}

/// One user-data chunk yielded by the iteration cursor.
#[derive(Debug)]
pub struct UserData<'a> {
    pub meta:    u16,
    pub storage: StorageType,
    pub data:    &'a [u8],
}

// ── Reader ───────────────────────────────────────────────────────────────────

pub struct Reader {
    raw:     Raw<File>,
    payload: Vec<u8>,
    arena:   StringArena,

    sources: Vec<Option<SourceEntry>>,
    signals: Vec<Option<SignalEntry>>,

    source_head:    Option<u64>,
    signal_head:    Option<u64>,
    user_data_head: Option<u64>,
    /// Offset of the user-data chunk the iteration cursor is on.
    user_data_pos:  u64,
}

impl Reader {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = Raw::open(path)?;
        let mut reader = Self {
            raw,
            payload: vec![0u8; PAYLOAD_BUFFER_INITIAL],
            arena: StringArena::new(),
            sources: (0..SOURCE_COUNT).map(|_| None).collect(),
            signals: (0..SIGNAL_COUNT).map(|_| None).collect(),
            source_head: None,
            signal_head: None,
            user_data_head: None,
            user_data_pos: 0,
        };
        reader.scan()?;
        reader.scan_sources()?;
        reader.scan_signals()?;
        reader.user_data_reset();
        Ok(reader)
    }

    /// Release the handle.  Dropping has the same effect; double close is a
    /// no-op by construction.
    pub fn close(self) {}

    // ── Scan ─────────────────────────────────────────────────────────────────

    /// Locate the first chunk of each container kind by reading forward from
    /// offset 0.  Normally the first three chunks complete the bitmask; a
    /// warning is logged when they do not, and the scan continues to EOF.
    fn scan(&mut self) -> Result<()> {
        const FOUND_SOURCE: u8 = 0b001;
        const FOUND_SIGNAL: u8 = 0b010;
        const FOUND_USER:   u8 = 0b100;

        self.raw.chunk_seek(0)?;
        let mut found = 0u8;
        let mut examined = 0usize;
        loop {
            if found == FOUND_SOURCE | FOUND_SIGNAL | FOUND_USER {
                break;
            }
            let offset = self.raw.chunk_tell();
            let header = match self.raw.read_header() {
                Ok(h) => h,
                Err(Error::Empty) => break,
                Err(Error::ParameterInvalid(msg)) => {
                    warn!(offset, %msg, "scan stopped at malformed chunk");
                    break;
                }
                Err(e) => return Err(e),
            };
            match header.tag {
                Tag::SourceDef if found & FOUND_SOURCE == 0 => {
                    self.source_head = Some(offset);
                    found |= FOUND_SOURCE;
                }
                Tag::SignalDef
                | Tag::Track(_, TrackRole::Def)
                | Tag::Track(_, TrackRole::Head)
                    if found & FOUND_SIGNAL == 0 =>
                {
                    self.signal_head = Some(offset);
                    found |= FOUND_SIGNAL;
                }
                Tag::UserData if found & FOUND_USER == 0 => {
                    self.user_data_head = Some(offset);
                    found |= FOUND_USER;
                }
                _ => {}
            }
            examined += 1;
            if examined == 3 && found != FOUND_SOURCE | FOUND_SIGNAL | FOUND_USER {
                warn!(found, "head chunks not within the first 3; continuing scan");
            }
        }
        Ok(())
    }

    /// Walk the source chain, decoding each descriptor into the table.
    fn scan_sources(&mut self) -> Result<()> {
        let mut next = self.source_head;
        while let Some(offset) = next {
            let header = match self.read_chunk_at(offset) {
                Ok(h) => h,
                Err(Error::Empty) => break, // forward-broken tail
                Err(e) => return Err(e),
            };
            next = (header.item_next != 0).then_some(header.item_next);

            if header.tag != Tag::SourceDef {
                warn!(offset, tag = ?header.tag, "unexpected tag on source chain");
                continue;
            }
            let id = header.chunk_meta as usize;
            if id >= SOURCE_COUNT {
                warn!(offset, source_id = id, "source id out of range, skipped");
                continue;
            }
            let len = header.payload_length as usize;
            if len < SOURCE_DEF_RESERVED {
                return Err(Error::param("source-def payload shorter than reserved area"));
            }
            let mut pos = SOURCE_DEF_RESERVED;
            let entry = SourceEntry {
                name:    parse_str(&self.payload[..len], &mut pos, &mut self.arena)?,
                vendor:  parse_str(&self.payload[..len], &mut pos, &mut self.arena)?,
                model:   parse_str(&self.payload[..len], &mut pos, &mut self.arena)?,
                version: parse_str(&self.payload[..len], &mut pos, &mut self.arena)?,
                serial:  parse_str(&self.payload[..len], &mut pos, &mut self.arena)?,
            };
            if self.sources[id].is_some() {
                warn!(source_id = id, "duplicate source definition, first wins");
                continue;
            }
            self.sources[id] = Some(entry);
        }
        Ok(())
    }

    /// Walk the signal chain: SIGNAL_DEF chunks fill the descriptor table,
    /// TRACK_*_DEF/HEAD chunks fill the per-signal track tables.
    fn scan_signals(&mut self) -> Result<()> {
        let mut next = self.signal_head;
        while let Some(offset) = next {
            let header = match self.read_chunk_at(offset) {
                Ok(h) => h,
                Err(Error::Empty) => break,
                Err(e) => return Err(e),
            };
            next = (header.item_next != 0).then_some(header.item_next);

            match header.tag {
                Tag::SignalDef => self.handle_signal_def(offset, &header)?,
                Tag::Track(track_type, TrackRole::Def) => {
                    if let Some(entry) = self.track_target(offset, &header, track_type) {
                        entry.track_defs[track_type as usize] = offset;
                    }
                }
                Tag::Track(track_type, TrackRole::Head) => {
                    if header.payload_length as usize != TRACK_HEAD_SIZE {
                        return Err(Error::param("track head payload size mismatch"));
                    }
                    let mut offsets = [0u64; SUMMARY_LEVEL_COUNT];
                    LittleEndian::read_u64_into(&self.payload[..TRACK_HEAD_SIZE], &mut offsets);
                    if let Some(entry) = self.track_target(offset, &header, track_type) {
                        entry.track_heads[track_type as usize] = offset;
                        entry.track_head_data[track_type as usize] = offsets;
                    }
                }
                tag => {
                    warn!(offset, ?tag, "unexpected tag on signal chain");
                }
            }
        }
        Ok(())
    }

    fn handle_signal_def(&mut self, offset: u64, header: &ChunkHeader) -> Result<()> {
        let id = header.signal_id() as usize;
        if id >= SIGNAL_COUNT {
            warn!(offset, signal_id = id, "signal id out of range, skipped");
            return Ok(());
        }
        let len = header.payload_length as usize;
        if len < SIGNAL_DEF_FIXED {
            return Err(Error::param("signal-def payload shorter than fixed fields"));
        }
        let p = &self.payload[..len];

        let source_id = LittleEndian::read_u16(&p[0..2]);
        let signal_type_raw = p[2];
        let data_type_raw = LittleEndian::read_u32(&p[4..8]);
        let sample_rate = LittleEndian::read_u32(&p[8..12]);
        let samples_per_data = LittleEndian::read_u32(&p[12..16]);
        let sample_decimate_factor = LittleEndian::read_u32(&p[16..20]);
        let entries_per_summary = LittleEndian::read_u32(&p[20..24]);
        let summary_decimate_factor = LittleEndian::read_u32(&p[24..28]);
        let utc_rate_auto = LittleEndian::read_u32(&p[28..32]);

        let Some(signal_type) = SignalType::from_u8(signal_type_raw) else {
            warn!(offset, signal_id = id, signal_type_raw, "unknown signal type, skipped");
            return Ok(());
        };
        let Some(data_type) = DataType::from_u32(data_type_raw) else {
            warn!(offset, signal_id = id, data_type_raw, "unknown data type, skipped");
            return Ok(());
        };
        if self.sources[source_id as usize].is_none() {
            warn!(offset, signal_id = id, source_id, "signal references undefined source, skipped");
            return Ok(());
        }
        if self.signals[id].is_some() {
            warn!(signal_id = id, "duplicate signal definition, first wins");
            return Ok(());
        }

        let mut pos = SIGNAL_DEF_FIXED;
        let name = parse_str(&self.payload[..len], &mut pos, &mut self.arena)?;
        let si_units = parse_str(&self.payload[..len], &mut pos, &mut self.arena)?;

        self.signals[id] = Some(SignalEntry {
            def: SignalDef {
                signal_id: id as u16,
                source_id,
                signal_type,
                data_type,
                sample_rate,
                samples_per_data,
                sample_decimate_factor,
                entries_per_summary,
                summary_decimate_factor,
                utc_rate_auto,
                name: String::new(),
                si_units: String::new(),
            },
            name,
            si_units,
            track_defs: [0; TRACK_TYPE_COUNT],
            track_heads: [0; TRACK_TYPE_COUNT],
            track_head_data: [[0; SUMMARY_LEVEL_COUNT]; TRACK_TYPE_COUNT],
        });
        Ok(())
    }

    /// Resolve the signal entry a track chunk belongs to, warning and
    /// returning `None` for unknown ids or a track the signal type does not
    /// carry.
    fn track_target(
        &mut self,
        offset: u64,
        header: &ChunkHeader,
        track_type: TrackType,
    ) -> Option<&mut SignalEntry> {
        let id = header.signal_id() as usize;
        if id >= SIGNAL_COUNT {
            warn!(offset, signal_id = id, "track chunk signal id out of range, skipped");
            return None;
        }
        let Some(entry) = self.signals[id].as_mut() else {
            warn!(offset, signal_id = id, "track chunk for undefined signal, skipped");
            return None;
        };
        if !entry.def.signal_type.tracks().contains(&track_type) {
            warn!(
                offset,
                signal_id = id,
                ?track_type,
                "track not permitted on this signal type, skipped"
            );
            return None;
        }
        Some(entry)
    }

    // ── Directory access ─────────────────────────────────────────────────────

    /// Defined sources in id order, excluding the reserved source 0.
    pub fn sources(&self) -> Vec<SourceInfo<'_>> {
        (1..SOURCE_COUNT)
            .filter_map(|id| self.source(id as u16).ok())
            .collect()
    }

    pub fn source(&self, source_id: u16) -> Result<SourceInfo<'_>> {
        let entry = self
            .sources
            .get(source_id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::NotFound)?;
        Ok(SourceInfo {
            source_id,
            name:    self.arena.get(entry.name),
            vendor:  self.arena.get(entry.vendor),
            model:   self.arena.get(entry.model),
            version: self.arena.get(entry.version),
            serial:  self.arena.get(entry.serial),
        })
    }

    /// Defined signals in id order, excluding the reserved signal 0.
    pub fn signals(&self) -> Vec<SignalInfo<'_>> {
        (1..SIGNAL_COUNT)
            .filter_map(|id| self.signal(id as u16).ok())
            .collect()
    }

    pub fn signal(&self, signal_id: u16) -> Result<SignalInfo<'_>> {
        let entry = self
            .signals
            .get(signal_id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::NotFound)?;
        let def = &entry.def;
        Ok(SignalInfo {
            signal_id,
            source_id:               def.source_id,
            signal_type:             def.signal_type,
            data_type:               def.data_type,
            sample_rate:             def.sample_rate,
            samples_per_data:        def.samples_per_data,
            sample_decimate_factor:  def.sample_decimate_factor,
            entries_per_summary:     def.entries_per_summary,
            summary_decimate_factor: def.summary_decimate_factor,
            utc_rate_auto:           def.utc_rate_auto,
            name:                    self.arena.get(entry.name),
            si_units:                self.arena.get(entry.si_units),
        })
    }

    // ── Length / seek / sample reads ─────────────────────────────────────────

    /// Total FSR sample count: `timestamp + count` of the final level-0
    /// chunk, reached by tail descent from the highest populated level.
    pub fn fsr_length(&mut self, signal_id: u16) -> Result<u64> {
        let (_, heads) = self.fsr_heads(signal_id)?;
        let Some(top) = (0..SUMMARY_LEVEL_COUNT).rev().find(|&l| heads[l] != 0) else {
            return Ok(0);
        };
        let mut level = top;
        let mut offset = heads[top];
        loop {
            let header = self.read_chunk_at(offset)?;
            let (timestamp, count) = self.payload_prefix(&header)?;
            if level == 0 {
                expect_tag(&header, Tag::Track(TrackType::Fsr, TrackRole::Data))?;
                return Ok(timestamp + count);
            }
            expect_tag(&header, Tag::Track(TrackType::Fsr, TrackRole::Index))?;
            if count == 0 {
                return Err(Error::param("index chunk with no entries"));
            }
            let last = 16 + (count as usize - 1) * 8;
            offset = LittleEndian::read_u64(&self.payload[last..last + 8]);
            level -= 1;
        }
    }

    /// Position the raw cursor on the level-`level` chunk containing
    /// `sample_id` and return its offset.  Level 0 lands on a DATA chunk;
    /// higher levels land on the INDEX chunk (its paired SUMMARY chunk
    /// immediately follows in the file).
    pub fn seek(&mut self, signal_id: u16, level: usize, sample_id: u64) -> Result<u64> {
        let (def, heads) = self.fsr_heads(signal_id)?;
        if level >= SUMMARY_LEVEL_COUNT {
            return Err(Error::param(format!("summary level {level} out of range")));
        }
        let Some(top) = (0..SUMMARY_LEVEL_COUNT).rev().find(|&l| heads[l] != 0) else {
            return Err(Error::Empty);
        };
        if level > top {
            return Err(Error::Empty);
        }

        let mut cur = top;
        let mut offset = heads[top];
        loop {
            let header = self.read_chunk_at(offset)?;
            let (timestamp, count) = self.payload_prefix(&header)?;
            // The head names the most recent chunk at the start level; walk
            // the chain backwards when the target precedes this chunk.
            if sample_id < timestamp && header.item_prev != 0 {
                offset = header.item_prev;
                continue;
            }
            if cur == level {
                self.raw.chunk_seek(offset)?;
                return Ok(offset);
            }
            expect_tag(&header, Tag::Track(TrackType::Fsr, TrackRole::Index))?;
            if count == 0 {
                return Err(Error::param("index chunk with no entries"));
            }
            let span = def.chunk_span(cur - 1);
            let child = (sample_id.saturating_sub(timestamp) / span).min(count - 1) as usize;
            let at = 16 + child * 8;
            offset = LittleEndian::read_u64(&self.payload[at..at + 8]);
            cur -= 1;
        }
    }

    /// Copy `out.len()` samples starting at `start_sample_id` into `out`.
    /// Returns `Empty` if the data chain ends before `out` is filled.
    pub fn fsr_f32(&mut self, signal_id: u16, start_sample_id: u64, out: &mut [f32]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let mut offset = self.seek(signal_id, 0, start_sample_id)?;
        let mut filled = 0usize;
        let mut next_id = start_sample_id;
        loop {
            let header = self.read_chunk_at(offset)?;
            expect_tag(&header, Tag::Track(TrackType::Fsr, TrackRole::Data))?;
            let (timestamp, count) = self.payload_prefix(&header)?;

            let skip = next_id.saturating_sub(timestamp);
            if skip < count {
                let avail = (count - skip) as usize;
                let take = avail.min(out.len() - filled);
                let base = 16 + skip as usize * 4;
                for (slot, bytes) in out[filled..filled + take]
                    .iter_mut()
                    .zip(self.payload[base..base + take * 4].chunks_exact(4))
                {
                    *slot = f32::from_le_bytes(bytes.try_into().unwrap());
                }
                filled += take;
                next_id = timestamp + skip + take as u64;
                if filled == out.len() {
                    return Ok(());
                }
            }
            if header.item_next == 0 {
                return Err(Error::Empty);
            }
            offset = header.item_next;
        }
    }

    /// Range statistics: copy `out.len()` summary entries at `level`
    /// starting with the entry covering `start_sample_id`.
    pub fn fsr_summary_f32(
        &mut self,
        signal_id: u16,
        start_sample_id: u64,
        level: usize,
        out: &mut [SummaryEntry],
    ) -> Result<()> {
        if level == 0 || level >= SUMMARY_LEVEL_COUNT {
            return Err(Error::param(format!("summary level {level} out of range")));
        }
        if out.is_empty() {
            return Ok(());
        }
        let (def, _) = self.fsr_heads(signal_id)?;
        let samples_per_entry = def.samples_per_entry(level);

        let index_offset = self.seek(signal_id, level, start_sample_id)?;
        let index_header = self.read_chunk_at(index_offset)?;
        // The SUMMARY chunk is written immediately after its paired INDEX.
        let mut offset = index_offset + HEADER_SIZE as u64 + index_header.payload_length as u64;

        let mut filled = 0usize;
        let mut next_id = start_sample_id;
        loop {
            let header = self.read_chunk_at(offset)?;
            expect_tag(&header, Tag::Track(TrackType::Fsr, TrackRole::Summary))?;
            let (timestamp, count) = self.payload_prefix(&header)?;

            let skip = next_id.saturating_sub(timestamp) / samples_per_entry;
            if skip < count {
                let avail = (count - skip) as usize;
                let take = avail.min(out.len() - filled);
                let base = 16 + skip as usize * SUMMARY_ENTRY_SIZE;
                for (slot, bytes) in out[filled..filled + take]
                    .iter_mut()
                    .zip(self.payload[base..base + take * SUMMARY_ENTRY_SIZE].chunks_exact(SUMMARY_ENTRY_SIZE))
                {
                    *slot = SummaryEntry {
                        mean: LittleEndian::read_f32(&bytes[0..4]),
                        min:  LittleEndian::read_f32(&bytes[4..8]),
                        max:  LittleEndian::read_f32(&bytes[8..12]),
                        std:  LittleEndian::read_f32(&bytes[12..16]),
                    };
                }
                filled += take;
                next_id = timestamp + (skip + take as u64) * samples_per_entry;
                if filled == out.len() {
                    return Ok(());
                }
            }
            if header.item_next == 0 {
                return Err(Error::Empty);
            }
            offset = header.item_next;
        }
    }

    /// Annotation reads are an extension point in this build.
    pub fn annotations(&mut self, _signal_id: u16) -> Result<Vec<(u64, AnnotationType, StorageType)>> {
        Err(Error::NotSupported)
    }

    // ── User data iteration ──────────────────────────────────────────────────

    /// Move the cursor back to the initial sentinel chunk.
    pub fn user_data_reset(&mut self) {
        self.user_data_pos = self.user_data_head.unwrap_or(0);
    }

    /// Advance to and return the next user-data chunk, or `Empty` at the end
    /// of the chain (cursor unchanged).
    pub fn user_data_next(&mut self) -> Result<UserData<'_>> {
        if self.user_data_head.is_none() {
            return Err(Error::Empty);
        }
        let current = self.read_chunk_at(self.user_data_pos)?;
        if current.item_next == 0 {
            return Err(Error::Empty);
        }
        let offset = current.item_next;
        let header = self.read_chunk_at(offset)?;
        expect_tag(&header, Tag::UserData)?;
        self.user_data_pos = offset;
        self.user_data_view(&header)
    }

    /// Step back to and return the previous user-data chunk.  Stepping onto
    /// the initial sentinel returns `Empty` and resets the cursor.
    pub fn user_data_prev(&mut self) -> Result<UserData<'_>> {
        let head = self.user_data_head.ok_or(Error::Empty)?;
        if self.user_data_pos == head {
            return Err(Error::Empty);
        }
        let current = self.read_chunk_at(self.user_data_pos)?;
        if current.item_prev == 0 || current.item_prev == head {
            self.user_data_reset();
            return Err(Error::Empty);
        }
        let offset = current.item_prev;
        let header = self.read_chunk_at(offset)?;
        expect_tag(&header, Tag::UserData)?;
        self.user_data_pos = offset;
        self.user_data_view(&header)
    }

    fn user_data_view(&self, header: &ChunkHeader) -> Result<UserData<'_>> {
        let storage = header
            .storage_type()
            .ok_or_else(|| Error::param("unknown user-data storage type"))?;
        Ok(UserData {
            meta: header.chunk_meta & crate::chunk::META_SIGNAL_ID_MASK,
            storage,
            data: &self.payload[..header.payload_length as usize],
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    /// Seek to `offset` and read the chunk there, growing the payload buffer
    /// by doubling until it fits.
    fn read_chunk_at(&mut self, offset: u64) -> Result<ChunkHeader> {
        self.raw.chunk_seek(offset)?;
        loop {
            match self.raw.read_chunk(&mut self.payload) {
                Err(Error::TooBig { needed }) => {
                    let mut capacity = self.payload.len().max(1);
                    while capacity < needed {
                        capacity *= 2;
                    }
                    self.payload.resize(capacity, 0);
                }
                other => return other,
            }
        }
    }

    /// `(timestamp, count)` prefix common to data, summary, and index chunks.
    ///
    /// The header CRC covers only the header, so `count` is unprotected
    /// on disk.  It is bounded against `payload_length` here, before any
    /// call site derives an index from it, so a corrupted count reads as
    /// `ParameterInvalid` rather than indexing past the payload buffer.
    fn payload_prefix(&self, header: &ChunkHeader) -> Result<(u64, u64)> {
        if header.payload_length < 16 {
            return Err(Error::param("chunk payload shorter than its prefix"));
        }
        let timestamp = LittleEndian::read_u64(&self.payload[0..8]);
        let count = LittleEndian::read_u64(&self.payload[8..16]);

        let entry_size: u64 = match header.tag {
            Tag::Track(TrackType::Fsr, TrackRole::Data) => 4,
            Tag::Track(TrackType::Fsr, TrackRole::Index) => 8,
            Tag::Track(TrackType::Fsr, TrackRole::Summary) => SUMMARY_ENTRY_SIZE as u64,
            _ => 0,
        };
        if entry_size != 0 && count > (header.payload_length as u64 - 16) / entry_size {
            return Err(Error::param(format!(
                "chunk count {count} inconsistent with payload length {}",
                header.payload_length
            )));
        }
        Ok((timestamp, count))
    }

    fn fsr_heads(&self, signal_id: u16) -> Result<(SignalDef, [u64; SUMMARY_LEVEL_COUNT])> {
        let entry = self
            .signals
            .get(signal_id as usize)
            .and_then(|s| s.as_ref())
            .ok_or(Error::NotFound)?;
        if entry.def.signal_type != SignalType::Fsr {
            return Err(Error::NotSupported);
        }
        let track = TrackType::Fsr as usize;
        // A track whose DEF or HEAD chunk never made it to disk is empty.
        let heads = if entry.track_defs[track] == 0 || entry.track_heads[track] == 0 {
            [0; SUMMARY_LEVEL_COUNT]
        } else {
            entry.track_head_data[track]
        };
        Ok((entry.def.clone(), heads))
    }
}

fn expect_tag(header: &ChunkHeader, tag: Tag) -> Result<()> {
    if header.tag != tag {
        return Err(Error::param(format!(
            "expected {tag:?} chunk, found {:?}",
            header.tag
        )));
    }
    Ok(())
}

/// Parse one `{0x00, 0x1F}`-terminated UTF-8 string out of `payload` at
/// `*pos`, interning it and advancing past the terminator.
fn parse_str(payload: &[u8], pos: &mut usize, arena: &mut StringArena) -> Result<StrRef> {
    let bytes = payload.get(*pos..).unwrap_or(&[]);
    let mut i = 0;
    while i + 1 < bytes.len() {
        if bytes[i] == 0x00 && bytes[i + 1] == 0x1F {
            let s = std::str::from_utf8(&bytes[..i])
                .map_err(|_| Error::param("descriptor string is not valid UTF-8"))?;
            let handle = arena.intern(s);
            *pos += i + 2;
            return Ok(handle);
        }
        i += 1;
    }
    Err(Error::param("unterminated descriptor string"))
}
