//! Streaming container writer.
//!
//! [`Writer`] accepts source and signal definitions, then streams FSR
//! samples into fixed-size data chunks while maintaining the per-track
//! summary pyramid.  Every chunk kind is threaded into its item chain by
//! the back-patch protocol:
//!
//! 1. write the new chunk at end-of-file with `item_prev` = MRA offset and
//!    `item_next` = 0;
//! 2. seek to the MRA and rewrite its header with `item_next` = new offset;
//! 3. seek back to end-of-file;
//! 4. the new chunk becomes the chain's MRA.
//!
//! A crash between (1) and (2) leaves the chain forward-broken but
//! backward-valid; the reader's forward scan recovers whatever precedes the
//! break.
//!
//! Track HEAD chunks are rewritten in place (payload only, header and CRC
//! untouched) whenever a summary level gains a chunk, so a reader always
//! sees the most recent chunk offset per level.
//!
//! On `open` the file is seeded with a user-data sentinel chunk (storage
//! type Invalid, empty payload) followed by the reserved source 0 and the
//! reserved VSR signal 0 used for global annotations.

use std::fs::File;
use std::path::Path;

use tracing::warn;

use crate::chunk::{signal_meta, user_data_meta, ChunkHeader, StorageType, Tag, TrackRole, TrackType, TRACK_TYPE_COUNT};
use crate::def::{
    AnnotationType, SignalDef, SignalType, SourceDef, SummaryAccum, ANNOTATION_PREFIX,
    SIGNAL_COUNT, SIGNAL_DEF_RESERVED, SOURCE_COUNT, SOURCE_DEF_RESERVED, SUMMARY_LEVEL_COUNT,
    TRACK_HEAD_SIZE,
};
use crate::error::{Error, Result};
use crate::raw::Raw;
use crate::serializer::{Serializer, SCRATCH_SIZE};

/// A written chunk: its offset and the header as last written to disk.
/// Kept per chain MRA so the back-patch can rewrite the header verbatim
/// with only `item_next` changed.
#[derive(Debug, Clone, Copy)]
struct ChunkRecord {
    offset: u64,
    header: ChunkHeader,
}

/// Per-track writer state.
#[derive(Debug, Clone, Copy)]
struct TrackState {
    /// The HEAD chunk, rewritten in place as levels gain chunks.
    head:         ChunkRecord,
    head_offsets: [u64; SUMMARY_LEVEL_COUNT],
    data_mra:     Option<ChunkRecord>,
    index_mra:    [Option<ChunkRecord>; SUMMARY_LEVEL_COUNT],
    summary_mra:  [Option<ChunkRecord>; SUMMARY_LEVEL_COUNT],
}

impl TrackState {
    fn new(head: ChunkRecord) -> Self {
        Self {
            head,
            head_offsets: [0; SUMMARY_LEVEL_COUNT],
            data_mra:     None,
            index_mra:    [None; SUMMARY_LEVEL_COUNT],
            summary_mra:  [None; SUMMARY_LEVEL_COUNT],
        }
    }
}

/// Staged reductions for one summary level, flushed as an INDEX + SUMMARY
/// chunk pair when `entries_per_summary` entries accumulate.
#[derive(Debug, Default)]
struct LevelStaging {
    /// Sample id covered by the first staged entry.
    start_id: u64,
    entries:  Vec<SummaryAccum>,
    /// Offsets of the level-below chunks the staged entries were built from.
    children: Vec<u64>,
}

/// Per-signal writer state: validated definition, track chains, and the
/// sample/summary staging buffers.
struct SignalState {
    def:             SignalDef,
    tracks:          [Option<TrackState>; TRACK_TYPE_COUNT],
    sample_buffer:   Vec<f32>,
    /// Sample id of the first sample in `sample_buffer`.
    buffer_start_id: u64,
    /// Sample id the next `fsr_f32` call must continue at.
    next_sample_id:  Option<u64>,
    levels:          Vec<LevelStaging>,
}

impl SignalState {
    fn new(def: SignalDef) -> Self {
        let staging = def.samples_per_data as usize;
        Self {
            def,
            tracks: [None; TRACK_TYPE_COUNT],
            sample_buffer: Vec::with_capacity(staging),
            buffer_start_id: 0,
            next_sample_id: None,
            levels: (0..SUMMARY_LEVEL_COUNT).map(|_| LevelStaging::default()).collect(),
        }
    }
}

pub struct Writer {
    raw: Raw<File>,
    ser: Serializer,

    sources: Vec<Option<ChunkRecord>>,
    signals: Vec<Option<SignalState>>,

    source_mra:    Option<ChunkRecord>,
    signal_mra:    Option<ChunkRecord>,
    user_data_mra: Option<ChunkRecord>,

    /// Payload length of the last chunk written, of any kind.
    payload_prev_length: u32,
    closed: bool,
}

/// Append a chunk to chain `mra` at end-of-file and back-patch the
/// predecessor's forward link.  `raw` must be positioned at end-of-file and
/// is left there (past the new chunk).
fn append(
    raw:      &mut Raw<File>,
    prev_len: &mut u32,
    mra:      &mut Option<ChunkRecord>,
    tag:      Tag,
    meta:     u16,
    payload:  &[u8],
) -> Result<ChunkRecord> {
    let offset = raw.chunk_tell();
    let header = ChunkHeader {
        item_next:           0,
        item_prev:           mra.as_ref().map(|m| m.offset).unwrap_or(0),
        tag,
        chunk_meta:          meta,
        payload_length:      payload.len() as u32,
        payload_prev_length: *prev_len,
    };
    raw.write_chunk(&header, payload)?;
    let end = raw.chunk_tell();

    if let Some(prev) = mra.as_mut() {
        let mut patched = prev.header;
        patched.item_next = offset;
        raw.chunk_seek(prev.offset)?;
        raw.write_header(&patched)?;
        raw.chunk_seek(end)?;
        prev.header = patched;
    }

    *prev_len = payload.len() as u32;
    let record = ChunkRecord { offset, header };
    *mra = Some(record);
    Ok(record)
}

/// Rewrite a track's HEAD payload in place from `head_offsets`, leaving the
/// cursor back at end-of-file.
fn rewrite_head(raw: &mut Raw<File>, track: &TrackState) -> Result<()> {
    let end = raw.chunk_tell();
    let mut payload = [0u8; TRACK_HEAD_SIZE];
    for (slot, offset) in payload.chunks_exact_mut(8).zip(track.head_offsets) {
        slot.copy_from_slice(&offset.to_le_bytes());
    }
    raw.chunk_seek(track.head.offset)?;
    raw.write_payload(&payload)?;
    raw.chunk_seek(end)?;
    Ok(())
}

/// Resolve the on-disk body for a storage type.  String and Json bodies are
/// truncated at (and include) their first NUL; Invalid is always empty.
fn storage_body<'a>(storage: StorageType, data: &'a [u8]) -> Result<&'a [u8]> {
    match storage {
        StorageType::Invalid => Ok(&[]),
        StorageType::Binary  => Ok(data),
        StorageType::String | StorageType::Json => {
            match data.iter().position(|&b| b == 0) {
                Some(nul) => Ok(&data[..nul + 1]),
                None => Err(Error::param("string/json storage requires a NUL terminator")),
            }
        }
    }
}

impl Writer {
    /// Create `path` and seed it with the sentinel user-data chunk and the
    /// reserved source/signal definitions.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = Raw::create(path)?;
        let mut writer = Self {
            raw,
            ser: Serializer::new(),
            sources: (0..SOURCE_COUNT).map(|_| None).collect(),
            signals: (0..SIGNAL_COUNT).map(|_| None).collect(),
            source_mra: None,
            signal_mra: None,
            user_data_mra: None,
            payload_prev_length: 0,
            closed: false,
        };

        writer.user_data(0, StorageType::Invalid, &[])?;
        writer.source_def(&SourceDef {
            source_id: 0,
            name:    "global_annotation_source".into(),
            vendor:  "-".into(),
            model:   "-".into(),
            version: "-".into(),
            serial:  "-".into(),
        })?;
        writer.signal_def(&SignalDef {
            signal_id:   0,
            source_id:   0,
            signal_type: SignalType::Vsr,
            sample_rate: 0,
            name:        "global_annotation_signal".into(),
            ..SignalDef::default()
        })?;
        Ok(writer)
    }

    // ── Definitions ──────────────────────────────────────────────────────────

    pub fn source_def(&mut self, source: &SourceDef) -> Result<()> {
        self.ensure_open()?;
        let id = source.source_id as usize;
        if id >= SOURCE_COUNT {
            return Err(Error::param(format!(
                "source_id {} out of range (max {})",
                source.source_id,
                SOURCE_COUNT - 1
            )));
        }
        if self.sources[id].is_some() {
            return Err(Error::AlreadyExists);
        }

        self.ser.reset();
        self.ser.write_zero(SOURCE_DEF_RESERVED)?;
        self.ser.write_str(&source.name)?;
        self.ser.write_str(&source.vendor)?;
        self.ser.write_str(&source.model)?;
        self.ser.write_str(&source.version)?;
        self.ser.write_str(&source.serial)?;

        let record = append(
            &mut self.raw,
            &mut self.payload_prev_length,
            &mut self.source_mra,
            Tag::SourceDef,
            source.source_id,
            self.ser.as_slice(),
        )?;
        self.sources[id] = Some(record);
        Ok(())
    }

    pub fn signal_def(&mut self, signal: &SignalDef) -> Result<()> {
        self.ensure_open()?;
        let def = signal.validate()?;
        let id = def.signal_id as usize;
        if self.signals[id].is_some() {
            return Err(Error::AlreadyExists);
        }
        if self.sources[def.source_id as usize].is_none() {
            return Err(Error::NotFound);
        }
        if def.max_payload() > SCRATCH_SIZE {
            return Err(Error::NotEnoughMemory);
        }

        self.ser.reset();
        self.ser.write_u16(def.source_id)?;
        self.ser.write_u8(def.signal_type as u8)?;
        self.ser.write_u8(0)?;
        self.ser.write_u32(def.data_type as u32)?;
        self.ser.write_u32(def.sample_rate)?;
        self.ser.write_u32(def.samples_per_data)?;
        self.ser.write_u32(def.sample_decimate_factor)?;
        self.ser.write_u32(def.entries_per_summary)?;
        self.ser.write_u32(def.summary_decimate_factor)?;
        self.ser.write_u32(def.utc_rate_auto)?;
        self.ser.write_zero(SIGNAL_DEF_RESERVED)?;
        self.ser.write_str(&def.name)?;
        self.ser.write_str(&def.si_units)?;

        append(
            &mut self.raw,
            &mut self.payload_prev_length,
            &mut self.signal_mra,
            Tag::SignalDef,
            signal_meta(def.signal_id, 0),
            self.ser.as_slice(),
        )?;

        let mut state = SignalState::new(def);
        let meta = signal_meta(state.def.signal_id, 0);
        for &track_type in state.def.signal_type.tracks() {
            append(
                &mut self.raw,
                &mut self.payload_prev_length,
                &mut self.signal_mra,
                Tag::Track(track_type, TrackRole::Def),
                meta,
                &[],
            )?;
            let head = append(
                &mut self.raw,
                &mut self.payload_prev_length,
                &mut self.signal_mra,
                Tag::Track(track_type, TrackRole::Head),
                meta,
                &[0u8; TRACK_HEAD_SIZE],
            )?;
            state.tracks[track_type as usize] = Some(TrackState::new(head));
        }
        self.signals[id] = Some(state);
        Ok(())
    }

    // ── FSR samples ──────────────────────────────────────────────────────────

    /// Append `data` at `sample_id`.  The first call pins the signal's start;
    /// every later call must continue exactly where the previous one ended.
    pub fn fsr_f32(&mut self, signal_id: u16, sample_id: u64, data: &[f32]) -> Result<()> {
        self.ensure_open()?;
        let mut sig = self.take_signal(signal_id)?;
        let result = self.fsr_write(&mut sig, sample_id, data);
        self.signals[signal_id as usize] = Some(sig);
        result
    }

    fn fsr_write(&mut self, sig: &mut SignalState, sample_id: u64, data: &[f32]) -> Result<()> {
        if sig.def.signal_type != SignalType::Fsr {
            return Err(Error::NotSupported);
        }
        match sig.next_sample_id {
            None => {
                sig.buffer_start_id = sample_id;
            }
            Some(next) if next == sample_id => {}
            Some(next) => {
                warn!(
                    signal_id = sig.def.signal_id,
                    expected = next,
                    got = sample_id,
                    "non-contiguous fsr append rejected"
                );
                return Err(Error::param(format!(
                    "fsr append must continue at sample {next}, got {sample_id}"
                )));
            }
        }
        sig.next_sample_id = Some(sample_id + data.len() as u64);

        let capacity = sig.def.samples_per_data as usize;
        let mut data = data;
        while !data.is_empty() {
            let room = capacity - sig.sample_buffer.len();
            let take = room.min(data.len());
            sig.sample_buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if sig.sample_buffer.len() == capacity {
                self.flush_samples(sig)?;
            }
        }
        Ok(())
    }

    /// VSR sample writing is an extension point in this build.
    pub fn vsr_f32(&mut self, _signal_id: u16, _timestamps: &[u64], _data: &[f32]) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Emit the staged samples as a level-0 data chunk, update HEAD level 0,
    /// and feed the chunk's reductions into the level-1 staging.
    fn flush_samples(&mut self, sig: &mut SignalState) -> Result<()> {
        if sig.sample_buffer.is_empty() {
            return Ok(());
        }
        let count = sig.sample_buffer.len();
        let timestamp = sig.buffer_start_id;

        self.ser.reset();
        self.ser.write_u64(timestamp)?;
        self.ser.write_u64(count as u64)?;
        for &sample in &sig.sample_buffer {
            self.ser.write_f32(sample)?;
        }

        let signal_id = sig.def.signal_id;
        let track = sig.tracks[TrackType::Fsr as usize]
            .as_mut()
            .ok_or(Error::NotSupported)?;
        let record = append(
            &mut self.raw,
            &mut self.payload_prev_length,
            &mut track.data_mra,
            Tag::Track(TrackType::Fsr, TrackRole::Data),
            signal_meta(signal_id, 0),
            self.ser.as_slice(),
        )?;
        track.head_offsets[0] = record.offset;
        rewrite_head(&mut self.raw, track)?;

        // Reduce the emitted samples into level-1 entries.
        let staging = &mut sig.levels[1];
        if staging.entries.is_empty() {
            staging.start_id = timestamp;
        }
        staging.children.push(record.offset);
        for group in sig.sample_buffer.chunks(sig.def.sample_decimate_factor as usize) {
            let mut acc = SummaryAccum::new();
            for &sample in group {
                acc.add(sample);
            }
            staging.entries.push(acc);
        }

        sig.buffer_start_id += count as u64;
        sig.sample_buffer.clear();

        if sig.levels[1].entries.len() >= sig.def.entries_per_summary as usize {
            self.emit_summary(sig, 1)?;
        }
        Ok(())
    }

    /// Emit the staged entries at `level` as an INDEX + SUMMARY chunk pair,
    /// update the HEAD, and cascade the reductions into `level + 1`.
    fn emit_summary(&mut self, sig: &mut SignalState, level: usize) -> Result<()> {
        let (timestamp, accums, children) = {
            let staging = &mut sig.levels[level];
            if staging.entries.is_empty() {
                return Ok(());
            }
            (
                staging.start_id,
                std::mem::take(&mut staging.entries),
                std::mem::take(&mut staging.children),
            )
        };

        let signal_id = sig.def.signal_id;
        let meta = signal_meta(signal_id, level as u8);

        // INDEX: offsets of the level-below chunks the summary was built from.
        self.ser.reset();
        self.ser.write_u64(timestamp)?;
        self.ser.write_u64(children.len() as u64)?;
        for &offset in &children {
            self.ser.write_u64(offset)?;
        }
        let track = sig.tracks[TrackType::Fsr as usize]
            .as_mut()
            .ok_or(Error::NotSupported)?;
        let index = append(
            &mut self.raw,
            &mut self.payload_prev_length,
            &mut track.index_mra[level],
            Tag::Track(TrackType::Fsr, TrackRole::Index),
            meta,
            self.ser.as_slice(),
        )?;

        // SUMMARY: the serialized reductions, written right after its index.
        self.ser.reset();
        self.ser.write_u64(timestamp)?;
        self.ser.write_u64(accums.len() as u64)?;
        for acc in &accums {
            let entry = acc.entry();
            self.ser.write_f32(entry.mean)?;
            self.ser.write_f32(entry.min)?;
            self.ser.write_f32(entry.max)?;
            self.ser.write_f32(entry.std)?;
        }
        append(
            &mut self.raw,
            &mut self.payload_prev_length,
            &mut track.summary_mra[level],
            Tag::Track(TrackType::Fsr, TrackRole::Summary),
            meta,
            self.ser.as_slice(),
        )?;

        track.head_offsets[level] = index.offset;
        rewrite_head(&mut self.raw, track)?;

        if level + 1 < SUMMARY_LEVEL_COUNT {
            let factor = sig.def.summary_decimate_factor as usize;
            let staging = &mut sig.levels[level + 1];
            if staging.entries.is_empty() {
                staging.start_id = timestamp;
            }
            staging.children.push(index.offset);
            for group in accums.chunks(factor) {
                let mut acc = SummaryAccum::new();
                for child in group {
                    acc.merge(child);
                }
                staging.entries.push(acc);
            }
            if sig.levels[level + 1].entries.len() >= sig.def.entries_per_summary as usize {
                self.emit_summary(sig, level + 1)?;
            }
        }
        Ok(())
    }

    // ── Annotations / UTC / user data ────────────────────────────────────────

    /// Append an annotation to `signal_id`'s annotation track.
    pub fn annotation(
        &mut self,
        signal_id: u16,
        timestamp: u64,
        annotation_type: AnnotationType,
        storage: StorageType,
        body: &[u8],
    ) -> Result<()> {
        self.ensure_open()?;
        if storage == StorageType::Invalid {
            return Err(Error::param("annotation body requires a storage type"));
        }
        let body = storage_body(storage, body)?;
        let mut sig = self.take_signal(signal_id)?;
        let result = (|| -> Result<()> {
            self.ser.reset();
            self.ser.write_u64(timestamp)?;
            self.ser.write_u8(annotation_type as u8)?;
            self.ser.write_u8(storage as u8)?;
            self.ser.write_zero(ANNOTATION_PREFIX - 10)?;
            self.ser.write_bytes(body)?;
            let track = sig.tracks[TrackType::Annotation as usize]
                .as_mut()
                .ok_or(Error::NotSupported)?;
            append(
                &mut self.raw,
                &mut self.payload_prev_length,
                &mut track.data_mra,
                Tag::Track(TrackType::Annotation, TrackRole::Data),
                signal_meta(signal_id, 0),
                self.ser.as_slice(),
            )?;
            Ok(())
        })();
        self.signals[signal_id as usize] = Some(sig);
        result
    }

    /// Anchor `sample_id` of an FSR signal to a UTC timestamp.
    pub fn utc(&mut self, signal_id: u16, sample_id: u64, utc: i64) -> Result<()> {
        self.ensure_open()?;
        let mut sig = self.take_signal(signal_id)?;
        let result = (|| -> Result<()> {
            self.ser.reset();
            self.ser.write_u64(sample_id)?;
            self.ser.write_i64(utc)?;
            let track = sig.tracks[TrackType::Utc as usize]
                .as_mut()
                .ok_or(Error::NotSupported)?;
            append(
                &mut self.raw,
                &mut self.payload_prev_length,
                &mut track.data_mra,
                Tag::Track(TrackType::Utc, TrackRole::Data),
                signal_meta(signal_id, 0),
                self.ser.as_slice(),
            )?;
            Ok(())
        })();
        self.signals[signal_id as usize] = Some(sig);
        result
    }

    /// Append an application-defined chunk to the user-data chain.
    /// `meta` is masked to 12 bits; the storage type occupies the top four.
    pub fn user_data(&mut self, meta: u16, storage: StorageType, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let body = storage_body(storage, data)?;
        append(
            &mut self.raw,
            &mut self.payload_prev_length,
            &mut self.user_data_mra,
            Tag::UserData,
            user_data_meta(meta, storage),
            body,
        )?;
        Ok(())
    }

    // ── Close ────────────────────────────────────────────────────────────────

    /// Flush partial sample buffers and partial summaries, then close the
    /// raw layer.  Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for id in 0..SIGNAL_COUNT {
            if let Some(mut sig) = self.signals[id].take() {
                let result = self.flush_signal(&mut sig);
                self.signals[id] = Some(sig);
                result?;
            }
        }
        self.raw.flush()?;
        self.closed = true;
        Ok(())
    }

    fn flush_signal(&mut self, sig: &mut SignalState) -> Result<()> {
        if sig.def.signal_type != SignalType::Fsr {
            return Ok(());
        }
        self.flush_samples(sig)?;
        for level in 1..SUMMARY_LEVEL_COUNT {
            self.emit_summary(sig, level)?;
        }
        Ok(())
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::param("writer is closed"));
        }
        Ok(())
    }

    fn take_signal(&mut self, signal_id: u16) -> Result<SignalState> {
        let id = signal_id as usize;
        if id >= SIGNAL_COUNT {
            return Err(Error::param(format!(
                "signal_id {signal_id} out of range (max {})",
                SIGNAL_COUNT - 1
            )));
        }
        self.signals[id].take().ok_or(Error::NotFound)
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.close() {
                warn!(error = %e, "writer close failed during drop");
            }
        }
    }
}
