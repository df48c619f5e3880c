//! Source and signal descriptors, summary-entry layout, shared constants.
//!
//! Descriptors are created once per file (writer) or once per open (reader)
//! and live until close.  [`SignalDef::validate`] normalizes the pyramid
//! parameters before anything is written; the adjustments are logged at warn
//! level so a caller can see when its request was raised.

use tracing::warn;

use crate::chunk::TrackType;
use crate::error::{Error, Result};

/// Number of source descriptor slots.  `source_id` 0 is reserved for the
/// global annotation source.
pub const SOURCE_COUNT: usize = 256;

/// Number of signal descriptor slots (ids must fit the 12-bit chunk_meta
/// field).  `signal_id` 0 is reserved for global VSR annotations.
pub const SIGNAL_COUNT: usize = 256;

/// Levels in the summary pyramid, level 0 being raw data.
pub const SUMMARY_LEVEL_COUNT: usize = 8;

/// Byte size of a track HEAD payload: one offset per level.
pub const TRACK_HEAD_SIZE: usize = SUMMARY_LEVEL_COUNT * 8;

/// Reserved bytes at the head of a source-def payload.
pub const SOURCE_DEF_RESERVED: usize = 64;

/// Reserved bytes between the fixed signal-def fields and its strings.
pub const SIGNAL_DEF_RESERVED: usize = 68;

/// Fixed signal-def payload bytes before the strings: ten numeric fields
/// (32 bytes) plus the reserved area.
pub const SIGNAL_DEF_FIXED: usize = 32 + SIGNAL_DEF_RESERVED;

/// Fixed prefix of an annotation payload before the body:
/// `timestamp | annotation_type | storage_type | 6 reserved`.
pub const ANNOTATION_PREFIX: usize = 16;

// ── Signal type / data type ──────────────────────────────────────────────────

/// Sampling regime of a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SignalType {
    /// Fixed sample rate: samples addressed by a 64-bit sample id.
    Fsr = 0,
    /// Variable sample rate: each entry carries its own timestamp.
    Vsr = 1,
}

impl SignalType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(SignalType::Fsr),
            1 => Some(SignalType::Vsr),
            _ => None,
        }
    }

    /// Tracks a signal of this type may carry.
    pub fn tracks(self) -> &'static [TrackType] {
        match self {
            SignalType::Fsr => &[TrackType::Fsr, TrackType::Annotation, TrackType::Utc],
            SignalType::Vsr => &[TrackType::Vsr, TrackType::Annotation],
        }
    }
}

/// Sample data type.  32-bit float is the only type this build stores;
/// the field is 32 bits wide on disk to leave room for the closed set to
/// grow without a header change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DataType {
    F32 = 0,
}

impl DataType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(DataType::F32),
            _ => None,
        }
    }
}

/// Annotation kinds carried on a signal's annotation track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AnnotationType {
    User    = 0,
    Text    = 1,
    VMarker = 2,
    HMarker = 3,
}

impl AnnotationType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AnnotationType::User),
            1 => Some(AnnotationType::Text),
            2 => Some(AnnotationType::VMarker),
            3 => Some(AnnotationType::HMarker),
            _ => None,
        }
    }
}

// ── Source descriptor ────────────────────────────────────────────────────────

/// Identity of a data producer.  All five strings are free-form UTF-8.
#[derive(Debug, Clone, Default)]
pub struct SourceDef {
    pub source_id: u16,
    pub name:      String,
    pub vendor:    String,
    pub model:     String,
    pub version:   String,
    pub serial:    String,
}

impl SourceDef {
    pub fn new(source_id: u16, name: &str) -> Self {
        Self {
            source_id,
            name: name.to_owned(),
            ..Self::default()
        }
    }
}

// ── Signal descriptor ────────────────────────────────────────────────────────

/// Full description of one signal, including its summary-pyramid geometry.
///
/// - `samples_per_data`: samples per level-0 data chunk.
/// - `sample_decimate_factor`: samples collapsed into one level-1 entry.
/// - `entries_per_summary`: entries per summary chunk (any level).
/// - `summary_decimate_factor`: level-k entries collapsed into one
///   level-(k+1) entry.
/// - `utc_rate_auto`: opaque pass-through, not interpreted by this build.
#[derive(Debug, Clone)]
pub struct SignalDef {
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
    pub name:                    String,
    pub si_units:                String,
}

impl Default for SignalDef {
    fn default() -> Self {
        Self {
            signal_id:               0,
            source_id:               0,
            signal_type:             SignalType::Fsr,
            data_type:               DataType::F32,
            sample_rate:             0,
            samples_per_data:        100_000,
            sample_decimate_factor:  100,
            entries_per_summary:     20_000,
            summary_decimate_factor: 100,
            utc_rate_auto:           0,
            name:                    String::new(),
            si_units:                String::new(),
        }
    }
}

impl SignalDef {
    /// Check id ranges and type constraints, then return a copy with the
    /// pyramid parameters normalized:
    ///
    /// - `summary_decimate_factor` floored at 10, `entries_per_summary` at
    ///   1000;
    /// - `samples_per_data` raised to a multiple of `sample_decimate_factor`
    ///   and `entries_per_summary` to a multiple of
    ///   `summary_decimate_factor`, so entries never straddle chunks.
    ///
    /// Each raise is logged at warn level.  VSR signals have their
    /// `sample_rate` forced to 0; FSR signals require a non-zero rate.
    pub fn validate(&self) -> Result<SignalDef> {
        let mut def = self.clone();

        if def.signal_id as usize >= SIGNAL_COUNT {
            return Err(Error::param(format!(
                "signal_id {} out of range (max {})",
                def.signal_id,
                SIGNAL_COUNT - 1
            )));
        }
        if def.source_id as usize >= SOURCE_COUNT {
            return Err(Error::param(format!(
                "source_id {} out of range (max {})",
                def.source_id,
                SOURCE_COUNT - 1
            )));
        }
        match def.signal_type {
            SignalType::Fsr => {
                if def.sample_rate == 0 {
                    return Err(Error::param("FSR signal requires sample_rate > 0"));
                }
            }
            SignalType::Vsr => {
                if def.sample_rate != 0 {
                    warn!(
                        signal_id = def.signal_id,
                        "VSR signal: forcing sample_rate to 0"
                    );
                    def.sample_rate = 0;
                }
            }
        }

        if def.summary_decimate_factor < 10 {
            warn!(
                signal_id = def.signal_id,
                requested = def.summary_decimate_factor,
                "summary_decimate_factor raised to floor 10"
            );
            def.summary_decimate_factor = 10;
        }
        if def.entries_per_summary < 1000 {
            warn!(
                signal_id = def.signal_id,
                requested = def.entries_per_summary,
                "entries_per_summary raised to floor 1000"
            );
            def.entries_per_summary = 1000;
        }
        if def.sample_decimate_factor == 0 {
            return Err(Error::param("sample_decimate_factor must be non-zero"));
        }
        if def.samples_per_data == 0 {
            return Err(Error::param("samples_per_data must be non-zero"));
        }

        let round_up = |value: u32, multiple: u32| value.div_ceil(multiple) * multiple;
        let spd = round_up(def.samples_per_data, def.sample_decimate_factor);
        if spd != def.samples_per_data {
            warn!(
                signal_id = def.signal_id,
                requested = def.samples_per_data,
                adjusted = spd,
                "samples_per_data raised to a multiple of sample_decimate_factor"
            );
            def.samples_per_data = spd;
        }
        // A level-1 summary chunk must split on data-chunk boundaries, and a
        // level-k chunk on level-(k-1) grouping boundaries, so
        // entries_per_summary is a multiple of both the per-data-chunk entry
        // batch and summary_decimate_factor.
        let batch = def.samples_per_data / def.sample_decimate_factor;
        let eps = round_up(
            def.entries_per_summary,
            lcm(def.summary_decimate_factor, batch),
        );
        if eps != def.entries_per_summary {
            warn!(
                signal_id = def.signal_id,
                requested = def.entries_per_summary,
                adjusted = eps,
                "entries_per_summary raised to align with chunk boundaries"
            );
            def.entries_per_summary = eps;
        }
        Ok(def)
    }

    /// Payload bytes of the largest chunk this signal can produce; used to
    /// reject geometries the writer's scratch region cannot serialize.
    pub fn max_payload(&self) -> usize {
        let data = 16 + self.samples_per_data as usize * 4;
        let summary = 16 + self.entries_per_summary as usize * SUMMARY_ENTRY_SIZE;
        data.max(summary)
    }

    /// Original-signal samples collapsed into one entry at `level`.
    /// Level 0 entries are raw samples.
    pub fn samples_per_entry(&self, level: usize) -> u64 {
        match level {
            0 => 1,
            _ => {
                self.sample_decimate_factor as u64
                    * (self.summary_decimate_factor as u64).pow(level as u32 - 1)
            }
        }
    }

    /// Original-signal samples spanned by one complete chunk at `level`.
    /// Pyramid descent at level L divides by `chunk_span(L - 1)` to choose
    /// the child chunk.
    pub fn chunk_span(&self, level: usize) -> u64 {
        match level {
            0 => self.samples_per_data as u64,
            _ => self.entries_per_summary as u64 * self.samples_per_entry(level),
        }
    }
}

fn gcd(a: u32, b: u32) -> u32 {
    let (mut a, mut b) = (a, b);
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u32, b: u32) -> u32 {
    if a == 0 || b == 0 {
        return a.max(b);
    }
    a / gcd(a, b) * b
}

// ── Summary entries ──────────────────────────────────────────────────────────

/// Byte size of one serialized [`SummaryEntry`].
pub const SUMMARY_ENTRY_SIZE: usize = 16;

/// One reduction tuple in a summary chunk: `mean | min | max | std`, each a
/// little-endian f32.  The layout is frozen; writer and reader round-trip it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SummaryEntry {
    pub mean: f32,
    pub min:  f32,
    pub max:  f32,
    pub std:  f32,
}

/// Streaming reduction over samples (or over lower-level reductions),
/// accumulated in f64 so deep pyramids do not lose precision.
///
/// Mean/variance use Welford updates; [`merge`](Self::merge) combines two
/// accumulators with the count-weighted (parallel) form.
#[derive(Debug, Clone, Copy)]
pub struct SummaryAccum {
    pub count: u64,
    mean:      f64,
    m2:        f64,
    min:       f64,
    max:       f64,
}

impl SummaryAccum {
    pub fn new() -> Self {
        Self {
            count: 0,
            mean:  0.0,
            m2:    0.0,
            min:   f64::INFINITY,
            max:   f64::NEG_INFINITY,
        }
    }

    pub fn add(&mut self, x: f32) {
        let x = x as f64;
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn merge(&mut self, other: &SummaryAccum) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n = (self.count + other.count) as f64;
        let delta = other.mean - self.mean;
        self.mean += delta * other.count as f64 / n;
        self.m2 += other.m2 + delta * delta * (self.count as f64) * (other.count as f64) / n;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
    }

    /// Collapse into the serialized entry form.  Population standard
    /// deviation; an empty accumulator yields all-NaN statistics.
    pub fn entry(&self) -> SummaryEntry {
        if self.count == 0 {
            return SummaryEntry {
                mean: f32::NAN,
                min:  f32::NAN,
                max:  f32::NAN,
                std:  f32::NAN,
            };
        }
        SummaryEntry {
            mean: self.mean as f32,
            min:  self.min as f32,
            max:  self.max as f32,
            std:  (self.m2 / self.count as f64).max(0.0).sqrt() as f32,
        }
    }
}

impl Default for SummaryAccum {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn validate_applies_floors() {
        let def = SignalDef {
            signal_id: 1,
            source_id: 1,
            sample_rate: 1000,
            summary_decimate_factor: 2,
            entries_per_summary: 10,
            ..SignalDef::default()
        };
        let v = def.validate().unwrap();
        assert_eq!(v.summary_decimate_factor, 10);
        assert_eq!(v.entries_per_summary, 1000);
    }

    #[test]
    fn validate_rounds_to_multiples() {
        let def = SignalDef {
            signal_id: 1,
            source_id: 1,
            sample_rate: 1000,
            samples_per_data: 1050,
            sample_decimate_factor: 100,
            ..SignalDef::default()
        };
        let v = def.validate().unwrap();
        assert_eq!(v.samples_per_data, 1100);
    }

    #[test]
    fn fsr_requires_rate() {
        let def = SignalDef {
            signal_id: 1,
            source_id: 1,
            sample_rate: 0,
            ..SignalDef::default()
        };
        assert!(matches!(def.validate(), Err(Error::ParameterInvalid(_))));
    }

    #[test]
    fn pyramid_geometry() {
        let def = SignalDef {
            sample_rate: 1_000_000,
            ..SignalDef::default()
        };
        assert_eq!(def.samples_per_entry(1), 100);
        assert_eq!(def.samples_per_entry(2), 10_000);
        assert_eq!(def.chunk_span(0), 100_000);
        assert_eq!(def.chunk_span(1), 2_000_000);
        assert_eq!(def.chunk_span(2), 200_000_000);
    }

    proptest! {
        /// min ≤ mean ≤ max for any sample set, and merging accumulators
        /// agrees with accumulating the concatenation.
        #[test]
        fn summary_reduction_bounds(a in prop::collection::vec(-1e6f32..1e6, 1..200),
                                    b in prop::collection::vec(-1e6f32..1e6, 1..200)) {
            let mut left = SummaryAccum::new();
            for &x in &a { left.add(x); }
            let mut right = SummaryAccum::new();
            for &x in &b { right.add(x); }

            let mut whole = SummaryAccum::new();
            for &x in a.iter().chain(&b) { whole.add(x); }

            left.merge(&right);
            let merged = left.entry();
            let direct = whole.entry();

            prop_assert!(merged.min <= merged.mean + 1e-3);
            prop_assert!(merged.mean <= merged.max + 1e-3);
            prop_assert_eq!(merged.min, direct.min);
            prop_assert_eq!(merged.max, direct.max);
            prop_assert!((merged.mean - direct.mean).abs() <= 1e-2 * direct.mean.abs().max(1.0));
            prop_assert!((merged.std - direct.std).abs() <= 1e-2 * direct.std.abs().max(1.0));
        }
    }
}
