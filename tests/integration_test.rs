use tempfile::tempdir;

use jls::chunk::{Tag, TrackRole, TrackType};
use jls::raw::Raw;
use jls::reader::Reader;
use jls::writer::Writer;
use jls::{Error, SignalDef, SignalType, SourceDef, StorageType, SummaryEntry};

fn write_source(writer: &mut Writer, source_id: u16, name: &str) {
    writer
        .source_def(&SourceDef {
            source_id,
            name:    name.into(),
            vendor:  "acme".into(),
            model:   "m1".into(),
            version: "1.0".into(),
            serial:  "sn-001".into(),
        })
        .unwrap();
}

fn fsr_signal(signal_id: u16, source_id: u16, samples_per_data: u32) -> SignalDef {
    SignalDef {
        signal_id,
        source_id,
        signal_type: SignalType::Fsr,
        sample_rate: 1_000_000,
        samples_per_data,
        name: format!("signal_{signal_id}"),
        si_units: "V".into(),
        ..SignalDef::default()
    }
}

/// Triangle wave, period 1000, amplitude ±1 (the generate waveform).
fn triangle(sample_id: u64) -> f32 {
    let phase = (sample_id % 1000) as f32;
    if phase <= 500.0 {
        -1.0 + phase / 250.0
    } else {
        3.0 - phase / 250.0
    }
}

// ── Scenario 1: generate geometry, length and point queries ─────────────────

#[test]
fn triangle_10m_length_and_point_reads() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("triangle.jls");
    const LENGTH: u64 = 10_000_000;

    {
        let mut writer = Writer::open(&path).unwrap();
        write_source(&mut writer, 1, "performance");
        writer
            .signal_def(&SignalDef {
                signal_id: 1,
                source_id: 1,
                signal_type: SignalType::Fsr,
                sample_rate: 1_000_000,
                samples_per_data: 100_000,
                sample_decimate_factor: 100,
                entries_per_summary: 20_000,
                summary_decimate_factor: 100,
                name: "current".into(),
                si_units: "A".into(),
                ..SignalDef::default()
            })
            .unwrap();

        let mut block = vec![0f32; 65_536];
        let mut sample_id = 0u64;
        while sample_id < LENGTH {
            let n = block.len().min((LENGTH - sample_id) as usize);
            for (i, slot) in block[..n].iter_mut().enumerate() {
                *slot = triangle(sample_id + i as u64);
            }
            writer.fsr_f32(1, sample_id, &block[..n]).unwrap();
            sample_id += n as u64;
        }
        writer.close().unwrap();
    }

    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(reader.fsr_length(1).unwrap(), LENGTH);

    // Sample 250 sits on the rising edge: -1 + 2*(250 % 1000)/500 = 0.
    let mut one = [0f32; 1];
    reader.fsr_f32(1, 250, &mut one).unwrap();
    assert_eq!(one[0], -1.0 + 2.0 * 250.0 / 500.0);

    // Spot checks across chunk and summary boundaries.
    for sample_id in [0, 500, 999, 99_999, 100_000, 2_000_000, LENGTH - 1] {
        reader.fsr_f32(1, sample_id, &mut one).unwrap();
        assert_eq!(one[0], triangle(sample_id), "sample {sample_id}");
    }

    // Seek correctness: the seeked chunk yields the same value fsr_f32 does.
    for sample_id in [0, 123_456, 5_000_000, LENGTH - 1] {
        reader.seek(1, 0, sample_id).unwrap();
        reader.fsr_f32(1, sample_id, &mut one).unwrap();
        assert_eq!(one[0], triangle(sample_id));
    }

    // Summary monotonicity at level 1, and level-2 min/max against its
    // level-1 children.
    let zero = SummaryEntry { mean: 0.0, min: 0.0, max: 0.0, std: 0.0 };
    let mut level1 = vec![zero; 100];
    reader.fsr_summary_f32(1, 0, 1, &mut level1).unwrap();
    for entry in &level1 {
        assert!(entry.min <= entry.mean && entry.mean <= entry.max);
    }
    // Entry 0 covers samples 0..100 of the rising edge.
    assert_eq!(level1[0].min, -1.0);
    assert_eq!(level1[0].max, triangle(99));
    assert!((level1[0].mean - (-1.0 + 99.0 / 500.0)).abs() < 1e-4);

    let mut level2 = vec![zero; 1];
    reader.fsr_summary_f32(1, 0, 2, &mut level2).unwrap();
    let child_min = level1.iter().map(|e| e.min).fold(f32::INFINITY, f32::min);
    let child_max = level1.iter().map(|e| e.max).fold(f32::NEG_INFINITY, f32::max);
    assert_eq!(level2[0].min, child_min);
    assert_eq!(level2[0].max, child_max);
}

// ── Scenario 2: descriptors round-trip ───────────────────────────────────────

#[test]
fn sources_and_signals_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("defs.jls");

    {
        let mut writer = Writer::open(&path).unwrap();
        write_source(&mut writer, 1, "front-end");
        write_source(&mut writer, 3, "back-end");
        writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
        writer.signal_def(&fsr_signal(5, 3, 1000)).unwrap();
        writer.close().unwrap();
    }

    let mut reader = Reader::open(&path).unwrap();

    let sources = reader.sources();
    assert_eq!(sources.len(), 2);
    assert_eq!(sources[0].source_id, 1);
    assert_eq!(sources[0].name, "front-end");
    assert_eq!(sources[0].vendor, "acme");
    assert_eq!(sources[0].serial, "sn-001");
    assert_eq!(sources[1].source_id, 3);
    assert_eq!(sources[1].name, "back-end");

    let signals = reader.signals();
    assert_eq!(signals.len(), 2);
    assert_eq!(signals[0].signal_id, 1);
    assert_eq!(signals[0].source_id, 1);
    assert_eq!(signals[0].name, "signal_1");
    assert_eq!(signals[0].si_units, "V");
    assert_eq!(signals[1].signal_id, 5);
    assert_eq!(signals[1].source_id, 3);
    assert_eq!(signals[1].name, "signal_5");

    // No samples written: length is 0 for both.
    assert_eq!(reader.fsr_length(1).unwrap(), 0);
    assert_eq!(reader.fsr_length(5).unwrap(), 0);
}

// ── Scenario 3: user data iteration ──────────────────────────────────────────

#[test]
fn user_data_iteration() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("user.jls");

    {
        let mut writer = Writer::open(&path).unwrap();
        writer.user_data(1, StorageType::Binary, &[0xDE, 0xAD, 0xBE, 0xEF]).unwrap();
        writer.user_data(2, StorageType::String, b"hello\0").unwrap();
        writer.user_data(3, StorageType::Json, b"{\"k\":1}\0").unwrap();
        writer.close().unwrap();
    }

    let mut reader = Reader::open(&path).unwrap();

    let expected: [(u16, StorageType, &[u8]); 3] = [
        (1, StorageType::Binary, &[0xDE, 0xAD, 0xBE, 0xEF]),
        (2, StorageType::String, b"hello\0"),
        (3, StorageType::Json, b"{\"k\":1}\0"),
    ];
    for (meta, storage, data) in expected {
        let ud = reader.user_data_next().unwrap();
        assert_eq!(ud.meta, meta);
        assert_eq!(ud.storage, storage);
        assert_eq!(ud.data, data);
    }
    assert!(matches!(reader.user_data_next(), Err(Error::Empty)));

    // Reset then traverse again: same three entries, same order.
    reader.user_data_reset();
    for (meta, _, _) in expected {
        assert_eq!(reader.user_data_next().unwrap().meta, meta);
    }

    // Backwards from the tail: 2, then 1, then the sentinel stops iteration
    // and resets the cursor.
    assert_eq!(reader.user_data_prev().unwrap().meta, 2);
    assert_eq!(reader.user_data_prev().unwrap().meta, 1);
    assert!(matches!(reader.user_data_prev(), Err(Error::Empty)));
    assert_eq!(reader.user_data_next().unwrap().meta, 1);
}

// ── Scenario 4: partial trailing chunk ───────────────────────────────────────

#[test]
fn partial_trailing_chunk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("partial.jls");
    let samples: Vec<f32> = (0..3500).map(|i| (i as f32) * 0.25 - 400.0).collect();

    {
        let mut writer = Writer::open(&path).unwrap();
        write_source(&mut writer, 1, "src");
        writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
        writer.fsr_f32(1, 0, &samples).unwrap();
        writer.close().unwrap();
    }

    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(reader.fsr_length(1).unwrap(), 3500);

    // Bit-identical round trip across all chunk boundaries.
    let mut out = vec![0f32; 3500];
    reader.fsr_f32(1, 0, &mut out).unwrap();
    assert_eq!(out, samples);

    // Reading past the end is Empty.
    let mut beyond = [0f32; 10];
    assert!(matches!(reader.fsr_f32(1, 3495, &mut beyond), Err(Error::Empty)));

    // On disk: three full data chunks plus a 500-sample tail.
    let mut raw = Raw::open(&path).unwrap();
    let mut data_payloads = Vec::new();
    loop {
        match raw.read_header() {
            Ok(header) => {
                if header.tag == Tag::Track(TrackType::Fsr, TrackRole::Data) {
                    data_payloads.push((header.payload_length as usize - 16) / 4);
                }
            }
            Err(Error::Empty) => break,
            Err(e) => panic!("scan failed: {e:?}"),
        }
    }
    assert_eq!(data_payloads, vec![1000, 1000, 1000, 500]);
}

// ── Scenario 5: signal with undefined source ─────────────────────────────────

#[test]
fn signal_with_unknown_source_is_not_found() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("badsig.jls");

    {
        let mut writer = Writer::open(&path).unwrap();
        write_source(&mut writer, 1, "src");
        assert!(matches!(
            writer.signal_def(&fsr_signal(7, 99, 1000)),
            Err(Error::NotFound)
        ));
        // The failed definition leaves the file usable.
        writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
        writer.close().unwrap();
    }

    let mut reader = Reader::open(&path).unwrap();
    let signals = reader.signals();
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].signal_id, 1);
    assert!(matches!(reader.fsr_length(7), Err(Error::NotFound)));
}

// ── Scenario 6: truncated tail ───────────────────────────────────────────────

#[test]
fn truncated_file_still_opens() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("whole.jls");
    let cut_path = dir.path().join("cut.jls");
    let samples: Vec<f32> = (0..5000).map(|i| (i % 97) as f32).collect();

    {
        let mut writer = Writer::open(&path).unwrap();
        write_source(&mut writer, 1, "src");
        writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
        writer.fsr_f32(1, 0, &samples).unwrap();
        writer.close().unwrap();
    }

    // Cut the file mid-payload of its final chunk.
    let mut bytes = std::fs::read(&path).unwrap();
    bytes.truncate(bytes.len() - 7);
    std::fs::write(&cut_path, &bytes).unwrap();

    let mut reader = Reader::open(&cut_path).unwrap();
    assert_eq!(reader.signals().len(), 1);
    assert_eq!(reader.fsr_length(1).unwrap(), 5000);

    // Everything before the break reads back intact.
    let mut out = vec![0f32; 5000];
    reader.fsr_f32(1, 0, &mut out).unwrap();
    assert_eq!(out, samples);

    // The final chunk was a top-level summary; reading it lands past the
    // break and reports Empty.
    let zero = SummaryEntry { mean: 0.0, min: 0.0, max: 0.0, std: 0.0 };
    let mut entries = vec![zero; 1];
    assert!(matches!(
        reader.fsr_summary_f32(1, 0, 7, &mut entries),
        Err(Error::Empty)
    ));
}

// ── Chain invariants ─────────────────────────────────────────────────────────

/// Every chunk's `payload_prev_length` equals the payload length of the
/// chunk written immediately before it (linear, across all kinds), and every
/// `item_prev` points backwards.
#[test]
fn linear_and_chain_invariants() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("chain.jls");

    {
        let mut writer = Writer::open(&path).unwrap();
        write_source(&mut writer, 1, "src");
        writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
        writer.user_data(9, StorageType::Binary, &[1, 2, 3]).unwrap();
        writer.fsr_f32(1, 0, &vec![0.5f32; 2500]).unwrap();
        writer.user_data(10, StorageType::String, b"tail\0").unwrap();
        writer.close().unwrap();
    }

    let mut raw = Raw::open(&path).unwrap();
    let mut prev_payload = 0u32;
    let mut offsets = Vec::new();
    loop {
        let offset = raw.chunk_tell();
        match raw.read_header() {
            Ok(header) => {
                assert_eq!(
                    header.payload_prev_length, prev_payload,
                    "payload_prev_length mismatch at {offset}"
                );
                assert!(header.item_prev <= offset, "forward item_prev at {offset}");
                prev_payload = header.payload_length;
                offsets.push(offset);
            }
            Err(Error::Empty) => break,
            Err(e) => panic!("walk failed: {e:?}"),
        }
    }
    assert!(offsets.len() > 10);

    // Forward traversal of the user-data chain visits the appended chunks in
    // file-offset order.
    let mut reader = Reader::open(&path).unwrap();
    let metas: Vec<u16> = std::iter::from_fn(|| reader.user_data_next().ok().map(|u| u.meta))
        .collect();
    assert_eq!(metas, vec![9, 10]);
}

/// A payload-level corruption of the self-declared `count` field leaves the
/// header CRC valid; reads must reject it, not index past the payload.
#[test]
fn corrupt_count_is_rejected_not_trusted() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("whole.jls");
    let corrupt_path = dir.path().join("corrupt.jls");

    {
        let mut writer = Writer::open(&path).unwrap();
        write_source(&mut writer, 1, "src");
        writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
        writer.fsr_f32(1, 0, &vec![1.5f32; 1500]).unwrap();
        writer.close().unwrap();
    }

    // Locate the first FSR data chunk and inflate its count field.  The
    // count lives 8 bytes into the payload, outside the header CRC.
    let mut raw = Raw::open(&path).unwrap();
    let data_offset = loop {
        let offset = raw.chunk_tell();
        match raw.read_header() {
            Ok(h) if h.tag == Tag::Track(TrackType::Fsr, TrackRole::Data) => break offset,
            Ok(_) => {}
            Err(e) => panic!("no data chunk found: {e:?}"),
        }
    };
    let mut bytes = std::fs::read(&path).unwrap();
    let count_at = data_offset as usize + jls::HEADER_SIZE + 8;
    bytes[count_at..count_at + 8].copy_from_slice(&u64::MAX.to_le_bytes());
    std::fs::write(&corrupt_path, &bytes).unwrap();

    let mut reader = Reader::open(&corrupt_path).unwrap();
    let mut out = [0f32; 4];
    assert!(matches!(
        reader.fsr_f32(1, 0, &mut out),
        Err(Error::ParameterInvalid(_))
    ));
}

#[test]
fn duplicate_definitions_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dup.jls");

    let mut writer = Writer::open(&path).unwrap();
    write_source(&mut writer, 1, "src");
    assert!(matches!(
        writer.source_def(&SourceDef::new(1, "again")),
        Err(Error::AlreadyExists)
    ));
    writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
    assert!(matches!(
        writer.signal_def(&fsr_signal(1, 1, 1000)),
        Err(Error::AlreadyExists)
    ));
    // Reserved ids are taken by the writer itself.
    assert!(matches!(
        writer.source_def(&SourceDef::new(0, "reserved")),
        Err(Error::AlreadyExists)
    ));
    writer.close().unwrap();
}

#[test]
fn non_contiguous_append_rejected() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("gap.jls");

    let mut writer = Writer::open(&path).unwrap();
    write_source(&mut writer, 1, "src");
    writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
    writer.fsr_f32(1, 100, &[1.0; 50]).unwrap();
    assert!(matches!(
        writer.fsr_f32(1, 200, &[1.0; 50]),
        Err(Error::ParameterInvalid(_))
    ));
    writer.fsr_f32(1, 150, &[2.0; 50]).unwrap();
    writer.close().unwrap();

    // The pinned start offset survives the round trip.
    let mut reader = Reader::open(&path).unwrap();
    assert_eq!(reader.fsr_length(1).unwrap(), 200);
    let mut out = [0f32; 2];
    reader.fsr_f32(1, 149, &mut out).unwrap();
    assert_eq!(out, [1.0, 2.0]);
}

#[test]
fn annotations_and_utc_append() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ann.jls");

    let mut writer = Writer::open(&path).unwrap();
    write_source(&mut writer, 1, "src");
    writer.signal_def(&fsr_signal(1, 1, 1000)).unwrap();
    writer
        .annotation(1, 42, jls::AnnotationType::Text, StorageType::String, b"spike\0")
        .unwrap();
    writer.utc(1, 0, 1_700_000_000_000_000).unwrap();
    // Global annotations ride on the reserved VSR signal 0.
    writer
        .annotation(0, 7, jls::AnnotationType::User, StorageType::Binary, &[1, 2])
        .unwrap();
    // UTC is an FSR-track concern; the VSR annotation signal has none.
    assert!(matches!(writer.utc(0, 0, 0), Err(Error::NotSupported)));
    writer.close().unwrap();

    // Annotation reads are stubbed, not invented.
    let mut reader = Reader::open(&path).unwrap();
    assert!(matches!(reader.annotations(1), Err(Error::NotSupported)));
    assert!(matches!(
        reader.fsr_length(0),
        Err(Error::NotSupported)
    ));
}
