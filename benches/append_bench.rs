use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use jls::writer::Writer;
use jls::{SignalDef, SignalType, SourceDef};
use tempfile::tempdir;

fn bench_fsr_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("fsr_append");
    group.throughput(Throughput::Elements(1_000_000));
    group.sample_size(10);
    group.bench_function("write_1m_samples", |b| {
        let dir = tempdir().unwrap();
        let block = vec![0.5f32; 65_536];
        let mut run = 0u32;
        b.iter(|| {
            let path = dir.path().join(format!("bench_{run}.jls"));
            run += 1;
            let mut writer = Writer::open(&path).unwrap();
            writer.source_def(&SourceDef::new(1, "bench")).unwrap();
            writer
                .signal_def(&SignalDef {
                    signal_id: 1,
                    source_id: 1,
                    signal_type: SignalType::Fsr,
                    sample_rate: 1_000_000,
                    name: "bench".into(),
                    ..SignalDef::default()
                })
                .unwrap();
            let mut sample_id = 0u64;
            while sample_id < 1_000_000 {
                let n = block.len().min((1_000_000 - sample_id) as usize);
                writer.fsr_f32(1, sample_id, &block[..n]).unwrap();
                sample_id += n as u64;
            }
            writer.close().unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_fsr_append);
criterion_main!(benches);
