use std::path::PathBuf;
use std::time::Instant;

use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand};
use serde::Serialize;

use jls::reader::Reader;
use jls::writer::Writer;
use jls::{SignalDef, SignalType, SourceDef, SummaryEntry, SUMMARY_LEVEL_COUNT};

#[derive(Parser)]
#[command(name = "performance", version, about = "JLS performance tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a triangle-wave JLS file with the given signal geometry
    Generate {
        filename: PathBuf,
        /// Samples per second
        #[arg(long = "sample_rate", default_value = "1000000")]
        sample_rate: u32,
        /// Total samples to write
        #[arg(long = "length", default_value = "10000000")]
        length: u64,
        /// Samples per level-0 data chunk
        #[arg(long = "samples_per_data", default_value = "100000")]
        samples_per_data: u32,
        /// Samples per level-1 summary entry
        #[arg(long = "sample_decimate_factor", default_value = "100")]
        sample_decimate_factor: u32,
        /// Entries per summary chunk
        #[arg(long = "entries_per_summary", default_value = "20000")]
        entries_per_summary: u32,
        /// Entries collapsed per next-level entry
        #[arg(long = "summary_decimate_factor", default_value = "100")]
        summary_decimate_factor: u32,
    },
    /// Profile open, length, seek, and read latency of a JLS file
    Profile {
        filename: PathBuf,
        /// Emit the report as JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

// ── Profile report ───────────────────────────────────────────────────────────

#[derive(Serialize)]
struct SeekTiming {
    sample_id: u64,
    micros:    u128,
}

#[derive(Serialize)]
struct ReadTiming {
    sample_id: u64,
    samples:   usize,
    micros:    u128,
}

#[derive(Serialize)]
struct SummaryTiming {
    level:   usize,
    entries: usize,
    micros:  u128,
}

#[derive(Serialize)]
struct ProfileReport {
    path:          String,
    file_size:     u64,
    open_micros:   u128,
    signal_id:     u16,
    signal_name:   String,
    sample_rate:   u32,
    length:        u64,
    length_micros: u128,
    seeks:         Vec<SeekTiming>,
    reads:         Vec<ReadTiming>,
    summaries:     Vec<SummaryTiming>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e)
            if e.kind() == clap::error::ErrorKind::DisplayHelp
                || e.kind() == clap::error::ErrorKind::DisplayVersion =>
        {
            print!("{e}");
            std::process::exit(0);
        }
        Err(_) => {
            // Unknown command or malformed arguments: usage to stdout, status 1.
            println!("{}", Cli::command().render_help());
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> jls::Result<()> {
    match cli.command {
        Commands::Generate {
            filename,
            sample_rate,
            length,
            samples_per_data,
            sample_decimate_factor,
            entries_per_summary,
            summary_decimate_factor,
        } => {
            let def = SignalDef {
                signal_id: 1,
                source_id: 1,
                signal_type: SignalType::Fsr,
                sample_rate,
                samples_per_data,
                sample_decimate_factor,
                entries_per_summary,
                summary_decimate_factor,
                name: "current".into(),
                si_units: "A".into(),
                ..SignalDef::default()
            };
            generate(&filename, def, length)
        }
        Commands::Profile { filename, json } => profile(&filename, json),
    }
}

// ── Generate ─────────────────────────────────────────────────────────────────

/// Triangle wave, period 1000 samples, amplitude ±1.
fn triangle(sample_id: u64) -> f32 {
    let phase = (sample_id % 1000) as f32;
    if phase <= 500.0 {
        -1.0 + phase / 250.0
    } else {
        3.0 - phase / 250.0
    }
}

fn generate(filename: &PathBuf, def: SignalDef, length: u64) -> jls::Result<()> {
    let start = Instant::now();
    let sample_rate = def.sample_rate;

    let mut writer = Writer::open(filename)?;
    writer.source_def(&SourceDef {
        source_id: 1,
        name:    "performance".into(),
        vendor:  "jls".into(),
        model:   "generate".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        serial:  "-".into(),
    })?;
    writer.signal_def(&def)?;
    writer.utc(1, 0, Utc::now().timestamp_micros())?;

    let mut block = vec![0f32; 65_536];
    let mut sample_id = 0u64;
    while sample_id < length {
        let n = block.len().min((length - sample_id) as usize);
        for (i, slot) in block[..n].iter_mut().enumerate() {
            *slot = triangle(sample_id + i as u64);
        }
        writer.fsr_f32(1, sample_id, &block[..n])?;
        sample_id += n as u64;
    }
    writer.close()?;

    let elapsed = start.elapsed();
    let file_size = std::fs::metadata(filename)?.len();
    let throughput = length as f64 / elapsed.as_secs_f64() / 1e6;
    println!("── JLS generate ─────────────────────────────────────────");
    println!("  Path           {}", filename.display());
    println!("  Samples        {length}");
    println!("  Sample rate    {sample_rate} Hz");
    println!("  File size      {} B ({:.2} MiB)", file_size, file_size as f64 / 1048576.0);
    println!("  Elapsed        {:.3} s", elapsed.as_secs_f64());
    println!("  Throughput     {throughput:.1} Msamples/s");
    Ok(())
}

// ── Profile ──────────────────────────────────────────────────────────────────

fn profile(filename: &PathBuf, json: bool) -> jls::Result<()> {
    let file_size = std::fs::metadata(filename)?.len();

    let t_open = Instant::now();
    let mut reader = Reader::open(filename)?;
    let open_micros = t_open.elapsed().as_micros();

    let (signal_id, signal_name, sample_rate, sdf, sdf2) = {
        let signals = reader.signals();
        let sig = signals.first().ok_or(jls::Error::NotFound)?;
        (
            sig.signal_id,
            sig.name.to_owned(),
            sig.sample_rate,
            sig.sample_decimate_factor as u64,
            sig.summary_decimate_factor as u64,
        )
    };

    let t_len = Instant::now();
    let length = reader.fsr_length(signal_id)?;
    let length_micros = t_len.elapsed().as_micros();

    // Point seeks at the start, middle, and tail of the signal.
    let mut seeks = Vec::new();
    for sample_id in [0, length / 3, length / 2, length.saturating_sub(1)] {
        let t = Instant::now();
        reader.seek(signal_id, 0, sample_id)?;
        seeks.push(SeekTiming {
            sample_id,
            micros: t.elapsed().as_micros(),
        });
    }

    // Short range reads at the same positions.
    let mut reads = Vec::new();
    let mut buf = vec![0f32; 1000];
    for sample_id in [0, length / 2, length.saturating_sub(1000)] {
        let n = buf.len().min(length.saturating_sub(sample_id) as usize);
        if n == 0 {
            continue;
        }
        let t = Instant::now();
        reader.fsr_f32(signal_id, sample_id, &mut buf[..n])?;
        reads.push(ReadTiming {
            sample_id,
            samples: n,
            micros: t.elapsed().as_micros(),
        });
    }

    // One range-statistics read per populated summary level.
    let mut summaries = Vec::new();
    for level in 1..SUMMARY_LEVEL_COUNT {
        let samples_per_entry = sdf * sdf2.pow(level as u32 - 1);
        let available = (length / samples_per_entry) as usize;
        if available == 0 {
            break;
        }
        let mut entries = vec![
            SummaryEntry {
                mean: 0.0,
                min: 0.0,
                max: 0.0,
                std: 0.0,
            };
            available.min(1000)
        ];
        let t = Instant::now();
        reader.fsr_summary_f32(signal_id, 0, level, &mut entries)?;
        summaries.push(SummaryTiming {
            level,
            entries: entries.len(),
            micros: t.elapsed().as_micros(),
        });
    }

    let report = ProfileReport {
        path: filename.display().to_string(),
        file_size,
        open_micros,
        signal_id,
        signal_name,
        sample_rate,
        length,
        length_micros,
        seeks,
        reads,
        summaries,
    };

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&report)
                .map_err(|e| jls::Error::ParameterInvalid(e.to_string()))?
        );
        return Ok(());
    }

    println!("── JLS profile ──────────────────────────────────────────");
    println!("  Path           {}", report.path);
    println!("  File size      {} B ({:.2} MiB)", report.file_size, report.file_size as f64 / 1048576.0);
    println!("  Open           {} µs", report.open_micros);
    println!("  Signal         {} ({})", report.signal_id, report.signal_name);
    println!("  Sample rate    {} Hz", report.sample_rate);
    println!("  Length         {} samples ({} µs)", report.length, report.length_micros);
    println!("  Seeks:");
    for s in &report.seeks {
        println!("    @{:>12}  {:>8} µs", s.sample_id, s.micros);
    }
    println!("  Reads:");
    for r in &report.reads {
        println!("    @{:>12}  {:>6} samples  {:>8} µs", r.sample_id, r.samples, r.micros);
    }
    println!("  Summary levels:");
    for s in &report.summaries {
        println!("    level {}  {:>6} entries  {:>8} µs", s.level, s.entries, s.micros);
    }
    Ok(())
}
