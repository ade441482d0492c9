//! Throughput benchmark for the demultiplexer and the sample intake path.
//!
//! ```text
//! cargo run -p dabrx-core --release --bin benchmark -- \
//!   [--mode <1|2|4>] [--cifs <n>] [--backends <n>] [--seconds <s>] \
//!   [--capture <file.raw|file.wav>] [--output <report.json>]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use dabrx_core::device::file::FileLibrary;
use dabrx_core::device::simulated::{SimulatedConfig, SimulatedLibrary};
use dabrx_core::msc::backend::AudioDescriptor;
use dabrx_core::msc::stub::StubBackendFactory;
use dabrx_core::msc::{BlockOutcome, DemuxSnapshot, MscHandler};
use dabrx_core::session::acquisition::StreamSnapshot;
use dabrx_core::{DeviceSession, MscConfig, SdrLibrary, SessionConfig};
use serde::Serialize;
use tracing::info;

#[derive(Debug)]
struct Args {
    mode: u8,
    cifs: usize,
    backends: usize,
    seconds: f64,
    capture: Option<PathBuf>,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct DemuxSummary {
    mode: u8,
    backends: usize,
    cifs: usize,
    blocks_per_second: f64,
    p50_dispatch_us: f64,
    p95_dispatch_us: f64,
    counters: DemuxSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct IntakeSummary {
    source: String,
    seconds: f64,
    samples_pulled: usize,
    samples_per_second: f64,
    final_gain_tenth_db: i32,
    counters: StreamSnapshot,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    demux: DemuxSummary,
    intake: IntakeSummary,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dabrx_core=info")),
        )
        .init();

    if let Err(e) = run() {
        eprintln!("benchmark failed: {e:#}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    info!(?args, "benchmark starting");

    let demux = bench_demux(&args)?;
    println!(
        "demux: mode={} blocks/s={:.0} p50={:.1}us p95={:.1}us",
        demux.mode, demux.blocks_per_second, demux.p50_dispatch_us, demux.p95_dispatch_us
    );

    let intake = bench_intake(&args)?;
    println!(
        "intake: source={} samples/s={:.0} dropped_bytes={}",
        intake.source, intake.samples_per_second, intake.counters.bytes_dropped
    );

    let json = serde_json::to_string_pretty(&Summary { demux, intake })?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, json).with_context(|| format!("writing {}", out.display()))?;
        println!("Wrote benchmark report: {}", out.display());
    } else {
        println!("{json}");
    }
    Ok(())
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        mode: 1,
        cifs: 2_000,
        backends: 4,
        seconds: 2.0,
        capture: None,
        output: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| it.next().with_context(|| format!("missing value for {name}"));
        match arg.as_str() {
            "--mode" => args.mode = value("--mode")?.parse().context("invalid --mode")?,
            "--cifs" => args.cifs = value("--cifs")?.parse::<usize>().context("invalid --cifs")?.max(1),
            "--backends" => {
                args.backends = value("--backends")?
                    .parse::<usize>()
                    .context("invalid --backends")?
                    .clamp(1, 16)
            }
            "--seconds" => {
                args.seconds = value("--seconds")?
                    .parse::<f64>()
                    .context("invalid --seconds")?
                    .clamp(0.1, 60.0)
            }
            "--capture" => args.capture = Some(PathBuf::from(value("--capture")?)),
            "--output" => args.output = Some(PathBuf::from(value("--output")?)),
            "--help" | "-h" => {
                println!(
                    "Usage: benchmark [--mode <1|2|4>] [--cifs <n>] [--backends <n>] \
                     [--seconds <s>] [--capture <file>] [--output <file.json>]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn bench_demux(args: &Args) -> anyhow::Result<DemuxSummary> {
    let factory = Arc::new(StubBackendFactory::new());
    let handler = MscHandler::new(MscConfig { mode: args.mode }, factory);

    // Equal-sized sub-channels side by side, 54 CUs each (a typical 128 kbit/s EEP 3-A).
    for i in 0..args.backends {
        handler.register_audio_backend(&AudioDescriptor {
            subchannel_id: i as u8,
            start_addr: i * 54,
            length: 54,
            bit_rate: 128,
            protection_level: 2,
            ..AudioDescriptor::default()
        })?;
    }

    let bits: Vec<i16> = (0..handler.bits_per_block())
        .map(|i| if i % 3 == 0 { -96 } else { 87 })
        .collect();
    let blocks = handler.blocks_per_cif();
    let mut dispatch_us = Vec::with_capacity(args.cifs);

    let started = Instant::now();
    for cif in 0..args.cifs {
        for b in 0..blocks {
            let block_number = 4 + (cif * blocks + b) as i32 % (blocks as i32 * 4);
            let t = Instant::now();
            let outcome = handler.process_block(&bits, block_number)?;
            if matches!(outcome, BlockOutcome::Dispatched(_)) {
                dispatch_us.push(t.elapsed().as_secs_f64() * 1e6);
            }
        }
    }
    let elapsed = started.elapsed().as_secs_f64().max(f64::EPSILON);

    Ok(DemuxSummary {
        mode: args.mode,
        backends: args.backends,
        cifs: args.cifs,
        blocks_per_second: (args.cifs * blocks) as f64 / elapsed,
        p50_dispatch_us: percentile(&dispatch_us, 0.50),
        p95_dispatch_us: percentile(&dispatch_us, 0.95),
        counters: handler.diagnostics_snapshot(),
    })
}

fn bench_intake(args: &Args) -> anyhow::Result<IntakeSummary> {
    let (library, source): (Box<dyn SdrLibrary>, String) = match &args.capture {
        Some(path) => (
            Box::new(FileLibrary::new(path).paced(false).repeat(true)),
            path.display().to_string(),
        ),
        None => (
            Box::new(SimulatedLibrary::new(SimulatedConfig {
                block_interval: Duration::from_millis(1),
                ..SimulatedConfig::default()
            })),
            "simulated".to_string(),
        ),
    };

    let session = DeviceSession::open(&*library, SessionConfig::default())?;
    session.start_streaming()?;

    let deadline = Duration::from_secs_f64(args.seconds);
    let started = Instant::now();
    let mut pulled = 0usize;
    let mut samples = Vec::with_capacity(16_384);
    while started.elapsed() < deadline {
        samples.clear();
        let n = session.pull_samples_into(16_384, &mut samples);
        pulled += n;
        if n == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    session.stop_streaming();

    Ok(IntakeSummary {
        source,
        seconds: elapsed,
        samples_pulled: pulled,
        samples_per_second: pulled as f64 / elapsed.max(f64::EPSILON),
        final_gain_tenth_db: session.current_gain(),
        counters: session.diagnostics_snapshot(),
    })
}
