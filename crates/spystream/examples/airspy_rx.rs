//! Stream samples from Airspy to a file.
//!
//! # Usage
//!
//! ```sh
//! # Stream 1 second of float I/Q at 100 MHz to a file
//! cargo run --example airspy_rx -- -f 100000000 -o samples.cf32 -d 1
//!
//! # int16 I/Q with manual gains and packing
//! cargo run --example airspy_rx -- -f 433920000 -t int16-iq --lna 10 --mixer 12 --vga 8 --packing
//!
//! # Stream to stdout (pipe to other tools)
//! cargo run --example airspy_rx -- -f 100000000 -d 1 -t raw > samples.u16
//! ```
//!
//! # Output Format
//!
//! Samples are written as they reach the callback, little-endian:
//! `f32` pairs for float32-iq, `i16` pairs for int16-iq, single values for
//! the real types and raw 12-bit ADC values for `raw`.

use clap::{ArgAction, Parser};
use spystream::{
    Airspy, AirspyConfig, DeviceSelector, Gain, SampleBlock, SampleType, Samples, StreamController,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::ops::ControlFlow;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(author, version, about = "Record samples from an Airspy board", long_about = None)]
struct Args {
    /// Center frequency in Hz
    #[arg(short, long)]
    freq: u32,

    /// Sample rate in Hz
    #[arg(short = 'r', long, default_value_t = 6_000_000)]
    sample_rate: u32,

    /// Output file (stdout if omitted)
    #[arg(short, long)]
    output: Option<String>,

    /// Recording duration in seconds
    #[arg(short, long, default_value_t = 1.0)]
    duration: f64,

    /// Output sample type: float32-iq, float32-real, int16-iq, int16-real, raw
    #[arg(short = 't', long, default_value = "float32-iq")]
    sample_type: SampleType,

    /// Device index
    #[arg(long, default_value_t = 0)]
    device_index: usize,

    /// LNA gain 0-14 (manual gain mode when any stage is given)
    #[arg(long)]
    lna: Option<u8>,

    /// Mixer gain 0-15
    #[arg(long)]
    mixer: Option<u8>,

    /// VGA gain 0-15
    #[arg(long)]
    vga: Option<u8>,

    /// Enable the antenna bias tee
    #[arg(long, default_value_t = false)]
    bias_tee: bool,

    /// Use 12-bit packed transfers
    #[arg(long, default_value_t = false)]
    packing: bool,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

fn main() {
    let args = Args::parse();

    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .try_init();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn write_block(out: &mut dyn Write, block: &SampleBlock<'_>) -> io::Result<()> {
    match block.samples() {
        Samples::Float32(s) => s.iter().try_for_each(|x| out.write_all(&x.to_le_bytes())),
        Samples::Int16(s) => s.iter().try_for_each(|x| out.write_all(&x.to_le_bytes())),
        Samples::Uint16(s) => s.iter().try_for_each(|x| out.write_all(&x.to_le_bytes())),
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let gain = if args.lna.is_some() || args.mixer.is_some() || args.vga.is_some() {
        Gain::Manual {
            lna: args.lna.unwrap_or(5),
            mixer: args.mixer.unwrap_or(5),
            vga: args.vga.unwrap_or(5),
        }
    } else {
        Gain::Auto
    };
    let config = AirspyConfig::new(args.freq, args.sample_rate)
        .with_device(DeviceSelector::Index(args.device_index))
        .with_gain(gain)
        .with_bias_tee(args.bias_tee)
        .with_packing(args.packing)
        .with_sample_type(args.sample_type);

    let device = Airspy::open(&config.device)?;
    let mut stream = StreamController::new(device.bulk_transport());
    device.configure(&config, &mut stream)?;

    let mut out: Box<dyn Write + Send> = match &args.output {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };

    let samples_written = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&samples_written);
    device.start_rx(&mut stream, move |block| {
        if let Err(e) = write_block(&mut out, block) {
            tracing::error!("write failed: {}", e);
            return ControlFlow::Break(());
        }
        counter.fetch_add(block.count() as u64, Ordering::Relaxed);
        ControlFlow::Continue(())
    })?;

    let start = Instant::now();
    let duration = Duration::from_secs_f64(args.duration);
    while start.elapsed() < duration && stream.is_streaming() {
        std::thread::sleep(Duration::from_millis(100));
    }

    device.stop_rx(&mut stream)?;
    stream.status()?;

    let stats = stream.stats();
    let elapsed = start.elapsed().as_secs_f64();
    let written = samples_written.load(Ordering::Relaxed);
    eprintln!(
        "Wrote {} {} samples in {:.2} s ({:.3} MSPS), {} buffers dropped",
        written,
        args.sample_type,
        elapsed,
        written as f64 / elapsed / 1e6,
        stats.dropped_buffers
    );
    Ok(())
}
