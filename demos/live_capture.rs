// Live capture example
//
// Connects to the analyzer, selects a sample rate and runs a live session for
// a fixed time, printing progress and optionally exporting the retained data.

use clap::Parser;
use la8_rs::{
    ConnectionConfig, La8Connector, LiveConfig, LiveEvent, LiveWorker, SampleRate,
};
use std::fs::File;
use std::io::BufWriter;
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "live_capture")]
#[command(version = "1.0")]
#[command(about = "Live capture from an STM32-UART-LA8 logic analyzer")]
struct Args {
    /// Serial port, e.g. /dev/ttyUSB0. Scans all ports when omitted
    port: Option<String>,

    /// Sample rate command code (E, D, B, A, 1, 2, 5, 6)
    #[arg(short, long, default_value_t = '1')]
    rate: char,

    /// Milliseconds between capture starts
    #[arg(short, long, default_value_t = 500)]
    interval_ms: u64,

    /// How long to run, in seconds
    #[arg(short, long, default_value_t = 10)]
    duration_s: u64,

    /// Write the retained samples to this CSV file
    #[arg(long)]
    csv: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    if args.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let rate = SampleRate::try_from(args.rate)
        .map_err(|code| format!("Unknown sample rate code '{}'", code))?;

    let config = ConnectionConfig::default();
    let mut device = match &args.port {
        Some(port) => La8Connector::connect(port, &config)?,
        None => La8Connector::connect_any(&config)?,
    };
    let info = device.info().clone();
    println!(
        "Connected to {} v{} ({} channels, buffer {})",
        info.device_name, info.version, info.channel_count, info.buffer_size
    );

    if device.set_sample_rate(rate)? {
        println!(
            "Sample rate: {} ({:?} per capture)",
            rate,
            rate.capture_window(info.buffer_size)
        );
    } else {
        println!("Device did not confirm {}, keeping its current rate", rate);
    }

    let live_config = LiveConfig::default().with_interval(Duration::from_millis(args.interval_ms));
    let live = LiveWorker::spawn(device, live_config)?;
    let until = Instant::now() + Duration::from_secs(args.duration_s);

    while let Some(left) = until.checked_duration_since(Instant::now()) {
        match live.events().recv_timeout(left) {
            Ok(LiveEvent::Captured {
                new_samples,
                total_samples,
                ..
            }) => println!("+{} samples, {} buffered", new_samples, total_samples),
            Ok(LiveEvent::Busy) => println!("Device busy, retrying"),
            Ok(LiveEvent::Stopped(Some(e))) => {
                eprintln!("Live capture stopped: {}", e);
                break;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }

    let stats = live.stats();
    let (device, store) = live.join()?;
    device.disconnect();

    println!(
        "{} captures, {} short, {} busy retries",
        stats.captures, stats.short_reads, stats.busy_retries
    );

    if let Some(store) = store {
        println!(
            "Retained {} samples ({:.3} s @ {:.2} MHz)",
            store.sample_count(),
            store.duration_seconds(),
            store.sample_rate_mhz()
        );

        if let Some(path) = args.csv {
            store.write_csv(BufWriter::new(File::create(&path)?))?;
            println!("Wrote {}", path);
        }
    }

    Ok(())
}
