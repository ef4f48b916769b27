//! Alsasink - periodic mmap playback of a test tone
//!
//! Opens a playback stream, feeds it one tone generator vector per tick and
//! prints the sink statistics on exit.

use alsasink::pcm::sim::SimulatedPcm;
use alsasink::{PcmDevice, PcmSink, SampleFormat, SinkConfig, TickOutcome, ToneGenerator};
use anyhow::{Context, Result};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Options collected from the command line
#[derive(Debug, Default)]
struct Options {
    config: Option<PathBuf>,
    device: Option<String>,
    rate: Option<u32>,
    channels: Option<u32>,
    format: Option<SampleFormat>,
    ticks: Option<u64>,
    freq: Option<f64>,
    simulate: bool,
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("alsasink=info".parse()?)
                .add_directive("alsasink_core=info".parse()?),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(options) = parse_args(&args)? else {
        return Ok(());
    };

    let mut config = match &options.config {
        Some(path) => SinkConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SinkConfig::default(),
    };
    if let Some(device) = &options.device {
        config.device = device.clone();
    }
    if let Some(rate) = options.rate {
        config.rate = rate;
    }
    if let Some(channels) = options.channels {
        config.channels = channels;
    }
    if let Some(format) = options.format {
        config.format = format;
    }
    let freq = options
        .freq
        .unwrap_or(alsasink::signal::DEFAULT_TONE_FREQ);

    println!(
        "Alsasink v{} ({}) - playing {} Hz tone on {}",
        alsasink::VERSION,
        alsasink::BUILD_DATE,
        freq,
        config.device
    );

    if options.simulate || !cfg!(all(feature = "alsa", target_os = "linux")) {
        if !options.simulate {
            warn!("Built without the alsa feature, using the simulated device");
        }
        let device = SimulatedPcm::new(config.device.clone());
        let sink = PcmSink::with_device(device, &config).context("failed to set up sink")?;
        // the simulated device plays instantly, so pace ticks to real time
        let pace = period_duration(&sink);
        return run(sink, freq, options.ticks, Some(pace));
    }

    run_hardware(&config, freq, options.ticks)
}

#[cfg(all(feature = "alsa", target_os = "linux"))]
fn run_hardware(config: &SinkConfig, freq: f64, ticks: Option<u64>) -> Result<()> {
    let sink = alsasink::AlsaSink::open(config)
        .with_context(|| format!("failed to open {}", config.device))?;
    run(sink, freq, ticks, None)
}

#[cfg(not(all(feature = "alsa", target_os = "linux")))]
fn run_hardware(_config: &SinkConfig, _freq: f64, _ticks: Option<u64>) -> Result<()> {
    anyhow::bail!("hardware playback requires building with the alsa feature")
}

fn period_duration<D: PcmDevice>(sink: &PcmSink<D>) -> Duration {
    let params = sink.params();
    Duration::from_secs_f64(params.period_size as f64 / params.rate as f64)
}

/// Feed tone vectors until Ctrl+C or the tick limit
fn run<D: PcmDevice>(
    mut sink: PcmSink<D>,
    freq: f64,
    ticks: Option<u64>,
    pace: Option<Duration>,
) -> Result<()> {
    let channels = sink.params().channels as usize;
    sink.bind_input(channels)?;
    println!("Stream: {}", sink.params());
    println!("Press Ctrl+C to stop.");

    // Set up Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .ok();

    let mut tone = ToneGenerator::new(freq, sink.params().rate);
    info!("Tone generator at {} Hz", tone.freq());
    let mut tick = 0u64;
    let mut result = Ok(());
    while running.load(Ordering::SeqCst) && ticks.map_or(true, |limit| tick < limit) {
        let input = tone.next_vector(channels);
        let tick_started = Utc::now();
        match sink.process(&input) {
            Ok(report) => {
                if report.outcome == TickOutcome::Underrun {
                    warn!("Underrun on tick {}", tick);
                }
                for event in sink.stats().events_since(tick_started) {
                    info!("Recovery on tick {}: {:?}", tick, event.kind);
                }
            }
            Err(e) => {
                error!("Playback stopped: {}", e);
                result = Err(e.into());
                break;
            }
        }
        tick += 1;
        if let Some(pace) = pace {
            std::thread::sleep(pace);
        }
    }

    sink.close();
    print_stats(&sink)?;
    info!("Done after {} ticks", tick);
    result
}

fn print_stats<D: PcmDevice>(sink: &PcmSink<D>) -> Result<()> {
    let stats = sink.stats();
    let c = stats.counters();
    println!();
    println!("Statistics");
    println!("────────────────────────────────────────");
    println!(
        "Ticks: {} | Periods: {} | Frames: {} | Deferred: {}",
        c.ticks, c.periods_written, c.frames_written, c.deferred_ticks
    );
    println!(
        "Underruns: {} | Suspends: {} | Resume retries: {} | Prepares: {} | Starts: {}",
        c.underruns, c.suspends, c.resume_retries, c.prepares, c.starts
    );
    if let Some(event) = stats.last_event() {
        println!("Last recovery event: {:?} at {}", event.kind, event.timestamp);
    }
    println!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}

/// Parse the command line; `None` means the program should exit
fn parse_args(args: &[String]) -> Result<Option<Options>> {
    let mut options = Options::default();
    let mut i = 1;

    while i < args.len() {
        let arg = args[i].as_str();
        match arg {
            "--version" | "-v" => {
                println!("alsasink {} ({})", alsasink::VERSION, alsasink::BUILD_DATE);
                return Ok(None);
            }
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--simulate" => {
                options.simulate = true;
            }
            "--config" | "-c" | "--device" | "-d" | "--rate" | "-r" | "--channels" | "-n"
            | "--format" | "-f" | "--ticks" | "-t" | "--freq" => {
                let Some(value) = args.get(i + 1) else {
                    eprintln!("Error: {} requires a value", arg);
                    return Ok(None);
                };
                match arg {
                    "--config" | "-c" => options.config = Some(PathBuf::from(value)),
                    "--device" | "-d" => options.device = Some(value.clone()),
                    "--rate" | "-r" => options.rate = Some(parse_value(arg, value)?),
                    "--channels" | "-n" => options.channels = Some(parse_value(arg, value)?),
                    "--format" | "-f" => options.format = Some(parse_value(arg, value)?),
                    "--ticks" | "-t" => options.ticks = Some(parse_value(arg, value)?),
                    _ => options.freq = Some(parse_value(arg, value)?),
                }
                i += 2;
                continue;
            }
            arg if arg.starts_with('-') => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                return Ok(None);
            }
            _ => {
                // Positional argument - treat as device name if not set
                if options.device.is_none() {
                    options.device = Some(args[i].clone());
                }
            }
        }
        i += 1;
    }

    Ok(Some(options))
}

fn parse_value<T>(flag: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid value {:?} for {}: {}", value, flag, e))
}

fn print_help() {
    println!("Usage: alsasink [OPTIONS] [DEVICE]");
    println!();
    println!("Options:");
    println!("  -c, --config PATH       Load settings from a JSON file");
    println!("  -d, --device NAME       Playback device (default: front)");
    println!("  -r, --rate RATE         Sample rate in Hz (default: 44100)");
    println!("  -n, --channels COUNT    Channel count (default: 2)");
    println!("  -f, --format FORMAT     Sample format, e.g. S16_LE, S24_3BE (default: S16_LE)");
    println!("  -t, --ticks COUNT       Stop after COUNT ticks (default: run until Ctrl+C)");
    println!("      --freq HZ           Tone frequency (default: 400)");
    println!("      --simulate          Use the simulated device instead of ALSA");
    println!("  -v, --version           Show version");
    println!("  -h, --help              Show this help");
    println!();
    println!("Examples:");
    println!("  alsasink -d hw:0,0 -f S32_LE -r 48000");
    println!("  alsasink --simulate -t 100 -f U24_3BE");
    println!();
    println!("Set RUST_LOG=alsasink_core=debug for per-tick timing.");
}
