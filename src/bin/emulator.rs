use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::signal;
use tracing::{debug, error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use probelink_lib::constants::{DEFAULT_BAUD_RATE, DEFAULT_CAPTURE_WIDTH, DESCRIPTOR_TABLE_SIZE};
use probelink_lib::{
    CaptureHandle, DescriptorSpec, DescriptorTable, Dispatcher, DispatcherConfig, Sample, SerialConfig,
    SerialTransport, SimCaptureEngine,
};

/// Plays the probe on a serial port: the real command state machine driving a
/// software capture engine.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Serial device to serve, e.g. one end of a socat pty pair.
    #[arg(short, long)]
    port: String,
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
    /// Capture width in bits; ignored when a descriptor file is given.
    #[arg(short, long, default_value_t = DEFAULT_CAPTURE_WIDTH)]
    width: u32,
    /// Descriptor JSON served on READ_SYMTAB.
    #[arg(short, long)]
    descriptor: Option<PathBuf>,
    #[arg(long, default_value_t = DESCRIPTOR_TABLE_SIZE)]
    table_size: usize,
    /// Finish a capture this long after every trigger load; never if unset.
    #[arg(long)]
    capture_delay_ms: Option<u64>,
    /// Abandon a bitstream load after this many steps without a byte.
    #[arg(long)]
    reconfigure_timeout: Option<u64>,
    /// Pause between state machine steps, in microseconds.
    #[arg(long, default_value_t = 20)]
    step_interval_us: u64,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false)
        .without_time();

    let (file_layer, guard) = if let Some(ref path) = log_file_path {
        let log_file = File::create(path).with_context(|| format!("Failed to create log file at: {:?}", path))?;
        let (non_blocking_writer, guard) = tracing_appender::non_blocking(log_file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_ansi(false)
            .with_target(false);
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    let filter = EnvFilter::builder()
        .with_default_directive(verbosity.tracing_level_filter().into())
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(path) = log_file_path {
        info!("Logging to file: {:?}", path);
    }

    Ok(guard)
}

fn load_descriptor(cli: &Cli) -> Result<DescriptorSpec> {
    match &cli.descriptor {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
            DescriptorSpec::from_json(&json).with_context(|| format!("Invalid descriptor in {:?}", path))
        }
        None => Ok(DescriptorSpec {
            timebase_ps: 10_000,
            depth: 1024,
            width: cli.width,
            channels: Vec::new(),
        }),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = setup_logging(cli.log_file.clone(), &cli.verbose)?;

    let spec = load_descriptor(&cli)?;
    let table = DescriptorTable::from_spec(&spec, cli.table_size).context("Descriptor does not fit the table")?;
    info!("Serving descriptor:\n{}", spec);

    let mut serial = SerialConfig::new(&cli.port);
    serial.baud_rate = cli.baud;
    let transport = SerialTransport::open(&serial).with_context(|| format!("Failed to open {}", cli.port))?;

    let engine = SimCaptureEngine::new();
    let capture = engine.handle();
    let config = DispatcherConfig {
        capture_width: spec.width,
        reconfigure_timeout: cli.reconfigure_timeout,
    };
    let dispatcher = Dispatcher::new(config, table, engine, transport)?;

    let stop = Arc::new(AtomicBool::new(false));
    let capture_thread = cli.capture_delay_ms.map(|ms| {
        let stop = stop.clone();
        let sample_bytes = (spec.width as usize).div_ceil(8);
        thread::spawn(move || simulate_captures(capture, Duration::from_millis(ms), sample_bytes, &stop))
    });

    let loop_stop = stop.clone();
    let interval = Duration::from_micros(cli.step_interval_us);
    let device = tokio::task::spawn_blocking(move || run_device(dispatcher, &loop_stop, interval));
    info!(port = %cli.port, baud = cli.baud, "Emulator running, Ctrl+C to stop");

    let signal_stop = stop.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down gracefully.");
            signal_stop.store(true, Ordering::Release);
        }
    });

    let result = device.await;
    stop.store(true, Ordering::Release);
    if let Some(handle) = capture_thread {
        join_capture_thread(handle);
    }

    if let Err(e) = result.context("Device loop panicked")? {
        error!("Emulator failed: {:?}", e);
        std::process::exit(1);
    }
    Ok(())
}

fn run_device(
    mut dispatcher: Dispatcher<SimCaptureEngine, SerialTransport>,
    stop: &AtomicBool,
    interval: Duration,
) -> Result<()> {
    while !stop.load(Ordering::Acquire) {
        dispatcher.step()?;
        if !interval.is_zero() {
            thread::sleep(interval);
        }
    }
    info!(
        steps = dispatcher.steps(),
        configurations = dispatcher.engine().configurations(),
        "Device loop stopped"
    );
    Ok(())
}

/// Returns false, after logging, if the capture thread panicked.
fn join_capture_thread(handle: JoinHandle<()>) -> bool {
    match handle.join() {
        Ok(()) => true,
        Err(_) => {
            warn!("Capture thread panicked");
            false
        }
    }
}

/// Capture-clock side: finish a capture `delay` after each committed configuration.
fn simulate_captures(capture: CaptureHandle, delay: Duration, sample_bytes: usize, stop: &AtomicBool) {
    let mut seen = 0;
    while !stop.load(Ordering::Acquire) {
        let current = capture.configurations();
        if current == seen {
            thread::sleep(Duration::from_millis(5));
            continue;
        }
        seen = current;
        thread::sleep(delay);
        if capture.configurations() != seen {
            debug!("Configuration replaced before the capture finished");
            continue;
        }
        let samples = (0..16u64)
            .map(|t| Sample {
                timestamp: t,
                data: Bytes::from(vec![(seen as u8).wrapping_add(t as u8); sample_bytes]),
            })
            .collect();
        capture.complete(samples);
        info!(configuration = seen, "Simulated capture finished");
    }
}
