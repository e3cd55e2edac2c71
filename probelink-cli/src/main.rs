use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use serialport::SerialPortType;
use std::fs::{self, File};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use probelink_lib::constants::{DEFAULT_BAUD_RATE, DESCRIPTOR_TABLE_SIZE};
use probelink_lib::{
    BitstreamLayout, CaptureEngine, ChannelRecord, DescriptorSpec, DescriptorTable, DeviceSim, DispatcherConfig,
    HostLink, Sample, SerialConfig, SerialLink, SimConfig, TriggerBitstream,
};

/// Host tool for the logic-capture probe's serial command protocol.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Optional path to a file to write logs to, in addition to the console.
    #[arg(short, long, global = true)]
    log_file: Option<PathBuf>,
    #[command(flatten)]
    verbose: Verbosity<InfoLevel>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports the probe could be attached to.
    Ports,
    /// Fetch and decode the channel descriptor table.
    Symtab(SymtabArgs),
    /// Stream a trigger configuration to the probe.
    LoadTrigger(LoadTriggerArgs),
    /// Block until the probe reports a finished capture.
    Wait(WaitArgs),
    /// Run a full session against an in-process simulated probe.
    Demo(DemoArgs),
}

#[derive(Args, Debug)]
struct PortArgs {
    /// Serial device, e.g. /dev/ttyUSB0
    #[arg(short, long)]
    port: String,
    #[arg(short, long, default_value_t = DEFAULT_BAUD_RATE)]
    baud: u32,
}

impl PortArgs {
    fn connect(&self) -> Result<HostLink<SerialLink>> {
        let mut config = SerialConfig::new(&self.port);
        config.baud_rate = self.baud;
        let link = SerialLink::open(&config).with_context(|| format!("Failed to open serial port {}", self.port))?;
        Ok(HostLink::new(link))
    }
}

#[derive(Args, Debug)]
struct SymtabArgs {
    #[command(flatten)]
    port: PortArgs,
    /// Table size the probe was built with.
    #[arg(long, default_value_t = DESCRIPTOR_TABLE_SIZE)]
    table_size: usize,
    /// Write the raw table to this file.
    #[arg(long)]
    raw: Option<PathBuf>,
    /// Print the raw table as hex instead of decoding it.
    #[arg(long)]
    hex: bool,
}

#[derive(Args, Debug)]
struct LoadTriggerArgs {
    #[command(flatten)]
    port: PortArgs,
    /// Capture width in bits; the bitstream is twice this many bytes.
    #[arg(short, long)]
    width: u32,
    #[command(flatten)]
    source: BitstreamSource,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct BitstreamSource {
    /// Raw bitstream file.
    #[arg(long)]
    file: Option<PathBuf>,
    /// Bitstream as a hex string.
    #[arg(long)]
    hex: Option<String>,
    /// Send an all-zero configuration.
    #[arg(long)]
    zero: bool,
}

impl BitstreamSource {
    fn load(&self, layout: &BitstreamLayout) -> Result<TriggerBitstream> {
        if self.zero {
            return Ok(TriggerBitstream::zeroed(layout));
        }
        let bytes = match (&self.file, &self.hex) {
            (Some(path), _) => fs::read(path).with_context(|| format!("Failed to read bitstream from {:?}", path))?,
            (None, Some(text)) => hex::decode(text.trim()).context("Invalid hex bitstream")?,
            (None, None) => bail!("No bitstream source given"),
        };
        Ok(TriggerBitstream::from_bytes(bytes, layout)?)
    }
}

#[derive(Args, Debug)]
struct WaitArgs {
    #[command(flatten)]
    port: PortArgs,
    /// Give up after this many seconds.
    #[arg(short, long, default_value_t = 60)]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
struct DemoArgs {
    /// Descriptor JSON for the simulated probe; a built-in 64-bit layout otherwise.
    #[arg(short, long)]
    descriptor: Option<PathBuf>,
    /// Delay before the simulated capture finishes.
    #[arg(long, default_value_t = 200)]
    capture_delay_ms: u64,
}

fn setup_logging(log_file_path: Option<PathBuf>, verbosity: &Verbosity<InfoLevel>) -> Result<Option<WorkerGuard>> {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
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

    // INFO by default, DEBUG with -v, TRACE with -vv; RUST_LOG wins when set.
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

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let guard = setup_logging(cli.log_file, &cli.verbose)?;

    // The serial host API blocks; keep it off the runtime so Ctrl+C stays responsive.
    let command = cli.command;
    let work = tokio::task::spawn_blocking(move || run(command));

    let code = tokio::select! {
        res = work => match res.context("Command task failed")? {
            Ok(()) => 0,
            Err(e) => {
                error!("{:?}", e);
                1
            }
        },
        _ = signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down.");
            130
        }
    };

    // A blocked serial read would keep the runtime from shutting down.
    drop(guard);
    std::process::exit(code);
}

fn run(command: Command) -> Result<()> {
    match command {
        Command::Ports => list_ports(),
        Command::Symtab(args) => read_symtab(args),
        Command::LoadTrigger(args) => load_trigger(args),
        Command::Wait(args) => wait(args),
        Command::Demo(args) => demo(args),
    }
}

fn list_ports() -> Result<()> {
    let ports = SerialLink::list_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        match port.port_type {
            SerialPortType::UsbPort(usb) => {
                println!(
                    "{}  USB {:04x}:{:04x}  {} {}",
                    port.port_name,
                    usb.vid,
                    usb.pid,
                    usb.manufacturer.as_deref().unwrap_or("<unknown>"),
                    usb.product.as_deref().unwrap_or(""),
                );
            }
            other => println!("{}  {:?}", port.port_name, other),
        }
    }
    Ok(())
}

fn read_symtab(args: SymtabArgs) -> Result<()> {
    let mut host = args.port.connect()?.with_table_size(args.table_size);
    let table = host.read_symtab().context("Failed to read the descriptor table")?;

    if let Some(path) = &args.raw {
        fs::write(path, &table).with_context(|| format!("Failed to write {:?}", path))?;
        info!("Raw table written to {:?}", path);
    }
    if args.hex {
        println!("{}", hex::encode(&table));
        return Ok(());
    }

    let spec = DescriptorSpec::from_table(&table).context("Descriptor table did not decode")?;
    print!("{}", spec);
    Ok(())
}

fn load_trigger(args: LoadTriggerArgs) -> Result<()> {
    let layout = BitstreamLayout::for_width(args.width)?;
    let bitstream = args.source.load(&layout)?;
    let mut host = args.port.connect()?;
    host.load_trigger(&bitstream)?;
    println!("Loaded {} bytes ({} words).", bitstream.len(), layout.word_count());
    Ok(())
}

fn wait(args: WaitArgs) -> Result<()> {
    let mut host = args.port.connect()?;
    let timeout = Duration::from_secs(args.timeout_secs);
    info!("Waiting up to {:?} for a capture...", timeout);
    if !host.wait_for_trigger(timeout)? {
        bail!("No capture within {:?}", timeout);
    }
    println!("Capture finished.");
    Ok(())
}

fn demo_descriptor() -> DescriptorSpec {
    DescriptorSpec {
        timebase_ps: 10_000,
        depth: 1024,
        width: 64,
        channels: vec![
            ChannelRecord::new("addr", 32),
            ChannelRecord::new("data", 16),
            ChannelRecord::new("byte_en", 2),
            ChannelRecord::new("ctrl", 14),
        ],
    }
}

fn demo(args: DemoArgs) -> Result<()> {
    let spec = match &args.descriptor {
        Some(path) => {
            let json = fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
            DescriptorSpec::from_json(&json).with_context(|| format!("Invalid descriptor in {:?}", path))?
        }
        None => demo_descriptor(),
    };
    let table = DescriptorTable::from_spec(&spec, DESCRIPTOR_TABLE_SIZE)?;
    let config = SimConfig {
        dispatcher: DispatcherConfig {
            capture_width: spec.width,
            reconfigure_timeout: None,
        },
        ..Default::default()
    };
    let (sim, link) = DeviceSim::spawn(config, table)?;
    let capture = sim.capture();
    let mut host = HostLink::new(link);

    let received = host.read_symtab()?;
    let decoded = DescriptorSpec::from_table(&received)?;
    println!("Descriptor from simulated probe:");
    print!("{}", decoded);

    let layout = BitstreamLayout::for_width(decoded.width)?;
    host.load_trigger(&TriggerBitstream::zeroed(&layout))?;

    let deadline = Instant::now() + Duration::from_secs(2);
    while capture.configurations() == 0 {
        if Instant::now() > deadline {
            bail!("Simulated probe never committed the configuration");
        }
        thread::sleep(Duration::from_millis(1));
    }
    println!("Trigger armed ({} words).", layout.word_count());

    let delay = Duration::from_millis(args.capture_delay_ms);
    let sample_bytes = (decoded.width as usize).div_ceil(8);
    let finisher = thread::spawn(move || {
        thread::sleep(delay);
        let samples = (0..4u64)
            .map(|t| Sample {
                timestamp: t * 100,
                data: vec![t as u8; sample_bytes].into(),
            })
            .collect();
        capture.complete(samples);
    });

    let triggered = host.wait_for_trigger(delay + Duration::from_secs(5))?;
    if finisher.join().is_err() {
        warn!("Capture thread panicked");
    }
    let dispatcher = sim.shutdown()?;
    if !triggered {
        bail!("Simulated probe did not report the capture");
    }

    println!("Capture finished after {} device steps.", dispatcher.steps());
    let engine = dispatcher.engine();
    let mut address = 0;
    while let Some(sample) = engine.read_sample(address) {
        println!("  #{:<3} t={:<6} {}", address, sample.timestamp, hex::encode(&sample.data));
        address += 1;
    }
    Ok(())
}
