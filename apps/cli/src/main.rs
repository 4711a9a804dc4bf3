use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use fwup_core::device::mock::MockDevice;
use fwup_core::{
    BackendRegistry, Context, Device, DeviceKind, EmulationDocument, EngineConfig, ErrorKind,
    RegistryEvent, ReplugMonitor, SetupFlags, TracingObserver, TransferParams, UpdateEvent,
    UpdateObserver, UpdateSession, UsbBackend, VerifyStrategy,
};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Firmware update core harness", long_about = None)]
struct Args {
    /// Engine configuration (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enumerate USB devices on this host
    List {
        /// Only show these vendor ids (hex, e.g. 273f)
        #[arg(long = "vendor", value_parser = parse_u16_hex)]
        vendors: Vec<u16>,
    },
    /// Record the host's USB devices into an emulation file
    Record {
        /// Output file
        out: PathBuf,
    },
    /// Replay an emulation file and show the resulting devices
    Replay {
        /// Emulation file (JSON)
        log: PathBuf,
    },
    /// Replay two emulation files in order and show what changed
    Diff { first: PathBuf, second: PathBuf },
    /// Run an update session against a simulated device
    Simulate(SimulateArgs),
}

#[derive(clap::Args, Debug)]
struct SimulateArgs {
    /// Payload size in bytes
    #[arg(long, default_value_t = 4096)]
    size: usize,

    /// Firmware file to use instead of a generated payload
    #[arg(long)]
    firmware: Option<PathBuf>,

    #[arg(long, default_value_t = 64)]
    chunk_size: usize,

    /// Start address (hex)
    #[arg(long, value_parser = parse_u64_hex, default_value = "8000000")]
    start: u64,

    #[arg(long)]
    page_size: Option<u64>,

    #[arg(long, value_enum, default_value_t = Verify::Readback)]
    verify: Verify,

    /// Make this chunk report busy twice before succeeding
    #[arg(long)]
    busy_chunk: Option<usize>,

    /// Flip the low bit of the byte at this payload offset on readback
    #[arg(long)]
    corrupt: Option<usize>,

    /// Device re-enumerates after attach
    #[arg(long)]
    replug: bool,

    /// Device never comes back after attach
    #[arg(long, requires = "replug")]
    lost: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Verify {
    Readback,
    Checksum,
    None,
}

impl From<Verify> for VerifyStrategy {
    fn from(v: Verify) -> Self {
        match v {
            Verify::Readback => VerifyStrategy::ReadBack,
            Verify::Checksum => VerifyStrategy::DeviceChecksum,
            Verify::None => VerifyStrategy::None,
        }
    }
}

fn parse_u16_hex(s: &str) -> std::result::Result<u16, String> {
    u16::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

fn parse_u64_hex(s: &str) -> std::result::Result<u64, String> {
    u64::from_str_radix(s.trim_start_matches("0x"), 16).map_err(|e| e.to_string())
}

/// Logs through tracing and keeps a one-line progress readout on stderr.
struct ConsoleObserver;

impl UpdateObserver for ConsoleObserver {
    fn on_event(&self, event: &UpdateEvent) {
        match event {
            UpdateEvent::Progress { phase, percentage } => {
                eprint!("\r{phase:<12} {percentage:>3}%");
                if *percentage == 100 {
                    eprintln!();
                }
            }
            other => TracingObserver.on_event(other),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => EngineConfig::load_from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let ctx = Arc::new(Context::new(config));

    match args.command {
        Command::List { vendors } => list(ctx, &vendors),
        Command::Record { out } => record(ctx, &out),
        Command::Replay { log } => replay(ctx, &log),
        Command::Diff { first, second } => diff(ctx, &first, &second),
        Command::Simulate(sim) => simulate(&ctx, &sim),
    }
}

fn print_devices(devices: &[&Device]) {
    if devices.is_empty() {
        println!("no devices");
        return;
    }
    for device in devices {
        println!(
            "{:<16} {:<10} {:<8} [{}]",
            device.backend_id(),
            device.physical_id().unwrap_or("-"),
            device.version().unwrap_or("-"),
            device.flags().to_names().join(",")
        );
    }
}

fn coldplug_usb(ctx: Arc<Context>, vendors: &[u16]) -> Result<BackendRegistry<UsbBackend>> {
    let mut registry = BackendRegistry::new(UsbBackend::new().with_vendor_filter(vendors), ctx);
    registry
        .coldplug(&mut |pct: u8| debug!(progress = pct, "Coldplug"))
        .context("USB coldplug failed")?;
    Ok(registry)
}

fn list(ctx: Arc<Context>, vendors: &[u16]) -> Result<()> {
    let registry = coldplug_usb(ctx, vendors)?;
    print_devices(&registry.get_devices());
    Ok(())
}

fn record(ctx: Arc<Context>, out: &Path) -> Result<()> {
    let registry = coldplug_usb(ctx, &[])?;
    let mut doc = EmulationDocument::new();
    registry.save_to_log(&mut doc)?;
    doc.save_to_file(out)
        .with_context(|| format!("writing {}", out.display()))?;
    info!(devices = registry.len(), path = %out.display(), "Emulation recorded");
    Ok(())
}

fn emulated_usb(ctx: Arc<Context>) -> Result<BackendRegistry<UsbBackend>> {
    let mut registry = BackendRegistry::new(UsbBackend::new(), ctx);
    registry.set_up(SetupFlags::EMULATION_ONLY)?;
    Ok(registry)
}

fn load_log(path: &Path) -> Result<EmulationDocument> {
    EmulationDocument::load_from_file(path).with_context(|| format!("reading {}", path.display()))
}

fn replay(ctx: Arc<Context>, log: &Path) -> Result<()> {
    let mut registry = emulated_usb(ctx)?;
    registry.load_from_log(&load_log(log)?)?;
    print_devices(&registry.get_devices());
    Ok(())
}

fn diff(ctx: Arc<Context>, first: &Path, second: &Path) -> Result<()> {
    let mut registry = emulated_usb(ctx)?;
    registry.load_from_log(&load_log(first)?)?;

    registry.subscribe(|event| match event {
        RegistryEvent::Added(d) => println!("+ {d}"),
        RegistryEvent::Removed(d) => println!("- {d}"),
        RegistryEvent::Changed(d) => println!("~ {} ({} events)", d, d.events().len()),
    });
    registry.load_from_log(&load_log(second)?)?;
    Ok(())
}

fn simulate(ctx: &Context, sim: &SimulateArgs) -> Result<()> {
    let payload = match &sim.firmware {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?
        }
        None => (0..sim.size).map(|i| (i * 31 + 7) as u8).collect(),
    };
    if let Some(offset) = sim.corrupt.filter(|&o| o >= payload.len()) {
        bail!("corrupt offset {offset} is past the {} byte payload", payload.len());
    }

    let mut device = Device::new("sim:0001", DeviceKind::Usb)
        .with_physical_id("1209:0001")
        .with_version("1.0.0");
    let mut dev = MockDevice::new()
        .with_params(TransferParams {
            start_address: Some(sim.start),
            max_chunk_size: sim.chunk_size,
            page_size: sim.page_size,
            zlp_packet_size: None,
        })
        .with_verify(sim.verify.into())
        .with_reload_version("1.0.1");
    if let Some(index) = sim.busy_chunk {
        dev.fail_chunk(index, 2, ErrorKind::Busy);
    }
    if let Some(offset) = sim.corrupt {
        dev.corrupt(sim.start + offset as u64, 0x01);
    }

    let monitor = ReplugMonitor::new();
    if sim.replug {
        let feeder = monitor.clone();
        let lost = sim.lost;
        dev = dev.with_replug_after_attach(Duration::from_millis(500), move || {
            if !lost {
                feeder.device_added(
                    Device::new("sim:0002", DeviceKind::Usb).with_physical_id("1209:0001"),
                );
            }
        });
    }

    let mut session = UpdateSession::new(ctx, &mut device, &mut dev, &payload)
        .with_observer(Arc::new(ConsoleObserver));
    if sim.replug {
        session = session.with_replug(&monitor);
    }

    let result = session.run();
    let states = match &result {
        Ok(report) => &report.states,
        Err(e) => &e.report.states,
    };
    println!(
        "{}",
        states
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(" -> ")
    );

    match result {
        Ok(report) => {
            info!(
                device = %report.backend_id,
                version = report.version.as_deref().unwrap_or("-"),
                retries = report.retries.total(),
                verification = ?report.verification,
                "Simulated update succeeded"
            );
            Ok(())
        }
        Err(e) => {
            if e.report.needs_manual_replug() {
                warn!("Device needs to be unplugged and replugged by hand");
            }
            error!(state = %e.report.final_state, "Simulated update failed");
            Err(e.into())
        }
    }
}
