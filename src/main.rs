//! `trkping`: connect to a TRK agent, ping it and print its versions.
//!
//! Commands:
//! - `ping [device]` - wait for the device, reset the session and query `VERSIONS`
//! - `list` - show serial ports, marking Nokia USB cables
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};

use trkcomm::config::TrkConfig;
use trkcomm::device::{TrkDevice, TrkListener};
use trkcomm::serial::interface::NOKIA_VID;
use trkcomm::serial::SerialTransport;
use trkcomm::starter::{BluetoothStarter, CommunicationStarter, ResourceHook, StarterEvent};
use trkcomm::trk::{opcode, TrkResult, TrkVersions};

#[derive(Parser)]
#[command(name = "trkping")]
#[command(about = "Ping a TRK debug agent over serial or Bluetooth")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Verbose output (-v message traces, -vv raw bytes)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect, ping and print the agent versions
    Ping {
        /// Device (e.g. /dev/rfcomm0, /dev/ttyUSB0, COM5)
        device: Option<String>,
        /// Baud rate
        #[arg(short = 'b', long)]
        baud: Option<u32>,
        /// Use the 0x01 0x90 serial frame header (USB cable)
        #[arg(short, long)]
        serial_frame: bool,
        /// Start an rfcomm listener before connecting
        #[arg(long)]
        bluetooth: bool,
        /// Connection attempts before giving up (default: retry forever)
        #[arg(short, long)]
        attempts: Option<u32>,
        /// Milliseconds between connection attempts
        #[arg(short, long)]
        interval: Option<u64>,
        /// Seconds to wait for the agent to answer once connected
        #[arg(short, long, default_value_t = 5)]
        timeout: u64,
    },
    /// List serial ports
    List,
}

/// Prints what the agent writes outside of frames.
struct ConsoleListener;

impl TrkListener for ConsoleListener {
    fn message_received(&mut self, result: &TrkResult) {
        if result.is_debug_output {
            print!("{}", String::from_utf8_lossy(&result.data));
        }
    }

    fn error(&mut self, message: &str) {
        warn!("{}", message);
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::List => list_ports(),
        Commands::Ping {
            device,
            baud,
            serial_frame,
            bluetooth,
            attempts,
            interval,
            timeout,
        } => {
            let mut config = match &cli.config {
                Some(path) => TrkConfig::load(Path::new(path))
                    .with_context(|| format!("Failed to load {}", path))?,
                None => TrkConfig::default(),
            };
            if let Some(device) = device {
                config.device = device;
            }
            if let Some(baud) = baud {
                config.baud_rate = baud;
            }
            config.serial_frame |= serial_frame;
            config.bluetooth.enabled |= bluetooth;
            config.verbose = config.verbose.max(cli.verbose);
            if attempts.is_some() {
                config.starter.attempts = attempts;
            }
            if let Some(interval) = interval {
                config.starter.interval_ms = interval;
            }
            ping(&config, Duration::from_secs(timeout))
        }
    }
}

fn ping(config: &TrkConfig, timeout: Duration) -> Result<()> {
    let mut device = TrkDevice::new(config.device_options());
    device.add_listener(Box::new(ConsoleListener));
    let device = Arc::new(Mutex::new(device));

    // The listener process lives as long as the starter, so keep it in scope.
    if config.bluetooth.enabled {
        let mut starter =
            BluetoothStarter::bluetooth(device.clone(), config.device.clone(), config.bluetooth.listener());
        config.starter.apply(&mut starter);
        connect(&mut starter)?;
        query_versions(&device, timeout)
    } else {
        let mut starter = CommunicationStarter::new(device.clone(), config.device.clone());
        config.starter.apply(&mut starter);
        connect(&mut starter)?;
        query_versions(&device, timeout)
    }
}

fn connect<H: ResourceHook>(starter: &mut CommunicationStarter<TrkDevice, H>) -> Result<()> {
    starter.on_event(|event| match event {
        StarterEvent::Message(message) | StarterEvent::ResourceExited(message) => println!("{}", message),
        StarterEvent::Connected | StarterEvent::TimedOut => {}
    });
    println!("Connecting to {}...", starter.device());
    starter.connect()?;
    info!("Connected to {}", starter.device());
    Ok(())
}

fn query_versions(device: &Arc<Mutex<TrkDevice>>, timeout: Duration) -> Result<()> {
    let mut device = device.lock().map_err(|_| anyhow!("device lock poisoned"))?;

    let ping_reply: Arc<Mutex<Option<TrkResult>>> = Arc::default();
    let versions_reply: Arc<Mutex<Option<TrkResult>>> = Arc::default();

    let slot = ping_reply.clone();
    device.send_initial_ping(Some(Box::new(move |result: &TrkResult| {
        if let Ok(mut slot) = slot.lock() {
            *slot = Some(result.clone());
        }
    })))?;
    let slot = versions_reply.clone();
    device.send_message(
        opcode::VERSIONS,
        Vec::new(),
        Some(Box::new(move |result: &TrkResult| {
            if let Ok(mut slot) = slot.lock() {
                *slot = Some(result.clone());
            }
        })),
        None,
    )?;

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(result) = versions_reply.lock().ok().and_then(|mut r| r.take()) {
            if result.error_code() != 0 {
                bail!("VERSIONS failed: {}", result.error_string());
            }
            let versions = TrkVersions::parse(&result)
                .ok_or_else(|| anyhow!("Malformed VERSIONS reply: {}", result))?;
            println!("{}", versions);
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            let pinged = ping_reply.lock().map(|r| r.is_some()).unwrap_or(false);
            bail!(
                "{}: no reply from agent within {}s (ping {})",
                device.port(),
                timeout.as_secs(),
                if pinged { "answered" } else { "unanswered" }
            );
        }
        device.process_events_timeout((deadline - now).min(Duration::from_millis(100)));
    }

    device.close()?;
    Ok(())
}

fn list_ports() -> Result<()> {
    let ports = SerialTransport::discover_devices()?;
    if ports.is_empty() {
        println!("No serial ports found");
        return Ok(());
    }
    for port in ports {
        let marker = if port.vid == Some(NOKIA_VID) { " (Nokia)" } else { "" };
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  {:04x}:{:04x} {}{}",
                port.port_name,
                vid,
                pid,
                port.product.as_deref().unwrap_or(""),
                marker
            ),
            _ => println!("{}", port.port_name),
        }
    }
    Ok(())
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}
