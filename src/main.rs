use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use iitdaq::handshake::NoEvents;
use iitdaq::logging::init_rust_logging;
use iitdaq::serial::PORT_CONFIG_FILE;
use iitdaq::{
    available_ports, Acquisition, ChannelRegistry, ChannelTable, DecodedBlock, PortConfig, SerialLinks,
    SessionConfig,
};

#[derive(Parser, Debug)]
#[command(name = "iitdaq", about = "Acquire biosignals from the IIT sensor over USB serial")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports
    Ports,
    /// Run one acquisition session and print block summaries
    Acquire {
        /// Shell (command) port; defaults to the port configuration file
        #[arg(long)]
        shell: Option<String>,
        /// Data port; defaults to the port configuration file
        #[arg(long)]
        data: Option<String>,
        /// Port configuration file
        #[arg(long, default_value = PORT_CONFIG_FILE)]
        config: PathBuf,
        /// JSON channel table replacing the built-in one
        #[arg(long)]
        channels: Option<PathBuf>,
        /// Channel to acquire (repeatable), e.g. --channel ECG --channel PPG
        #[arg(long = "channel", short = 'c', required = true)]
        selected: Vec<String>,
        /// Variant override as CHANNEL=VARIANT, e.g. "ADC=2 CH"
        #[arg(long = "variant")]
        variants: Vec<String>,
        /// Bit width override as CHANNEL=BITS, e.g. ECG=24
        #[arg(long = "bits")]
        bit_widths: Vec<String>,
        /// Seconds to stream before stopping
        #[arg(long, default_value_t = 10.0)]
        seconds: f64,
    },
}

fn main() {
    init_rust_logging();
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    match Args::parse().command {
        Command::Ports => list_ports(),
        Command::Acquire {
            shell,
            data,
            config,
            channels,
            selected,
            variants,
            bit_widths,
            seconds,
        } => {
            let table = match channels {
                Some(path) => ChannelTable::from_json_file(&path)
                    .with_context(|| format!("Failed to load channel table {}", path.display()))?,
                None => ChannelTable::builtin(),
            };
            let registry = Arc::new(ChannelRegistry::new(table)?);
            configure(&registry, &selected, &variants, &bit_widths)?;

            let ports = match (shell, data) {
                (Some(shell), Some(data)) => PortConfig::new(shell, data),
                (None, None) => PortConfig::load_or_create(&config),
                _ => bail!("--shell and --data must be given together"),
            };
            acquire(registry, ports, Duration::from_secs_f64(seconds.max(0.0)))
        }
    }
}

fn list_ports() -> Result<()> {
    let ports = available_ports().context("Failed to enumerate serial ports")?;
    if ports.is_empty() {
        println!("No serial ports found.");
    }
    for port in ports {
        println!("{port}");
    }
    Ok(())
}

fn split_pair<'a>(arg: &'a str, flag: &str) -> Result<(&'a str, &'a str)> {
    arg.split_once('=')
        .map(|(k, v)| (k.trim(), v.trim()))
        .with_context(|| format!("--{flag} expects CHANNEL=VALUE, got {arg:?}"))
}

fn configure(registry: &ChannelRegistry, selected: &[String], variants: &[String], bits: &[String]) -> Result<()> {
    for arg in variants {
        let (channel, variant) = split_pair(arg, "variant")?;
        registry.update(channel, variant)?;
    }
    for arg in bits {
        let (channel, value) = split_pair(arg, "bits")?;
        // unsupported widths keep the channel's current setting
        let applied = value.parse().is_ok_and(|width| registry.set_bit_width(channel, width));
        if !applied {
            eprintln!("Warning: ignoring bit width {value:?} for {channel}");
        }
    }
    for channel in selected {
        if !registry.select(channel) {
            bail!("unknown channel {channel:?}");
        }
    }
    Ok(())
}

fn acquire(registry: Arc<ChannelRegistry>, ports: PortConfig, duration: Duration) -> Result<()> {
    println!("Shell port: {}, data port: {}", ports.shell_port, ports.data_port);
    println!("Channels: {}", registry.selected_channels().join(", "));

    let mut links = SerialLinks::new(ports);
    let sink = |block: DecodedBlock| {
        let first = block.frames.first().cloned().unwrap_or_default();
        let lost = if block.lost_samples != 0 {
            format!(" | lost ~{}", block.lost_samples)
        } else {
            String::new()
        };
        println!(
            "[{:>8.3}s] {:<5} ts={:>5} rows={:>3} first={:?}{}",
            block.elapsed_s(),
            block.channel,
            block.timestamp,
            block.frames.len(),
            first,
            lost
        );
    };

    let mut session = Acquisition::start(
        &mut links,
        registry,
        SessionConfig::default(),
        Arc::new(NoEvents),
        sink,
    )
    .context("Failed to start acquisition")?;

    println!("Streaming for {:.1}s...", duration.as_secs_f64());
    let deadline = Instant::now() + duration;
    while Instant::now() < deadline {
        if !session.connected() {
            println!("Device disconnected.");
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    println!("Stopping...");
    session.shutdown().context("Shutdown incomplete")?;
    let stats = session.assembler_stats();
    println!(
        "Done: {} packets, {} blocks, {} bytes discarded.",
        stats.packets,
        session.blocks_delivered(),
        stats.discarded_bytes
    );
    Ok(())
}
