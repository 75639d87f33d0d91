use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use quadloader::config::{DEFAULT_ACK_WINDOW, DEFAULT_ENTER_ATTEMPTS};
use quadloader::{BootConfig, FirmwareImage, FirmwareUpdater, MsgLink, ProgressSink, UpdateOutcome};

/// Update the flight-controller firmware over its serial bootloader
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Raw firmware binary to flash
    #[arg(required_unless_present = "list_ports")]
    image: Option<PathBuf>,
    /// Serial port connected to the flight-controller, defaults to the first port found
    #[arg(short, long)]
    port: Option<String>,
    /// Baud rate of the serial port
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,
    /// Flash address of the first byte of the binary
    #[arg(long, value_parser = parse_address, default_value = "0x08010000")]
    base: u32,
    /// Attempts to enter the bootloader before giving up
    #[arg(long, default_value_t = DEFAULT_ENTER_ATTEMPTS)]
    enter_attempts: usize,
    /// Write requests kept in flight
    #[arg(long, default_value_t = DEFAULT_ACK_WINDOW)]
    ack_window: usize,
    /// Response timeout in milliseconds
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
    /// Sector erase timeout in milliseconds
    #[arg(long, default_value_t = 2000)]
    erase_timeout_ms: u64,
    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_address(s: &str) -> Result<u32, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{}': {}", s, e))
}

// Progress bar that also carries the Ctrl-C cancellation flag
struct BarProgress {
    bar: ProgressBar,
    cancel: Arc<AtomicBool>,
}

impl ProgressSink for BarProgress {
    fn set_progress(&mut self, percent: u8, label: &str) {
        self.bar.set_position(percent as u64);
        self.bar.set_message(label.to_string());
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .format_timestamp_millis()
        .init();

    if args.list_ports {
        for port in serialport::available_ports()? {
            println!("{}", port.port_name);
        }
        return Ok(());
    }

    let image_path = args.image.context("No firmware image given")?;
    let bytes = std::fs::read(&image_path)
        .with_context(|| format!("Failed to read {}", image_path.display()))?;
    log::info!("Loaded {} ({} bytes) at 0x{:08x}", image_path.display(), bytes.len(), args.base);
    let image = FirmwareImage::from_binary(args.base, bytes);

    let port_name = match args.port {
        Some(port) => port,
        None => serialport::available_ports()?
            .into_iter()
            .next()
            .map(|p| p.port_name)
            .ok_or_else(|| anyhow!("No serial ports found"))?,
    };
    log::info!("Connecting to {} at {} baud", port_name, args.baud);
    let mut link = MsgLink::open_serial(&port_name, args.baud)?;

    let config = BootConfig {
        response_timeout: Duration::from_millis(args.timeout_ms),
        erase_timeout: Duration::from_millis(args.erase_timeout_ms),
        enter_attempts: args.enter_attempts,
        ack_window: args.ack_window,
        ..BootConfig::default()
    };

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.store(true, Ordering::Relaxed);
            }
        });
    }

    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")?
            .progress_chars("#>-"),
    );

    let progress = BarProgress { bar: bar.clone(), cancel };
    let mut updater = FirmwareUpdater::new(&mut link, config, progress);

    match updater.update_firmware(&image).await {
        Ok(UpdateOutcome::Completed(report)) => {
            bar.finish_with_message("Done.");
            println!("Firmware updated in {:.1} s", report.total.as_secs_f32());
        }
        Ok(UpdateOutcome::Cancelled) => {
            bar.abandon_with_message("Cancelled");
            println!("Update cancelled");
        }
        Err(e) => {
            bar.abandon_with_message("Failed");
            return Err(e.into());
        }
    }

    Ok(())
}
