use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Parser;
use mcdfu_core::{
    CanConnector, CanDevice, Comparison, FirmwareImage, FlashConfig, Operator, RecoveryBootstrap,
    UploadOptions, UploadOutcome, Uploader, open_bus,
};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "CAN bootloader firmware upload tool", long_about = None)]
struct Args {
    /// CAN node id of the device in DFU mode
    #[arg(long)]
    node_id: u8,

    /// Path of the .bin file to upload
    #[arg(long, required_unless_present = "recovery", conflicts_with = "recovery")]
    bin: Option<PathBuf>,

    /// Power-cycle recovery for a device that no longer answers
    #[arg(long)]
    recovery: bool,

    /// Do not reset the device after flashing
    #[arg(long)]
    no_reset: bool,

    /// Flash even if the device already holds the image
    #[arg(long)]
    force: bool,

    /// Comma-separated bus backends, first available wins [default: gs_usb]
    #[arg(long)]
    bus: Option<String>,

    /// Adapter channel (index among matching adapters)
    #[arg(long)]
    chan: Option<u32>,

    /// CAN bitrate [default: 1000000]
    #[arg(long)]
    bitrate: Option<u32>,

    /// Configuration file (TOML) with memory layout and device profile
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Prompts on the terminal and waits for Enter.
struct ConsoleOperator;

impl ConsoleOperator {
    fn prompt(&self, message: &str, wait: bool) -> io::Result<()> {
        let mut stdout = io::stdout();
        writeln!(stdout, "{}", message)?;
        stdout.flush()?;
        if wait {
            io::stdin().lock().read_line(&mut String::new())?;
        }
        Ok(())
    }
}

impl Operator for ConsoleOperator {
    fn request_power_off(&mut self) -> io::Result<()> {
        self.prompt(
            "Please power off the device and then press Enter to continue...",
            true,
        )
    }

    fn request_power_on(&mut self) -> io::Result<()> {
        self.prompt("Now power on the device.", false)
    }
}

fn load_config(args: &Args) -> Result<FlashConfig> {
    let mut config = match &args.config {
        Some(path) => FlashConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FlashConfig::default(),
    };

    if let Some(bus) = &args.bus {
        config.bus.backends = bus
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Some(chan) = args.chan {
        config.bus.channel = Some(chan);
    }
    if let Some(bitrate) = args.bitrate {
        config.bus.bitrate = bitrate;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: &Args) -> Result<()> {
    let config = load_config(args)?;
    let profile = config.require_profile()?.clone();
    for (_, endpoint) in profile.endpoints.named() {
        profile.frame_id(args.node_id, endpoint)?;
    }

    // The image is checked before any bus traffic.
    let image = args.bin.as_ref().map(FirmwareImage::load).transpose()?;

    let bus = open_bus(&config.bus)?;
    let timeout = config.response_timeout();

    if args.recovery {
        let connector = CanConnector::new(bus, profile, args.node_id, timeout);
        let device = RecoveryBootstrap::new(connector).run(&mut ConsoleOperator)?;
        info!(node_id = device.node_id(), "The device is now in DFU mode");
        return Ok(());
    }

    let Some(image) = image else {
        bail!("No firmware image specified");
    };

    let mut device = CanDevice::connect(bus, profile, args.node_id, timeout)?;
    let options = UploadOptions {
        force: args.force,
        reset: !args.no_reset,
    };
    match Uploader::new(&mut device, &config, options).run(&image)? {
        UploadOutcome::AlreadyUpToDate => {
            info!("Device firmware matches the bin file, skipping flash");
        }
        UploadOutcome::Flashed {
            nvm_restored,
            verification,
            reset,
        } => {
            if let Comparison::Mismatch { address, .. } = verification {
                error!(
                    address = %format!("0x{:08X}", address),
                    "Device firmware does not match the bin file after flashing"
                );
            }
            if !reset {
                warn!("Device left in bootloader (--no-reset)");
            }
            info!(nvm_restored, reset, "Upload finished");
        }
    }
    Ok(())
}

fn main() {
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

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!(node_id = args.node_id, "Starting mcdfu");

    if let Err(e) = run(&args) {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}
