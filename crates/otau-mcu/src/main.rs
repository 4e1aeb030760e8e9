//! OTAU MCU emulator.
//!
//! Emulates the MCU side of a UART-modem OTAU link for exercising a
//! modem implementation, including its negative paths.
//!
//! # Usage
//!
//! Straight from flags:
//! ```bash
//! ./otau-mcu --port /dev/ttyUSB0 -p 256 --model 1001 --model 1300
//! ```
//!
//! With a config file (flags are ignored):
//! ```bash
//! ./otau-mcu --config otau-mcu.toml
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use otau_mcu::config::McuConfig;
use otau_mcu::console::ConsoleEvents;
use otau_mcu::dfu::{DfuFsm, DfuManager};
use otau_mcu::dispatcher::Dispatcher;
use otau_mcu::fault::{FaultRegistry, FaultSpec, FaultTrigger, InjectionPoint};
use otau_mcu::link::SerialLink;
use otau_mcu::memory::PageMemory;
use otau_mcu::modem::ModemFsm;
use otau_mcu::nvm::NvmStore;
use otau_wire::DfuStatus;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "otau-mcu")]
#[command(about = "Emulated MCU for driving OTAU transfers against a UART modem")]
struct Args {
    /// Configuration file path (TOML format).
    /// If provided, overrides command-line options
    #[arg(short, long)]
    config: Option<String>,

    /// Serial port the modem is attached to
    #[arg(short = 's', long)]
    port: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = 115_200)]
    baud_rate: u32,

    /// File to save app data
    #[arg(short = 'a', long, default_value = "app_data")]
    app_data_file: PathBuf,

    /// File to save firmware data
    #[arg(short = 'f', long, default_value = "firmware")]
    firmware_file: PathBuf,

    /// File to save the firmware SHA256
    #[arg(long, default_value = "sha256")]
    sha256_file: PathBuf,

    /// File to save DFU state
    #[arg(short = 'n', long, default_value = "nvm")]
    nvm_file: PathBuf,

    /// Max supported page size in bytes
    #[arg(short = 'p', long, default_value_t = 1024)]
    supported_page_size: u16,

    /// Max supported firmware size in bytes (0 = unlimited)
    #[arg(short = 'x', long, default_value_t = 0)]
    max_image_size: u32,

    /// File with expected app data (binary) used in pre-validation
    #[arg(short = 'e', long)]
    expected_app_data: Option<PathBuf>,

    /// Deliberately fail pre-validation on every init
    #[arg(short = 'b', long)]
    pre_validation_fail: bool,

    /// Deliberately fail post-validation on every completed image
    #[arg(short = 'q', long)]
    post_validation_fail: bool,

    /// Verbosity level; -vv for full log
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// File to save logs
    #[arg(short = 'l', long, default_value = "otau.log")]
    log_file: PathBuf,

    /// Ignore saved DFU state on start
    #[arg(short = 't', long)]
    forget_state: bool,

    /// Remove created files on start
    #[arg(short = 'r', long)]
    clear: bool,

    /// Model to register (hex, repeatable)
    #[arg(short = 'm', long)]
    model: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(args.verbose, &args.log_file)?;

    let config = if let Some(config_path) = &args.config {
        info!("Loading config from: {}", config_path);
        McuConfig::load(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
    } else {
        let mut config = McuConfig::default();
        config.port = args.port.clone();
        config.baud_rate = args.baud_rate;
        config.files.app_data = args.app_data_file.clone();
        config.files.firmware = args.firmware_file.clone();
        config.files.sha256 = args.sha256_file.clone();
        config.files.nvm = args.nvm_file.clone();
        config.transfer.supported_page_size = args.supported_page_size;
        config.transfer.max_image_size = args.max_image_size;
        config.expected_app_data = args.expected_app_data.clone();
        config.models = args.model.clone();
        config
    };

    config.validate().context("Invalid configuration")?;
    let port = config
        .port
        .clone()
        .context("You have to specify a serial port or a config file; see --help")?;

    if args.clear {
        info!("Clearing created files");
        for path in [
            &config.files.app_data,
            &config.files.firmware,
            &config.files.sha256,
            &config.files.nvm,
        ] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "failed to remove file");
                }
            }
        }
    }

    if args.forget_state {
        info!("Clearing NVM file");
        std::fs::File::create(&config.files.nvm)
            .with_context(|| format!("Failed to truncate {}", config.files.nvm.display()))?;
    }

    info!("Starting OTAU MCU emulator");
    info!(
        port = %port,
        supported_page_size = config.transfer.supported_page_size,
        max_image_size = config.transfer.max_image_size,
    );

    let expected_app_data = load_expected_app_data(config.expected_app_data.as_deref());

    let mut faults = FaultRegistry::new();
    for (point, spec) in config.fault_plan().expect("validated above") {
        faults.arm(point, spec);
    }
    if args.pre_validation_fail {
        faults.arm(
            InjectionPoint::PreValidation,
            FaultSpec::with_status(FaultTrigger::Always, DfuStatus::InvalidObject),
        );
    }
    if args.post_validation_fail {
        faults.arm(
            InjectionPoint::PostValidation,
            FaultSpec::with_status(FaultTrigger::Always, DfuStatus::InvalidObject),
        );
    }

    let memory = PageMemory::new(
        &config.files.app_data,
        &config.files.firmware,
        &config.files.sha256,
        config.transfer.supported_page_size,
        config.transfer.max_image_size,
    );
    let nvm = NvmStore::open(&config.files.nvm);

    let (mut link, sender) =
        SerialLink::open(&port, config.baud_rate).context("Failed to open serial link")?;

    let console = Arc::new(ConsoleEvents::new());

    let (dfu_mgr, initial_state) = DfuManager::new(
        memory,
        nvm,
        faults,
        sender.clone(),
        console.clone(),
        expected_app_data,
    );
    let dfu_fsm = DfuFsm::new(initial_state);
    let modem_fsm = ModemFsm::new(
        sender,
        console.clone(),
        config.model_ids().expect("validated above"),
    );

    let mut dispatcher = Dispatcher::new(modem_fsm, dfu_fsm, dfu_mgr);
    dispatcher.start();

    info!("Emulator ready - waiting for frames");
    info!("Press Ctrl+C to stop");

    let running = Arc::new(AtomicBool::new(true));
    let running_for_loop = running.clone();
    let loop_handle = tokio::task::spawn_blocking(move || {
        link.run(&running_for_loop, |frame| dispatcher.on_frame(frame));
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    running.store(false, Ordering::SeqCst);
    let _ = tokio::time::timeout(Duration::from_secs(2), loop_handle).await;

    console.stop_progress();
    println!("Bye!");
    Ok(())
}

/// Stdout gets a filter driven by -v; the log file always gets debug.
fn init_tracing(verbose: u8, log_file: &PathBuf) -> Result<()> {
    let stdout_filter = match verbose {
        0 => "otau_mcu=error,otau_wire=error",
        1 => "otau_mcu=info,otau_wire=info",
        _ => "otau_mcu=debug,otau_wire=debug",
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("Failed to open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_filter(EnvFilter::new(stdout_filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .with_filter(EnvFilter::new("otau_mcu=debug,otau_wire=debug")),
        )
        .init();
    Ok(())
}

fn load_expected_app_data(path: Option<&std::path::Path>) -> Option<Vec<u8>> {
    let path = path?;
    match std::fs::read(path) {
        Ok(bytes) => {
            info!(path = %path.display(), len = bytes.len(), "loaded expected app data");
            Some(bytes)
        }
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "could not open expected app data file; app data will not be checked"
            );
            None
        }
    }
}
