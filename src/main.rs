//! CLI Entry Point for ibr-daq
//!
//! Provides command-line interface for:
//! - Running a measurement (`run`)
//! - Printing the driver version (`version`)
//! - Validating configuration without touching hardware (`check-config`)
//!
//! # Usage
//!
//! ```bash
//! ibr-daq run --channels 1-3,6 --frequency 1 --duration-hours 0.5
//! ibr-daq run --simulate --count 2 --label 1="left arm"
//! ibr-daq check-config --config config/ibr_daq.toml
//! ```
//!
//! Ctrl-C stops the run after the current tick; the driver is always
//! deinitialized before the process exits.

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Args, Parser, Subcommand};
use tokio::signal;
use tracing::{info, warn};

use ibr_daq::acquisition::{check_setup_file, Acquisition};
use ibr_daq::config::{CliOverrides, DaqConfig};
use ibr_daq::hardware::{ChannelId, IbrDevice, MockDevice, NativeDevice};
use ibr_daq::logging::{self, LogFormat, LoggingConfig};
use ibr_daq::scheduler::CancelToken;
use ibr_daq::sink::{run_stamp, ConsoleSink, CsvSink, FanoutSink};
use ibr_daq::DaqError;

#[derive(Parser)]
#[command(name = "ibr-daq", version)]
#[command(about = "Steady-rate oversampled acquisition for IBR gauges", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a measurement
    Run(RunArgs),

    /// Print the driver version
    Version {
        /// Config file (default: config/ibr_daq.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Path to ibr_ddk.dll
        #[arg(long)]
        library: Option<PathBuf>,

        /// Use the simulated driver
        #[arg(long)]
        simulate: bool,
    },

    /// Load and validate configuration, then print the resolved schedule
    CheckConfig {
        /// Config file (default: config/ibr_daq.toml)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Config file (default: config/ibr_daq.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Channels: `all`, `4,5,6`, `1 4 6`, `1-3,6`
    #[arg(long, conflicts_with = "count")]
    channels: Option<String>,

    /// Use the first N channels
    #[arg(long)]
    count: Option<usize>,

    /// Sampling frequency in Hz (0.001 to 100)
    #[arg(long)]
    frequency: Option<f64>,

    /// Run length in hours; omit to run until Ctrl-C
    #[arg(long)]
    duration_hours: Option<f64>,

    /// Column label for a channel, as ID=NAME (repeatable)
    #[arg(long = "label", value_parser = parse_label)]
    labels: Vec<(ChannelId, String)>,

    /// Directory for CSV and log output
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Setup file passed to Device_Init
    #[arg(long)]
    setup: Option<PathBuf>,

    /// Path to ibr_ddk.dll
    #[arg(long)]
    library: Option<PathBuf>,

    /// Seconds to wait for Device_Init
    #[arg(long)]
    init_timeout: Option<f64>,

    /// Use the simulated driver
    #[arg(long)]
    simulate: bool,

    /// Do not echo rows to stdout
    #[arg(long)]
    no_console: bool,

    /// Log format on stderr
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl RunArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            channels: self.channels.clone(),
            channel_count: self.count,
            frequency_hz: self.frequency,
            duration_hours: self.duration_hours,
            labels: self.labels.clone(),
            output_dir: self.output_dir.clone(),
            setup_path: self.setup.clone(),
            library_path: self.library.clone(),
            init_timeout_secs: self.init_timeout,
            simulate: self.simulate,
            no_console: self.no_console,
            log_format: self.log_format,
        }
    }
}

fn parse_label(s: &str) -> Result<(ChannelId, String), String> {
    let (id, name) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=NAME, got '{s}'"))?;
    let id = id
        .trim()
        .parse::<ChannelId>()
        .map_err(|_| format!("'{}' is not a channel id", id.trim()))?;
    Ok((id, name.trim().to_string()))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Version {
            config,
            library,
            simulate,
        } => version(config, library, simulate),
        Commands::CheckConfig { config } => check_config(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            let code = e
                .downcast_ref::<DaqError>()
                .map_or(1, DaqError::exit_code);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let config = DaqConfig::load_with(args.config.as_deref(), args.overrides())?;

    let stamp = run_stamp(Local::now());
    let log_file = config
        .application
        .log_to_file
        .then(|| config.storage.output_dir.join(format!("measurement_{stamp}.log")));
    init_logging(&config, log_file)?;

    let device = open_device(&config)?;
    let acquisition = Acquisition::from_config(&config, device)?;
    let mut sink = open_sinks(&config, &stamp)?;

    let cancel = CancelToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current tick");
            interrupt.cancel();
        }
    });

    // The pump and scheduler must stay on one OS thread for the whole run.
    let summary = tokio::task::spawn_blocking(move || acquisition.run(&mut sink, &cancel))
        .await
        .context("acquisition task failed")??;

    println!("Total samples: {}", summary.ticks);
    Ok(())
}

fn init_logging(config: &DaqConfig, file: Option<PathBuf>) -> Result<(), DaqError> {
    let logging = LoggingConfig::from_config(config).map_err(DaqError::Configuration)?;
    logging::init(logging.with_file(file)).map_err(DaqError::Configuration)
}

fn open_sinks(config: &DaqConfig, stamp: &str) -> Result<FanoutSink, DaqError> {
    let mut sink = FanoutSink::new().with(Box::new(CsvSink::create(&config.storage.output_dir, stamp)?));
    if config.storage.console {
        sink = sink.with(Box::new(ConsoleSink::stdout()));
    }
    Ok(sink)
}

fn open_device(config: &DaqConfig) -> Result<Arc<dyn NativeDevice>, DaqError> {
    if config.device.simulate {
        let ids: Vec<ChannelId> = config.channel_selection()?.ids().to_vec();
        info!(channels = ?ids, "Using simulated driver");
        return Ok(Arc::new(MockDevice::simulated(&ids)));
    }
    check_setup_file(&config.device.setup_path)?;
    Ok(Arc::new(IbrDevice::load(&config.device.library_path)?))
}

fn version(config: Option<PathBuf>, library: Option<PathBuf>, simulate: bool) -> Result<()> {
    let overrides = CliOverrides {
        library_path: library,
        simulate,
        ..CliOverrides::default()
    };
    let config = DaqConfig::load_with(config.as_deref(), overrides)?;
    init_logging(&config, None)?;

    let device: Arc<dyn NativeDevice> = if config.device.simulate {
        Arc::new(MockDevice::new())
    } else {
        Arc::new(IbrDevice::load(&config.device.library_path)?)
    };
    let (major, minor) = device.version();
    println!("{} driver version {major}.{minor}", device.name());
    Ok(())
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let config = DaqConfig::load(path.as_deref())?;
    let schedule = config.schedule_config()?;

    println!("{}", toml::to_string_pretty(&config).context("cannot render configuration")?);
    println!("# Resolved schedule");
    println!("period_s = {:.3}", schedule.period().as_secs_f64());
    println!("oversample_count = {}", schedule.oversample_count());
    for channel in schedule.channels() {
        println!("channel {} = {:?}", channel.id, channel.label);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_label() {
        assert_eq!(parse_label("2=left arm").unwrap(), (2, "left arm".to_string()));
        assert_eq!(parse_label(" 3 = x ").unwrap(), (3, "x".to_string()));
        assert!(parse_label("left").is_err());
        assert!(parse_label("a=b").is_err());
    }

    #[test]
    fn test_cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "ibr-daq",
            "run",
            "--channels",
            "1-3",
            "--frequency",
            "2",
            "--label",
            "1=top",
            "--simulate",
            "--log-format",
            "json",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let overrides = args.overrides();
        assert_eq!(overrides.channels.as_deref(), Some("1-3"));
        assert_eq!(overrides.frequency_hz, Some(2.0));
        assert_eq!(overrides.labels, vec![(1, "top".to_string())]);
        assert!(overrides.simulate);
        assert_eq!(overrides.log_format, Some(LogFormat::Json));
    }

    #[test]
    fn test_unusable_output_dir_is_sink_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("Measurements");
        std::fs::write(&blocker, b"").unwrap();

        let mut config = DaqConfig::default();
        config.storage.output_dir = blocker;
        config.storage.console = false;
        let err = anyhow::Error::from(open_sinks(&config, "x").unwrap_err());
        let code = err.downcast_ref::<DaqError>().map_or(1, DaqError::exit_code);
        assert_eq!(code, 4);
    }

    #[test]
    fn test_bad_log_level_is_configuration_error() {
        let mut config = DaqConfig::default();
        config.application.log_level = "loud".into();
        let err = init_logging(&config, None).unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_channels_and_count_conflict() {
        assert!(Cli::try_parse_from(["ibr-daq", "run", "--channels", "1", "--count", "2"]).is_err());
    }
}
