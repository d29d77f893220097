//! Configuration System using Figment
//!
//! Configuration is layered, later layers overriding earlier ones:
//! 1. built-in defaults
//! 2. `config/ibr_daq.toml` (or the file given with `--config`)
//! 3. environment variables prefixed with `IBR_DAQ_`, nesting on `__`
//! 4. command-line flags
//!
//! # Example
//! ```no_run
//! use ibr_daq::config::DaqConfig;
//!
//! let config = DaqConfig::load(None)?;
//! println!("Sampling at {} Hz", config.acquisition.frequency_hz);
//! # Ok::<(), ibr_daq::error::DaqError>(())
//! ```
//!
//! Environment example: `IBR_DAQ_ACQUISITION__FREQUENCY_HZ=2.5`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeConfig;
use crate::channels::{ChannelSelection, DEFAULT_VALID_CHANNELS};
use crate::error::DaqError;
use crate::hardware::ChannelId;
use crate::logging::LogFormat;
use crate::scheduler::{
    PrecisionStep, PrecisionTable, ScheduleConfig, DEFAULT_MAX_OVERSAMPLE,
    DEFAULT_MIN_READ_INTERVAL, MAX_FREQUENCY_HZ, MIN_FREQUENCY_HZ,
};

/// Config file read when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/ibr_daq.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "IBR_DAQ_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DaqConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Driver and setup file
    pub device: DeviceConfig,
    /// Sampling schedule and channels
    pub acquisition: AcquisitionConfig,
    /// Adaptive precision table
    pub precision: PrecisionConfig,
    /// Output settings
    pub storage: StorageConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format
    pub log_format: LogFormat,
    /// Also write `measurement_<stamp>.log` next to the CSV
    pub log_to_file: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "IBR DAQ".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            log_to_file: true,
        }
    }
}

/// Driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Path to `ibr_ddk.dll`
    pub library_path: PathBuf,
    /// Setup file passed to `Device_Init`
    pub setup_path: PathBuf,
    /// Module (device number) holding the gauges
    pub module_id: i16,
    /// Upper bound on `Device_Init`
    #[serde(with = "humantime_serde")]
    pub init_timeout: Duration,
    /// Pump drain interval while waiting for `Device_Init`
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Run `Device_Init` from the driver's directory
    pub change_working_dir: bool,
    /// Use the simulated driver instead of the DLL
    pub simulate: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            library_path: PathBuf::from(r"C:\IBR_DDK\DLL\x64\ibr_ddk.dll"),
            setup_path: PathBuf::from(r"C:\IMB_Test\IMB_Test.ddk"),
            module_id: 1,
            init_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            change_working_dir: true,
            simulate: false,
        }
    }
}

/// Sampling configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Rows per second
    pub frequency_hz: f64,
    /// Run length in hours; unset runs until interrupted
    pub duration_hours: Option<f64>,
    /// Channel selection (`all`, `1-3,6`, ...)
    pub channels: String,
    /// Select the first N valid channels instead of `channels`
    pub channel_count: Option<usize>,
    /// Column labels by channel id
    pub labels: BTreeMap<String, String>,
    /// Shortest time one read takes
    #[serde(with = "humantime_serde")]
    pub min_read_interval: Duration,
    /// Oversampling cap
    pub max_oversample_count: usize,
    /// Channels wired on this fixture
    pub valid_channels: Vec<ChannelId>,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            frequency_hz: 1.0,
            duration_hours: None,
            channels: "all".to_string(),
            channel_count: None,
            labels: BTreeMap::new(),
            min_read_interval: DEFAULT_MIN_READ_INTERVAL,
            max_oversample_count: DEFAULT_MAX_OVERSAMPLE,
            valid_channels: DEFAULT_VALID_CHANNELS.to_vec(),
        }
    }
}

/// Precision table configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecisionConfig {
    /// Thresholds in increasing order
    pub steps: Vec<PrecisionStep>,
    /// Digits when no threshold matches
    pub fallback_decimals: usize,
}

impl Default for PrecisionConfig {
    fn default() -> Self {
        let table = PrecisionTable::default();
        Self {
            steps: table.steps().to_vec(),
            fallback_decimals: table.fallback_decimals(),
        }
    }
}

/// Output configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory for CSV and log files
    pub output_dir: PathBuf,
    /// Echo rows to stdout
    pub console: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("Measurements"),
            console: true,
        }
    }
}

/// Command-line overrides, applied as the last layer.
#[derive(Debug, Clone, Default)]
#[allow(missing_docs)]
pub struct CliOverrides {
    pub channels: Option<String>,
    pub channel_count: Option<usize>,
    pub frequency_hz: Option<f64>,
    pub duration_hours: Option<f64>,
    pub labels: Vec<(ChannelId, String)>,
    pub output_dir: Option<PathBuf>,
    pub setup_path: Option<PathBuf>,
    pub library_path: Option<PathBuf>,
    pub init_timeout_secs: Option<f64>,
    pub simulate: bool,
    pub no_console: bool,
    pub log_format: Option<LogFormat>,
}

impl CliOverrides {
    /// Merge the flags that were given onto `figment`.
    pub fn apply(self, mut figment: Figment) -> Figment {
        fn set<T: Serialize>(f: Figment, key: &str, value: T) -> Figment {
            f.merge(Serialized::default(key, value))
        }

        if let Some(channels) = self.channels {
            figment = set(figment, "acquisition.channels", channels);
        }
        if let Some(count) = self.channel_count {
            figment = set(figment, "acquisition.channel_count", count);
        }
        if let Some(hz) = self.frequency_hz {
            figment = set(figment, "acquisition.frequency_hz", hz);
        }
        if let Some(hours) = self.duration_hours {
            figment = set(figment, "acquisition.duration_hours", hours);
        }
        for (id, label) in self.labels {
            figment = set(figment, &format!("acquisition.labels.{id}"), label);
        }
        if let Some(dir) = self.output_dir {
            figment = set(figment, "storage.output_dir", dir);
        }
        if let Some(path) = self.setup_path {
            figment = set(figment, "device.setup_path", path);
        }
        if let Some(path) = self.library_path {
            figment = set(figment, "device.library_path", path);
        }
        if let Some(secs) = self.init_timeout_secs {
            figment = set(figment, "device.init_timeout", format!("{}ms", (secs * 1000.0).round() as u64));
        }
        if self.simulate {
            figment = set(figment, "device.simulate", true);
        }
        if self.no_console {
            figment = set(figment, "storage.console", false);
        }
        if let Some(format) = self.log_format {
            figment = set(figment, "application.log_format", format);
        }
        figment
    }
}

impl DaqConfig {
    /// Defaults, file and environment layers. A missing default file is skipped.
    pub fn figment(path: Option<&Path>) -> Figment {
        Figment::from(Serialized::defaults(DaqConfig::default()))
            .merge(Toml::file(config_file(path)))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// True when the highest layer that selects channels names `channels`
    /// and not `channel_count`.
    ///
    /// Merged values cannot tell which layer set them, so a `channel_count`
    /// from the file would otherwise beat `channels` from the command line.
    fn channels_outrank_count(path: Option<&Path>, overrides: &CliOverrides) -> bool {
        let layers = [
            overrides.clone().apply(Figment::new()),
            Figment::from(Env::prefixed(ENV_PREFIX).split("__")),
            Figment::from(Toml::file(config_file(path))),
        ];
        for layer in &layers {
            if layer.find_value("acquisition.channel_count").is_ok() {
                return false;
            }
            if layer.find_value("acquisition.channels").is_ok() {
                return true;
            }
        }
        false
    }

    /// Load and validate configuration.
    ///
    /// # Errors
    ///
    /// Fails if an explicitly given file does not exist, a layer cannot be
    /// parsed, or validation fails.
    pub fn load(path: Option<&Path>) -> Result<Self, DaqError> {
        Self::load_with(path, CliOverrides::default())
    }

    /// Load with command-line overrides on top.
    pub fn load_with(path: Option<&Path>, overrides: CliOverrides) -> Result<Self, DaqError> {
        if let Some(p) = path {
            if !p.is_file() {
                return Err(DaqError::Configuration(format!(
                    "config file '{}' not found",
                    p.display()
                )));
            }
        }
        let channels_win = Self::channels_outrank_count(path, &overrides);
        let mut config: Self = overrides.apply(Self::figment(path)).extract()?;
        if channels_win {
            config.acquisition.channel_count = None;
        }
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), DaqError> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return invalid(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let hz = self.acquisition.frequency_hz;
        if !hz.is_finite() || !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&hz) {
            return invalid(format!(
                "frequency_hz must be between {MIN_FREQUENCY_HZ} and {MAX_FREQUENCY_HZ}, got {hz}"
            ));
        }
        if let Some(hours) = self.acquisition.duration_hours {
            if !hours.is_finite() || hours <= 0.0 {
                return invalid(format!("duration_hours must be positive, got {hours}"));
            }
        }
        self.duration()?;
        if self.acquisition.valid_channels.is_empty() {
            return invalid("valid_channels cannot be empty".to_string());
        }

        if self.device.setup_path.as_os_str().is_empty() {
            return invalid("device.setup_path cannot be empty".to_string());
        }
        if !self.device.simulate && self.device.library_path.as_os_str().is_empty() {
            return invalid("device.library_path cannot be empty".to_string());
        }
        if self.device.init_timeout.is_zero() {
            return invalid("device.init_timeout must be positive".to_string());
        }
        if self.device.poll_interval.is_zero() {
            return invalid("device.poll_interval must be positive".to_string());
        }
        if self.storage.output_dir.as_os_str().is_empty() {
            return invalid("storage.output_dir cannot be empty".to_string());
        }

        self.schedule_config()?;
        Ok(())
    }

    /// Run length, `None` when unbounded.
    ///
    /// # Errors
    ///
    /// [`DaqError::Configuration`] if `duration_hours` is negative, not finite,
    /// or too large to represent.
    pub fn duration(&self) -> Result<Option<Duration>, DaqError> {
        self.acquisition
            .duration_hours
            .map(|hours| {
                Duration::try_from_secs_f64(hours * 3600.0).map_err(|e| {
                    DaqError::Configuration(format!("duration_hours {hours} is out of range: {e}"))
                })
            })
            .transpose()
    }

    /// Configured labels keyed by channel id.
    pub fn labels(&self) -> Result<BTreeMap<ChannelId, String>, DaqError> {
        self.acquisition
            .labels
            .iter()
            .map(|(key, label)| {
                key.trim()
                    .parse::<ChannelId>()
                    .map(|id| (id, label.clone()))
                    .map_err(|_| DaqError::Configuration(format!("label key '{key}' is not a channel id")))
            })
            .collect()
    }

    /// Precision table from the `[precision]` section.
    pub fn precision_table(&self) -> Result<PrecisionTable, DaqError> {
        PrecisionTable::new(self.precision.steps.clone(), self.precision.fallback_decimals)
            .map_err(DaqError::Configuration)
    }

    /// Selected channels, by count if `channel_count` is set.
    pub fn channel_selection(&self) -> Result<ChannelSelection, DaqError> {
        let valid = &self.acquisition.valid_channels;
        let selection = match self.acquisition.channel_count {
            Some(count) => ChannelSelection::first(count, valid)?,
            None => ChannelSelection::parse(&self.acquisition.channels, valid)?,
        };
        Ok(selection)
    }

    /// Build the sampling schedule.
    pub fn schedule_config(&self) -> Result<ScheduleConfig, DaqError> {
        let channels = self.channel_selection()?.into_channels(&self.labels()?);
        ScheduleConfig::builder()
            .frequency_hz(self.acquisition.frequency_hz)
            .duration(self.duration()?)
            .channels(channels)
            .module_id(self.device.module_id)
            .min_read_interval(self.acquisition.min_read_interval)
            .max_oversample_count(self.acquisition.max_oversample_count)
            .precision(self.precision_table()?)
            .build()
    }

    /// Build the initialization bridge settings.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            timeout: self.device.init_timeout,
            poll_interval: self.device.poll_interval,
            change_working_dir: self.device.change_working_dir,
            ..BridgeConfig::default()
        }
    }
}

/// Explicit config path, or the default location.
fn config_file(path: Option<&Path>) -> PathBuf {
    path.map_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH), Path::to_path_buf)
}
