//! One measurement run: initialize the driver, sample, release the driver.
//!
//! The driver is released on every exit path. A scheduling or sink fault
//! still deinitializes before the error is returned, and the session's `Drop`
//! covers panics.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tracing::{info, warn};

use crate::bridge::{BridgeConfig, InitBridge, InitOutcome};
use crate::config::DaqConfig;
use crate::error::DaqError;
use crate::hardware::NativeDevice;
use crate::scheduler::{CancelToken, RunSummary, SamplingScheduler, ScheduleConfig, SchedulerState};
use crate::session::DeviceSession;
use crate::sink::Sink;

/// Check the setup file exists before touching the driver.
pub fn check_setup_file(path: &Path) -> Result<(), DaqError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "Missing setup file: {}",
            path.display()
        )))
    }
}

/// A configured run, ready to start.
pub struct Acquisition {
    schedule: ScheduleConfig,
    bridge: BridgeConfig,
    setup_path: PathBuf,
    device: Arc<dyn NativeDevice>,
}

impl Acquisition {
    /// Assemble a run from its parts.
    pub fn new(
        schedule: ScheduleConfig,
        bridge: BridgeConfig,
        setup_path: PathBuf,
        device: Arc<dyn NativeDevice>,
    ) -> Self {
        Self {
            schedule,
            bridge,
            setup_path,
            device,
        }
    }

    /// Assemble a run from loaded configuration.
    pub fn from_config(config: &DaqConfig, device: Arc<dyn NativeDevice>) -> Result<Self, DaqError> {
        Ok(Self::new(
            config.schedule_config()?,
            config.bridge_config(),
            config.device.setup_path.clone(),
            device,
        ))
    }

    /// The schedule this run will use.
    pub fn schedule(&self) -> &ScheduleConfig {
        &self.schedule
    }

    /// Initialize, sample until done or cancelled, deinitialize.
    ///
    /// # Errors
    ///
    /// [`DaqError::Init`] if initialization does not succeed (the scheduler
    /// never starts), or the scheduler's error. Cancelling while the driver
    /// initializes is a clean, empty run.
    pub fn run(self, sink: &mut dyn Sink, cancel: &CancelToken) -> Result<RunSummary, DaqError> {
        self.log_configuration();
        let started = Instant::now();

        let mut session = DeviceSession::new(self.device, InitBridge::new(self.bridge));
        info!(phase = "init", setup = %self.setup_path.display(), "Initializing device");
        match session.initialize_cancellable(&self.setup_path, cancel) {
            InitOutcome::Success => {}
            InitOutcome::Cancelled => {
                warn!(phase = "init", "Measurement interrupted by user during initialization");
                return Ok(RunSummary {
                    ticks: 0,
                    overruns: 0,
                    failed_reads: 0,
                    out_of_range_reads: 0,
                    final_state: SchedulerState::Cancelled,
                    elapsed: started.elapsed(),
                });
            }
            outcome => return Err(DaqError::Init(outcome)),
        }

        let mut scheduler = SamplingScheduler::new(self.schedule);
        let result = scheduler.run(&session, sink, cancel);

        info!(phase = "deinit", "Deinitializing device");
        if let Err(e) = session.deinit() {
            warn!(phase = "deinit", error = %e, "Deinit skipped");
        }

        match &result {
            Ok(summary) => {
                if cancel.is_cancelled() {
                    warn!("Measurement interrupted by user");
                }
                info!(samples = summary.ticks, "Total samples collected: {}", summary.ticks);
            }
            Err(e) => warn!(error = %e, "Measurement ended with an error"),
        }
        result
    }

    fn log_configuration(&self) {
        let ids: Vec<_> = self.schedule.channels().iter().map(|c| c.id).collect();
        let labels: Vec<_> = self
            .schedule
            .channels()
            .iter()
            .map(|c| c.label.as_str())
            .collect();
        let duration = self
            .schedule
            .duration()
            .map_or_else(|| "infinite".to_string(), |d| format!("{:.3} h", d.as_secs_f64() / 3600.0));

        info!("----- Measurement Configuration -----");
        info!(channels = ?ids, "Gauge addresses");
        info!(labels = ?labels, "Gauge descriptions");
        info!(frequency_hz = self.schedule.frequency_hz(), "Frequency");
        info!(duration = %duration, "Duration");
        info!(oversample = self.schedule.oversample_count(), "Oversampling");
        info!("-------------------------------------");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channel;
    use crate::hardware::{InitBehavior, MockDevice, StatusCode};
    use crate::sink::{CsvSink, MemorySink};
    use std::time::Duration;

    fn schedule(ticks: u64) -> ScheduleConfig {
        ScheduleConfig::builder()
            .frequency_hz(50.0)
            .min_read_interval(Duration::from_millis(5))
            .channels(vec![Channel::new(1)])
            .max_ticks(Some(ticks))
            .build()
            .unwrap()
    }

    fn bridge() -> BridgeConfig {
        BridgeConfig {
            timeout: Duration::from_secs(2),
            change_working_dir: false,
            ..BridgeConfig::default()
        }
    }

    #[test]
    fn test_run_deinitializes() {
        let device = Arc::new(MockDevice::new());
        let acq = Acquisition::new(schedule(2), bridge(), "setup.ddk".into(), device.clone());
        let mut sink = MemorySink::new();
        let summary = acq.run(&mut sink, &CancelToken::new()).unwrap();

        assert_eq!(summary.ticks, 2);
        assert_eq!(device.deinit_calls(), 1);
        assert!(!device.is_initialized());
    }

    #[test]
    fn test_init_failure_never_schedules() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Status(19)));
        let acq = Acquisition::new(schedule(2), bridge(), "setup.ddk".into(), device.clone());
        let mut sink = MemorySink::new();
        let err = acq.run(&mut sink, &CancelToken::new()).unwrap_err();

        assert!(matches!(
            err,
            DaqError::Init(InitOutcome::NativeError(StatusCode(19)))
        ));
        assert_eq!(device.read_calls(), 0);
        assert_eq!(device.deinit_calls(), 0);
        assert!(sink.record().labels.is_empty());
    }

    #[test]
    fn test_cancel_during_init_is_clean_empty_run() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Hang));
        let acq = Acquisition::new(schedule(2), bridge(), "setup.ddk".into(), device.clone());
        let cancel = CancelToken::new();
        cancel.cancel();

        let mut sink = MemorySink::new();
        let summary = acq.run(&mut sink, &cancel).unwrap();

        assert_eq!(summary.final_state, SchedulerState::Cancelled);
        assert_eq!(summary.ticks, 0);
        assert_eq!(device.read_calls(), 0);
        assert!(!sink.record().finished);
        device.release_hang();
    }

    #[test]
    fn test_failed_init_leaves_no_csv_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut csv = CsvSink::create(dir.path(), "2024-05-01T14-03-22").unwrap();
        let path = csv.path().to_path_buf();

        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Status(2)));
        let acq = Acquisition::new(schedule(2), bridge(), "setup.ddk".into(), device);
        assert!(acq.run(&mut csv, &CancelToken::new()).is_err());
        assert!(!path.exists());
    }

    #[test]
    fn test_check_setup_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IMB_Test.ddk");
        assert!(check_setup_file(&path).is_err());
        std::fs::write(&path, b"[setup]").unwrap();
        check_setup_file(&path).unwrap();
    }
}
