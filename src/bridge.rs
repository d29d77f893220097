//! Initialization Bridge
//!
//! `Device_Init` is synchronous and may sit waiting for window messages on the
//! thread that called it. Calling it directly from the acquisition thread can
//! therefore deadlock. The bridge runs the call on a worker thread and keeps
//! the calling thread busy draining a [`MessagePump`]:
//!
//! ```text
//!  calling thread                       worker "ibr-init"
//!  ──────────────                       ─────────────────
//!  create pump
//!  spawn worker  ─────────────────────▶ Device_Init(setup, pump handles)
//!  loop:                                       │
//!    drain pump                                │
//!    worker done? ◀──── mpsc ───────────────── status / panic
//!    cancelled?  → Cancelled (worker detached)
//!    timed out?  → Timeout (worker detached)
//!    sleep poll_interval
//! ```
//!
//! The bridge never blocks the caller past `timeout`, and returns early when
//! the run's [`CancelToken`] fires. An abandoned call keeps running on its
//! detached worker and may still initialize the driver later;
//! [`crate::session::DeviceSession`] records that as a `Detached` state. The
//! pump window passed to that call as its parent is detached with it and
//! stays alive until the calling thread exits.

use std::any::Any;
use std::ffi::CString;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::hardware::{InitStatus, NativeDevice, StatusCode};
use crate::pump::MessagePump;
use crate::scheduler::CancelToken;

/// Infrastructure failure while attempting initialization.
///
/// Fatal to the current attempt, never to the process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeFault {
    /// The pump's window class could not be registered.
    #[error("message pump class registration failed: {0}")]
    PumpRegistration(String),

    /// The pump's window could not be created.
    #[error("message pump window creation failed: {0}")]
    PumpWindow(String),

    /// The working directory could not be switched to the driver directory.
    #[error("cannot enter driver directory '{path}': {message}")]
    WorkingDirectory {
        /// Directory that was requested.
        path: PathBuf,
        /// OS error text.
        message: String,
    },

    /// The setup path cannot be passed as a C string.
    #[error("setup path '{0}' contains an interior NUL byte")]
    InvalidSetupPath(String),

    /// The worker thread could not be started.
    #[error("failed to spawn init worker: {0}")]
    WorkerSpawn(String),

    /// The native call panicked inside the worker.
    #[error("init worker panicked: {0}")]
    WorkerPanicked(String),

    /// The worker exited without reporting a status.
    #[error("init worker exited without reporting a status")]
    WorkerLost,

    /// A previous attempt timed out and may still be running.
    #[error("a previous init attempt timed out and may still complete; call force_deinit first")]
    SessionDetached,
}

/// Single, unambiguous result of an initialization attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    /// The driver is initialized.
    Success,
    /// The driver returned a non-zero status other than the "already initialized" sentinel.
    NativeError(StatusCode),
    /// The native call did not finish within the timeout.
    Timeout,
    /// The run was cancelled while the native call was still running.
    Cancelled,
    /// The attempt failed before or around the native call.
    BridgeFault(BridgeFault),
}

impl InitOutcome {
    /// Map a raw `Device_Init` status to an outcome.
    ///
    /// The "already initialized" sentinel counts as success. Whether that
    /// hides a double-init bug elsewhere is unresolved; the event is logged
    /// at `warn` so it stays visible.
    pub fn from_status(status: StatusCode) -> Self {
        match InitStatus::from_code(status) {
            InitStatus::Ok => Self::Success,
            InitStatus::AlreadyInitialized => {
                warn!(
                    phase = "init",
                    status = %status,
                    "Device already initialized, continuing"
                );
                Self::Success
            }
            _ => Self::NativeError(status),
        }
    }

    /// True for [`InitOutcome::Success`].
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for InitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::NativeError(status) => write!(
                f,
                "driver returned status {} ({})",
                status,
                InitStatus::from_code(*status)
            ),
            Self::Timeout => write!(f, "timed out waiting for Device_Init"),
            Self::Cancelled => write!(f, "cancelled while waiting for Device_Init"),
            Self::BridgeFault(fault) => write!(f, "{fault}"),
        }
    }
}

/// Bridge settings.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on how long the caller waits for `Device_Init`.
    pub timeout: Duration,
    /// Sleep between drain/check cycles.
    pub poll_interval: Duration,
    /// Language argument for `Device_Init`.
    pub language: i16,
    /// Switch to the driver's directory while the call runs.
    pub change_working_dir: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(10),
            language: ibr_ddk_sys::LANGUAGE_ENGLISH,
            change_working_dir: true,
        }
    }
}

/// Switches the process working directory and restores it on drop.
#[derive(Debug)]
pub struct WorkingDirGuard {
    previous: PathBuf,
}

impl WorkingDirGuard {
    /// Enter `dir`, remembering the current directory.
    pub fn enter(dir: &Path) -> Result<Self, BridgeFault> {
        let fault = |e: std::io::Error| BridgeFault::WorkingDirectory {
            path: dir.to_path_buf(),
            message: e.to_string(),
        };
        let previous = std::env::current_dir().map_err(fault)?;
        std::env::set_current_dir(dir).map_err(fault)?;
        debug!(dir = %dir.display(), "Entered driver directory");
        Ok(Self { previous })
    }
}

impl Drop for WorkingDirGuard {
    fn drop(&mut self) {
        if let Err(e) = std::env::set_current_dir(&self.previous) {
            warn!(
                dir = %self.previous.display(),
                error = %e,
                "Failed to restore working directory"
            );
        }
    }
}

/// Runs `Device_Init` off-thread while servicing the message pump.
#[derive(Debug, Clone, Default)]
pub struct InitBridge {
    config: BridgeConfig,
}

impl InitBridge {
    /// Create a bridge with the given settings.
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Bridge settings.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Initialize `device` with `setup_path`, waiting at most the configured timeout.
    pub fn initialize(&self, device: Arc<dyn NativeDevice>, setup_path: &Path) -> InitOutcome {
        self.initialize_cancellable(device, setup_path, &CancelToken::new())
    }

    /// Like [`InitBridge::initialize`], but gives up as soon as `cancel` fires.
    pub fn initialize_cancellable(
        &self,
        device: Arc<dyn NativeDevice>,
        setup_path: &Path,
        cancel: &CancelToken,
    ) -> InitOutcome {
        let started = Instant::now();
        let outcome = self.run(device, setup_path, cancel, started);
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match &outcome {
            InitOutcome::Success => info!(phase = "init", elapsed_ms, "Device initialized"),
            InitOutcome::NativeError(status) => error!(
                phase = "init",
                status = %status,
                reason = %InitStatus::from_code(*status),
                elapsed_ms,
                "Device initialization failed"
            ),
            InitOutcome::Timeout => error!(
                phase = "init",
                timeout_ms = self.config.timeout.as_millis() as u64,
                "Device_Init did not return in time; worker left running"
            ),
            InitOutcome::Cancelled => warn!(
                phase = "init",
                elapsed_ms,
                "Initialization cancelled; worker left running"
            ),
            InitOutcome::BridgeFault(fault) => error!(
                phase = "init",
                fault = %fault,
                elapsed_ms,
                "Initialization bridge fault"
            ),
        }
        outcome
    }

    fn run(
        &self,
        device: Arc<dyn NativeDevice>,
        setup_path: &Path,
        cancel: &CancelToken,
        started: Instant,
    ) -> InitOutcome {
        // Resolve before the working directory moves.
        let setup_path = absolute(setup_path);
        let setup = match CString::new(setup_path.to_string_lossy().into_owned()) {
            Ok(s) => s,
            Err(_) => {
                return InitOutcome::BridgeFault(BridgeFault::InvalidSetupPath(
                    setup_path.display().to_string(),
                ))
            }
        };

        let pump = match MessagePump::create() {
            Ok(pump) => pump,
            Err(fault) => return InitOutcome::BridgeFault(fault),
        };

        let _cwd = match (self.config.change_working_dir, device.library_dir()) {
            (true, Some(dir)) => match WorkingDirGuard::enter(dir) {
                Ok(guard) => Some(guard),
                Err(fault) => return InitOutcome::BridgeFault(fault),
            },
            _ => None,
        };

        let handles = pump.handles();
        let language = self.config.language;
        let (tx, rx) = mpsc::channel();
        let worker_device = Arc::clone(&device);

        debug!(
            device = device.name(),
            setup = %setup_path.display(),
            "Starting Device_Init on worker thread"
        );

        let spawned = thread::Builder::new()
            .name("ibr-init".to_string())
            .spawn(move || {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    worker_device.init(language, &setup, handles)
                }))
                .map_err(panic_message);
                // The receiver is gone after a timeout; nothing to report to.
                let _ = tx.send(result);
            });

        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => return InitOutcome::BridgeFault(BridgeFault::WorkerSpawn(e.to_string())),
        };

        loop {
            pump.drain_once();

            match rx.try_recv() {
                Ok(Ok(status)) => {
                    let _ = worker.join();
                    return InitOutcome::from_status(status);
                }
                Ok(Err(message)) => {
                    let _ = worker.join();
                    return InitOutcome::BridgeFault(BridgeFault::WorkerPanicked(message));
                }
                Err(TryRecvError::Disconnected) => {
                    return InitOutcome::BridgeFault(BridgeFault::WorkerLost);
                }
                Err(TryRecvError::Empty) => {}
            }

            let elapsed = started.elapsed();
            let abandoned = if cancel.is_cancelled() {
                Some(InitOutcome::Cancelled)
            } else if elapsed >= self.config.timeout {
                Some(InitOutcome::Timeout)
            } else {
                None
            };
            if let Some(outcome) = abandoned {
                // Dropping the handle detaches the worker; the window it was
                // given must outlive it.
                drop(worker);
                pump.detach();
                return outcome;
            }
            thread::sleep(self.config.poll_interval.min(self.config.timeout - elapsed));
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{InitBehavior, MockDevice};
    use serial_test::serial;

    fn bridge(timeout: Duration) -> InitBridge {
        InitBridge::new(BridgeConfig {
            timeout,
            ..BridgeConfig::default()
        })
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(InitOutcome::from_status(StatusCode(0)), InitOutcome::Success);
        assert_eq!(InitOutcome::from_status(StatusCode(-1)), InitOutcome::Success);
        assert_eq!(
            InitOutcome::from_status(StatusCode(21)),
            InitOutcome::NativeError(StatusCode(21))
        );
    }

    #[test]
    fn test_success() {
        let device = Arc::new(MockDevice::new());
        let outcome = bridge(Duration::from_secs(2)).initialize(device.clone(), Path::new("a.ddk"));
        assert_eq!(outcome, InitOutcome::Success);
        assert!(device.is_initialized());
    }

    #[test]
    fn test_native_error() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Status(2)));
        let outcome = bridge(Duration::from_secs(2)).initialize(device, Path::new("a.ddk"));
        assert_eq!(outcome, InitOutcome::NativeError(StatusCode(2)));
        assert!(outcome.to_string().contains("setup file"));
    }

    #[test]
    fn test_already_initialized_is_success() {
        let device = Arc::new(MockDevice::new());
        let b = bridge(Duration::from_secs(2));
        assert!(b.initialize(device.clone(), Path::new("a.ddk")).is_success());
        assert!(b.initialize(device.clone(), Path::new("a.ddk")).is_success());
        assert_eq!(device.init_calls(), 2);
    }

    #[test]
    fn test_worker_panic_is_fault() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Panic("driver blew up".into())));
        let outcome = bridge(Duration::from_secs(2)).initialize(device, Path::new("a.ddk"));
        assert_eq!(
            outcome,
            InitOutcome::BridgeFault(BridgeFault::WorkerPanicked("driver blew up".into()))
        );
    }

    #[test]
    fn test_slow_init_within_timeout() {
        let device = Arc::new(
            MockDevice::new().with_init(InitBehavior::Delay(Duration::from_millis(100), 0)),
        );
        let outcome = bridge(Duration::from_secs(2)).initialize(device, Path::new("a.ddk"));
        assert_eq!(outcome, InitOutcome::Success);
    }

    #[test]
    fn test_hang_times_out() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Hang));
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let outcome = bridge(timeout).initialize(device.clone(), Path::new("a.ddk"));
        let elapsed = start.elapsed();

        assert_eq!(outcome, InitOutcome::Timeout);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(250), "took {elapsed:?}");
        device.release_hang();
    }

    #[test]
    fn test_cancel_stops_waiting_for_hung_init() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Hang));
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = bridge(Duration::from_secs(10)).initialize_cancellable(
            device.clone(),
            Path::new("a.ddk"),
            &cancel,
        );

        assert_eq!(outcome, InitOutcome::Cancelled);
        assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
        device.release_hang();
    }

    #[test]
    fn test_timeout_keeps_pump_window_alive() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Hang));
        let before = MessagePump::detached_on_this_thread();

        let outcome = bridge(Duration::from_millis(50)).initialize(device.clone(), Path::new("a.ddk"));

        assert_eq!(outcome, InitOutcome::Timeout);
        assert_eq!(MessagePump::detached_on_this_thread(), before + 1);
        device.release_hang();
    }

    #[test]
    fn test_completed_init_releases_pump() {
        let device = Arc::new(MockDevice::new());
        let before = MessagePump::detached_on_this_thread();
        bridge(Duration::from_secs(2)).initialize(device, Path::new("a.ddk"));
        assert_eq!(MessagePump::detached_on_this_thread(), before);
    }

    #[test]
    fn test_interior_nul_rejected() {
        let device = Arc::new(MockDevice::new());
        let outcome = bridge(Duration::from_secs(1)).initialize(device.clone(), Path::new("bad\0.ddk"));
        assert!(matches!(
            outcome,
            InitOutcome::BridgeFault(BridgeFault::InvalidSetupPath(_))
        ));
        assert_eq!(device.init_calls(), 0);
    }

    #[test]
    #[serial]
    fn test_working_dir_guard_restores() {
        let before = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        {
            let _guard = WorkingDirGuard::enter(dir.path()).unwrap();
            assert_eq!(
                std::env::current_dir().unwrap().canonicalize().unwrap(),
                dir.path().canonicalize().unwrap()
            );
        }
        assert_eq!(std::env::current_dir().unwrap(), before);
    }

    #[test]
    #[serial]
    fn test_working_dir_guard_missing_dir() {
        let err = WorkingDirGuard::enter(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, BridgeFault::WorkingDirectory { .. }));
    }

    #[test]
    fn test_panic_message_variants() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
