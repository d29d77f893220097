//! Device Session
//!
//! Owns the driver's process-wide context and enforces its lifecycle:
//!
//! ```text
//!                 initialize: Success
//!  Uninitialized ─────────────────────▶ Initialized ──deinit──▶ Deinitialized
//!       │    ▲                                                     │
//!       │    └──────────── initialize (non-success) ───────────────┘
//!       │ initialize: Timeout / Cancelled
//!       ▼
//!    Detached ──force_deinit──▶ Deinitialized
//! ```
//!
//! `Detached` means an init call was abandoned (timed out or cancelled) and
//! its worker may still finish.
//! Re-initialization is refused until [`DeviceSession::force_deinit`] has run.
//!
//! Only one session per process should hold the driver. The native layer is
//! not reentrant and there is no mutual exclusion beyond this state machine.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::bridge::{BridgeFault, InitBridge, InitOutcome};
use crate::hardware::status::describe_deinit;
use crate::hardware::{ChannelId, ModuleId, NativeDevice, StatusCode};
use crate::scheduler::CancelToken;

/// Lifecycle state of a [`DeviceSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No driver context held.
    Uninitialized,
    /// The driver context is open.
    Initialized,
    /// An init call timed out; the driver may or may not be initialized.
    Detached,
    /// The driver context was released.
    Deinitialized,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Initialized => "initialized",
            Self::Detached => "detached",
            Self::Deinitialized => "deinitialized",
        };
        f.write_str(s)
    }
}

/// Session-level refusals.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    /// `deinit` outside `Initialized`; the driver was not called.
    #[error("device session is not initialized (state: {0})")]
    NotInitialized(SessionState),
}

/// The single owner of the driver context.
pub struct DeviceSession {
    device: Arc<dyn NativeDevice>,
    bridge: InitBridge,
    state: SessionState,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device", &self.device.name())
            .field("state", &self.state)
            .finish()
    }
}

impl DeviceSession {
    /// New session in `Uninitialized`.
    pub fn new(device: Arc<dyn NativeDevice>, bridge: InitBridge) -> Self {
        Self {
            device,
            bridge,
            state: SessionState::Uninitialized,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// True in `Initialized`.
    pub fn is_initialized(&self) -> bool {
        self.state == SessionState::Initialized
    }

    /// Initialize the driver through the bridge.
    ///
    /// Transitions to `Initialized` on success and to `Detached` on timeout.
    /// Any other outcome leaves the state unchanged.
    pub fn initialize(&mut self, setup_path: &Path) -> InitOutcome {
        self.initialize_cancellable(setup_path, &CancelToken::new())
    }

    /// [`DeviceSession::initialize`] that stops waiting when `cancel` fires.
    /// A cancelled attempt leaves the session `Detached`, like a timeout.
    pub fn initialize_cancellable(&mut self, setup_path: &Path, cancel: &CancelToken) -> InitOutcome {
        match self.state {
            SessionState::Initialized => {
                debug!(phase = "init", "Session already initialized, skipping Device_Init");
                return InitOutcome::Success;
            }
            SessionState::Detached => {
                warn!(phase = "init", "Refusing to initialize a detached session");
                return InitOutcome::BridgeFault(BridgeFault::SessionDetached);
            }
            SessionState::Uninitialized | SessionState::Deinitialized => {}
        }

        let outcome = self
            .bridge
            .initialize_cancellable(Arc::clone(&self.device), setup_path, cancel);
        match outcome {
            InitOutcome::Success => self.state = SessionState::Initialized,
            InitOutcome::Timeout | InitOutcome::Cancelled => self.state = SessionState::Detached,
            InitOutcome::NativeError(_) | InitOutcome::BridgeFault(_) => {}
        }
        outcome
    }

    /// Read one gauge.
    ///
    /// Outside `Initialized` the driver is still called, but the value may be
    /// stale, so a warning is emitted.
    pub fn read_value(&self, module: ModuleId, channel: ChannelId) -> (StatusCode, f64) {
        if self.state != SessionState::Initialized {
            warn!(
                phase = "read",
                module,
                channel,
                state = %self.state,
                "Reading from a device session that is not initialized"
            );
        }
        self.device.get_value(module, channel)
    }

    /// Release the driver context.
    ///
    /// # Errors
    ///
    /// [`SessionError::NotInitialized`] outside `Initialized`; the driver is
    /// not called in that case.
    pub fn deinit(&mut self) -> Result<StatusCode, SessionError> {
        if self.state != SessionState::Initialized {
            debug!(phase = "deinit", state = %self.state, "Deinit skipped");
            return Err(SessionError::NotInitialized(self.state));
        }
        Ok(self.release())
    }

    /// Call the native deinit regardless of state.
    ///
    /// Recovers a `Detached` session; the result may be the driver's own
    /// "not initialized" status.
    pub fn force_deinit(&mut self) -> StatusCode {
        info!(phase = "deinit", state = %self.state, "Forcing device deinit");
        self.release()
    }

    /// Driver version as `(major, minor)`.
    pub fn version(&self) -> (i16, i16) {
        if self.state != SessionState::Initialized {
            warn!(state = %self.state, "Querying driver version outside an initialized session");
        }
        self.device.version()
    }

    fn release(&mut self) -> StatusCode {
        let status = self.device.deinit();
        // Unconditional: a failed deinit must not leave the session "initialized".
        self.state = SessionState::Deinitialized;
        if status.is_ok() {
            info!(phase = "deinit", "Device closed");
        } else {
            warn!(
                phase = "deinit",
                status = %status,
                reason = %describe_deinit(status),
                "Device deinit reported a problem"
            );
        }
        status
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        if self.state == SessionState::Initialized {
            let status = self.device.deinit();
            self.state = SessionState::Deinitialized;
            if status.is_ok() {
                debug!(phase = "deinit", "Device closed on session drop");
            } else {
                error!(
                    phase = "deinit",
                    status = %status,
                    reason = %describe_deinit(status),
                    "Device deinit failed during session teardown"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeConfig;
    use crate::hardware::{InitBehavior, MockDevice};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn session(device: Arc<MockDevice>, timeout: Duration) -> DeviceSession {
        DeviceSession::new(
            device,
            InitBridge::new(BridgeConfig {
                timeout,
                change_working_dir: false,
                ..BridgeConfig::default()
            }),
        )
    }

    #[test]
    fn test_lifecycle() {
        let device = Arc::new(MockDevice::new());
        let mut s = session(device.clone(), Duration::from_secs(2));
        assert_eq!(s.state(), SessionState::Uninitialized);

        assert!(s.initialize(Path::new("setup.ddk")).is_success());
        assert_eq!(s.state(), SessionState::Initialized);

        assert_eq!(s.deinit(), Ok(StatusCode::OK));
        assert_eq!(s.state(), SessionState::Deinitialized);
        assert_eq!(device.deinit_calls(), 1);
    }

    #[test]
    fn test_deinit_twice_returns_sentinel() {
        let device = Arc::new(MockDevice::new());
        let mut s = session(device.clone(), Duration::from_secs(2));
        s.initialize(Path::new("setup.ddk"));

        assert!(s.deinit().is_ok());
        assert_eq!(
            s.deinit(),
            Err(SessionError::NotInitialized(SessionState::Deinitialized))
        );
        assert_eq!(device.deinit_calls(), 1);
    }

    #[test]
    fn test_deinit_before_init_does_not_call_driver() {
        let device = Arc::new(MockDevice::new());
        let mut s = session(device.clone(), Duration::from_secs(2));
        assert!(s.deinit().is_err());
        assert_eq!(device.deinit_calls(), 0);
    }

    #[test]
    fn test_failed_deinit_still_transitions() {
        let device = Arc::new(MockDevice::new().with_deinit_status(3));
        let mut s = session(device, Duration::from_secs(2));
        s.initialize(Path::new("setup.ddk"));
        assert_eq!(s.deinit(), Ok(StatusCode(3)));
        assert_eq!(s.state(), SessionState::Deinitialized);
    }

    #[test]
    fn test_native_error_stays_uninitialized() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Status(21)));
        let mut s = session(device, Duration::from_secs(2));
        assert_eq!(
            s.initialize(Path::new("setup.ddk")),
            InitOutcome::NativeError(StatusCode(21))
        );
        assert_eq!(s.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_initialize_when_initialized_skips_driver() {
        let device = Arc::new(MockDevice::new());
        let mut s = session(device.clone(), Duration::from_secs(2));
        s.initialize(Path::new("setup.ddk"));
        assert!(s.initialize(Path::new("setup.ddk")).is_success());
        assert_eq!(device.init_calls(), 1);
    }

    #[test]
    fn test_timeout_detaches_and_refuses_reinit() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Hang));
        let mut s = session(device.clone(), Duration::from_millis(100));

        assert_eq!(s.initialize(Path::new("setup.ddk")), InitOutcome::Timeout);
        assert_eq!(s.state(), SessionState::Detached);

        assert_eq!(
            s.initialize(Path::new("setup.ddk")),
            InitOutcome::BridgeFault(BridgeFault::SessionDetached)
        );
        assert_eq!(device.init_calls(), 1);

        device.release_hang();
        s.force_deinit();
        assert_eq!(s.state(), SessionState::Deinitialized);
    }

    #[test]
    fn test_cancelled_init_detaches() {
        let device = Arc::new(MockDevice::new().with_init(InitBehavior::Hang));
        let mut s = session(device.clone(), Duration::from_secs(10));
        let cancel = CancelToken::new();
        cancel.cancel();

        assert_eq!(
            s.initialize_cancellable(Path::new("setup.ddk"), &cancel),
            InitOutcome::Cancelled
        );
        assert_eq!(s.state(), SessionState::Detached);

        device.release_hang();
        s.force_deinit();
    }

    #[test]
    fn test_drop_deinitializes() {
        let device = Arc::new(MockDevice::new());
        {
            let mut s = session(device.clone(), Duration::from_secs(2));
            s.initialize(Path::new("setup.ddk"));
        }
        assert_eq!(device.deinit_calls(), 1);
        assert!(!device.is_initialized());
    }

    #[test]
    fn test_drop_after_deinit_does_not_call_again() {
        let device = Arc::new(MockDevice::new());
        {
            let mut s = session(device.clone(), Duration::from_secs(2));
            s.initialize(Path::new("setup.ddk"));
            s.deinit().unwrap();
        }
        assert_eq!(device.deinit_calls(), 1);
    }

    #[test]
    #[traced_test]
    fn test_read_outside_initialized_warns() {
        let device = Arc::new(MockDevice::new());
        let s = session(device.clone(), Duration::from_secs(2));
        let (status, _) = s.read_value(1, 1);
        assert!(status.is_ok());
        assert_eq!(device.read_calls(), 1);
        assert!(logs_contain("not initialized"));
    }
}
