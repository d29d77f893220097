//! # IBR DAQ Library
//!
//! Drives an IBR gauge instrument through its blocking vendor driver and turns
//! its readings into a steady, oversampled time series.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: the [`hardware::NativeDevice`] seam over the driver's four
//!   entry points, the DLL-backed [`hardware::IbrDevice`], the scriptable
//!   [`hardware::MockDevice`], and the driver's status codes.
//! - **`pump`**: hidden window whose message queue is drained while
//!   `Device_Init` runs.
//! - **`bridge`**: runs `Device_Init` on a worker thread with a timeout while
//!   the caller pumps messages.
//! - **`session`**: the driver's lifecycle state machine.
//! - **`scheduler`**: the drift-corrected, oversampling acquisition loop.
//! - **`sink`**: CSV, console and in-memory row destinations.
//! - **`channels`**: channel selection syntax and labels.
//! - **`acquisition`**: one run, init to deinit.
//! - **`config`**: layered configuration (defaults, TOML, environment, CLI).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: the [`error::DaqError`] enum and exit codes.
//!
//! ## Data flow
//!
//! ```text
//! Scheduler → DeviceSession → NativeDevice → (MessagePump, init only)
//!     │
//!     └──▶ SampleRow ──▶ Sink
//! ```

pub mod acquisition;
pub mod bridge;
pub mod channels;
pub mod config;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod pump;
pub mod scheduler;
pub mod session;
pub mod sink;

pub use acquisition::Acquisition;
pub use bridge::{BridgeConfig, BridgeFault, InitBridge, InitOutcome};
pub use error::{AppResult, DaqError};
pub use scheduler::{CancelToken, RunSummary, SamplingScheduler, ScheduleConfig};
pub use session::{DeviceSession, SessionState};
