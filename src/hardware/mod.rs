//! Native Device Interface
//!
//! The gauge driver exposes four blocking entry points. [`NativeDevice`] is the
//! seam between them and the rest of the crate: the vendor DLL sits behind
//! [`ibr::IbrDevice`], and [`mock::MockDevice`] stands in for it in tests and
//! simulated runs.
//!
//! # Contract
//! - Calls block until the driver returns.
//! - `init` may need the calling thread's message queue to be serviced; only
//!   the [`crate::bridge`] calls it.
//! - The driver is not reentrant. Callers serialize access (the session and
//!   scheduler run on a single thread).

use std::ffi::CStr;
use std::path::Path;

pub mod ibr;
pub mod mock;
pub mod status;

pub use ibr::IbrDevice;
pub use mock::{InitBehavior, MockDevice, ReadingScript};
pub use status::{InitStatus, ReadFailure, ReadFailureKind, StatusCode};

use crate::pump::PumpHandles;

/// Device (module) number as understood by the driver.
pub type ModuleId = i16;

/// Gauge address on a module.
pub type ChannelId = i16;

/// Blocking driver entry points.
pub trait NativeDevice: Send + Sync {
    /// `Device_Init`. May block indefinitely if the message pump is not serviced.
    fn init(&self, language: i16, setup_path: &CStr, handles: PumpHandles) -> StatusCode;

    /// `Device_Value`. The value is meaningless unless the status is OK.
    fn get_value(&self, module: ModuleId, channel: ChannelId) -> (StatusCode, f64);

    /// `Device_DeInit`.
    fn deinit(&self) -> StatusCode;

    /// `Device_GetVersion` as `(major, minor)`.
    fn version(&self) -> (i16, i16);

    /// Directory the working directory must match while `init` runs, if any.
    fn library_dir(&self) -> Option<&Path> {
        None
    }

    /// Short name for logs.
    fn name(&self) -> &str;
}
