//! Custom error types for the application.
//!
//! `DaqError` is the one error type that crosses module boundaries. Component
//! errors ([`SchedulingFault`], [`SinkError`], [`SessionError`],
//! [`ChannelError`]) keep their own context and convert into it with `?`.
//!
//! ## Exit codes
//!
//! The binary maps errors to process exit codes with [`DaqError::exit_code`]:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | clean or user-cancelled completion |
//! | 1 | other failure |
//! | 2 | configuration or usage error |
//! | 3 | driver load or initialization failure |
//! | 4 | scheduling or sink failure |

use std::path::PathBuf;

use thiserror::Error;

use crate::bridge::InitOutcome;
use crate::channels::ChannelError;
use crate::scheduler::SchedulingFault;
use crate::session::SessionError;
use crate::sink::SinkError;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Errors surfaced to the CLI.
#[derive(Error, Debug)]
pub enum DaqError {
    /// A configuration layer could not be parsed.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// A configured value is out of range or inconsistent.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The channel selection could not be parsed.
    #[error("Invalid channel selection: {0}")]
    ChannelSelection(#[from] ChannelError),

    /// File system error outside a sink.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The driver DLL or one of its entry points could not be loaded.
    #[error("Cannot load driver library '{}': {message}", path.display())]
    Library {
        /// DLL path.
        path: PathBuf,
        /// Loader error text.
        message: String,
    },

    /// `Device_Init` did not succeed; sampling never started.
    #[error("Device initialization failed: {0}")]
    Init(InitOutcome),

    /// The sampling loop hit an invariant violation.
    #[error("Scheduling fault: {0}")]
    Scheduling(#[from] SchedulingFault),

    /// A row could not be written.
    #[error("Sink error: {0}")]
    Sink(#[from] SinkError),

    /// A lifecycle call was refused.
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        Self::Config(Box::new(err))
    }
}

impl DaqError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) | Self::Configuration(_) | Self::ChannelSelection(_) => 2,
            Self::Library { .. } | Self::Init(_) => 3,
            Self::Scheduling(_) | Self::Sink(_) => 4,
            Self::Io(_) | Self::Session(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::StatusCode;

    #[test]
    fn exit_codes_by_category() {
        assert_eq!(DaqError::Configuration("bad".into()).exit_code(), 2);
        assert_eq!(DaqError::from(ChannelError::Empty).exit_code(), 2);
        assert_eq!(DaqError::Init(InitOutcome::Timeout).exit_code(), 3);
        assert_eq!(
            DaqError::Library {
                path: PathBuf::from("ibr_ddk.dll"),
                message: "missing DLL file".into(),
            }
            .exit_code(),
            3
        );
        assert_eq!(
            DaqError::from(SchedulingFault::UnknownChannel(3)).exit_code(),
            4
        );
        assert_eq!(
            DaqError::from(SinkError::NotStarted("csv")).exit_code(),
            4
        );
        assert_eq!(
            DaqError::from(std::io::Error::other("disk")).exit_code(),
            1
        );
    }

    #[test]
    fn init_error_message_names_the_status() {
        let err = DaqError::Init(InitOutcome::NativeError(StatusCode(21)));
        let msg = err.to_string();
        assert!(msg.contains("21"), "{msg}");
        assert!(msg.contains("IBR_IO.CAT"), "{msg}");
    }
}
