//! Status codes returned by the gauge driver.
//!
//! The driver reports every outcome as a small integer. Only a handful carry a
//! documented meaning; this module names them and decodes the `Device_Init`
//! error table into [`InitStatus`] so callers never branch on magic numbers.

use std::fmt;

use ibr_ddk_sys as sys;

use crate::hardware::{ChannelId, ModuleId};

/// Raw status returned by a driver call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusCode(pub i16);

impl StatusCode {
    /// Generic success.
    pub const OK: Self = Self(sys::DEVICE_OK);
    /// `Device_Init` sentinel: the driver already holds an initialized context.
    pub const ALREADY_INITIALIZED: Self = Self(sys::DEVICE_ALREADY_INITIALIZED);
    /// `Device_DeInit` sentinel: nothing to release.
    pub const NOT_INITIALIZED: Self = Self(sys::DEVICE_NOT_INITIALIZED);
    /// `Device_Value`: gauge is outside its measuring range.
    pub const OUT_OF_RANGE: Self = Self(sys::VALUE_OUT_OF_RANGE);

    /// Returns the raw integer.
    pub fn raw(self) -> i16 {
        self.0
    }

    /// True for status 0.
    pub fn is_ok(self) -> bool {
        self == Self::OK
    }

    /// True when a reading failed because the gauge is out of range.
    pub fn is_out_of_range(self) -> bool {
        self == Self::OUT_OF_RANGE
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i16> for StatusCode {
    fn from(raw: i16) -> Self {
        Self(raw)
    }
}

/// Decoded result of `Device_Init`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitStatus {
    /// Devices opened and instruments initialized.
    Ok,
    /// The driver reported an existing initialization.
    AlreadyInitialized,
    /// Wrong parameter passed to `Device_Init`.
    WrongParameter,
    /// The setup file could not be read or is malformed.
    SetupFileError,
    /// The instrument connected to `device` has the wrong type.
    WrongInstrumentType {
        /// Device number from the setup file.
        device: i16,
    },
    /// Opening `device` failed.
    DeviceOpenError {
        /// Device number from the setup file.
        device: i16,
    },
    /// The setup selects no IBR instrument.
    NoInstrumentSelected,
    /// The driver's language resources failed to load.
    LanguageLoadError,
    /// `IBR_IO.CAT` was not found.
    IoCatalogueMissing,
    /// `IBR_DDK.USD` was not found.
    SerialDriverMissing,
    /// Undocumented code.
    Unknown(i16),
}

impl InitStatus {
    /// Decode a `Device_Init` return value.
    pub fn from_code(code: StatusCode) -> Self {
        match code.0 {
            sys::DEVICE_OK => Self::Ok,
            sys::DEVICE_ALREADY_INITIALIZED => Self::AlreadyInitialized,
            sys::INIT_WRONG_PARAMETER => Self::WrongParameter,
            sys::INIT_SETUP_FILE_ERROR => Self::SetupFileError,
            c @ sys::INIT_DEVICE_ERROR_FIRST..=sys::INIT_DEVICE_ERROR_LAST => {
                let device = (c - 1) / 2;
                if c % 2 == 0 {
                    Self::WrongInstrumentType { device }
                } else {
                    Self::DeviceOpenError { device }
                }
            }
            sys::INIT_NO_INSTRUMENT_SELECTED => Self::NoInstrumentSelected,
            sys::INIT_LANGUAGE_LOAD_ERROR => Self::LanguageLoadError,
            sys::INIT_IO_CATALOGUE_MISSING => Self::IoCatalogueMissing,
            sys::INIT_SERIAL_DRIVER_MISSING => Self::SerialDriverMissing,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for InitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "devices opened and instruments initialized"),
            Self::AlreadyInitialized => write!(f, "device already initialized"),
            Self::WrongParameter => write!(f, "wrong parameter"),
            Self::SetupFileError => write!(f, "file error in the setup file"),
            Self::WrongInstrumentType { device } => {
                write!(f, "wrong instrument type connected to device {device}")
            }
            Self::DeviceOpenError { device } => write!(f, "error on opening device {device}"),
            Self::NoInstrumentSelected => write!(f, "no IBR instrument selected in the setup"),
            Self::LanguageLoadError => write!(f, "error on loading the language"),
            Self::IoCatalogueMissing => {
                write!(f, "error on loading the I/O catalogue (IBR_IO.CAT not found)")
            }
            Self::SerialDriverMissing => {
                write!(f, "error on loading the universal serial driver (IBR_DDK.USD not found)")
            }
            Self::Unknown(code) => write!(f, "unknown init status {code}"),
        }
    }
}

/// Human-readable meaning of a `Device_DeInit` return value.
pub fn describe_deinit(code: StatusCode) -> String {
    match code {
        StatusCode::OK => "device closed successfully".to_string(),
        StatusCode::NOT_INITIALIZED => "device was not initialized".to_string(),
        StatusCode(device) => format!("error during deinit on device {device}"),
    }
}

/// Why a single reading failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailureKind {
    /// Status 136: the gauge is outside its measuring range.
    OutOfRange,
    /// Any other non-zero status.
    Status,
}

/// A failed `Device_Value` call with enough context to diagnose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadFailure {
    /// Module (device number) that was read.
    pub module: ModuleId,
    /// Gauge address on the module.
    pub channel: ChannelId,
    /// Status returned by the driver.
    pub status: StatusCode,
}

impl ReadFailure {
    /// Classify the failure.
    pub fn kind(&self) -> ReadFailureKind {
        if self.status.is_out_of_range() {
            ReadFailureKind::OutOfRange
        } else {
            ReadFailureKind::Status
        }
    }
}

impl fmt::Display for ReadFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            ReadFailureKind::OutOfRange => write!(
                f,
                "gauge {} on module {} out of range",
                self.channel, self.module
            ),
            ReadFailureKind::Status => write!(
                f,
                "error {} on gauge {} (module {})",
                self.status, self.channel, self.module
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_status_decoding() {
        assert_eq!(InitStatus::from_code(StatusCode(0)), InitStatus::Ok);
        assert_eq!(
            InitStatus::from_code(StatusCode(-1)),
            InitStatus::AlreadyInitialized
        );
        assert_eq!(InitStatus::from_code(StatusCode(2)), InitStatus::SetupFileError);
        assert_eq!(
            InitStatus::from_code(StatusCode(3)),
            InitStatus::DeviceOpenError { device: 1 }
        );
        assert_eq!(
            InitStatus::from_code(StatusCode(4)),
            InitStatus::WrongInstrumentType { device: 1 }
        );
        assert_eq!(
            InitStatus::from_code(StatusCode(18)),
            InitStatus::WrongInstrumentType { device: 8 }
        );
        assert_eq!(
            InitStatus::from_code(StatusCode(22)),
            InitStatus::SerialDriverMissing
        );
        assert_eq!(InitStatus::from_code(StatusCode(99)), InitStatus::Unknown(99));
    }

    #[test]
    fn test_init_status_messages_name_the_device() {
        let msg = InitStatus::from_code(StatusCode(7)).to_string();
        assert!(msg.contains("device 3"), "{msg}");
    }

    #[test]
    fn test_read_failure_kind() {
        let out = ReadFailure {
            module: 1,
            channel: 4,
            status: StatusCode::OUT_OF_RANGE,
        };
        assert_eq!(out.kind(), ReadFailureKind::OutOfRange);
        assert!(out.to_string().contains("out of range"));

        let err = ReadFailure {
            module: 1,
            channel: 4,
            status: StatusCode(12),
        };
        assert_eq!(err.kind(), ReadFailureKind::Status);
        assert!(err.to_string().contains("error 12"));
    }

    #[test]
    fn test_describe_deinit() {
        assert_eq!(describe_deinit(StatusCode::OK), "device closed successfully");
        assert!(describe_deinit(StatusCode(5)).contains("device 5"));
    }
}
