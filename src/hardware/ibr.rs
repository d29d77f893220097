//! Vendor driver backend.
//!
//! Wraps a loaded `ibr_ddk.dll` from `ibr-ddk-sys`. The library handle lives as
//! long as the [`IbrDevice`]; the driver's own context is owned by
//! [`crate::session::DeviceSession`], not by this type.

use std::ffi::CStr;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use ibr_ddk_sys::IbrDdk;

use crate::error::DaqError;
use crate::hardware::{ChannelId, ModuleId, NativeDevice, StatusCode};
use crate::pump::PumpHandles;

/// Gauge driver loaded from disk.
#[derive(Debug)]
pub struct IbrDevice {
    ddk: IbrDdk,
    library_path: PathBuf,
    library_dir: Option<PathBuf>,
}

impl IbrDevice {
    /// Load the driver DLL at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`DaqError::Library`] if the file does not exist or any of the
    /// four entry points cannot be resolved.
    pub fn load(path: &Path) -> Result<Self, DaqError> {
        if !path.is_file() {
            return Err(DaqError::Library {
                path: path.to_path_buf(),
                message: "missing DLL file".to_string(),
            });
        }

        // SAFETY: the library is the vendor driver named in the configuration;
        // its exported signatures are declared in ibr-ddk-sys.
        #[allow(unsafe_code)]
        let ddk = unsafe { IbrDdk::load(path) }.map_err(|e| DaqError::Library {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let library_dir = path
            .parent()
            .filter(|dir| !dir.as_os_str().is_empty())
            .map(Path::to_path_buf);

        info!(path = %path.display(), "Loaded IBR driver library");

        Ok(Self {
            ddk,
            library_path: path.to_path_buf(),
            library_dir,
        })
    }

    /// Path the library was loaded from.
    pub fn library_path(&self) -> &Path {
        &self.library_path
    }
}

#[allow(unsafe_code)]
impl NativeDevice for IbrDevice {
    fn init(&self, language: i16, setup_path: &CStr, handles: PumpHandles) -> StatusCode {
        debug!(setup = ?setup_path, parent = handles.parent, "Calling Device_Init");
        // SAFETY: setup_path is NUL-terminated and outlives the call; the
        // handles are either null or a live window owned by the caller's pump.
        let rc = unsafe {
            self.ddk.device_init(
                language,
                setup_path.as_ptr(),
                handles.parent as *mut std::ffi::c_void,
                handles.message as *mut std::ffi::c_void,
            )
        };
        StatusCode(rc)
    }

    fn get_value(&self, module: ModuleId, channel: ChannelId) -> (StatusCode, f64) {
        let mut value = 0.0f64;
        // SAFETY: value is a valid out pointer for the duration of the call.
        let rc = unsafe { self.ddk.device_value(module, channel, &mut value) };
        (StatusCode(rc), value)
    }

    fn deinit(&self) -> StatusCode {
        // SAFETY: the session guarantees no other driver call is in flight.
        StatusCode(unsafe { self.ddk.device_deinit() })
    }

    fn version(&self) -> (i16, i16) {
        let mut major: i16 = 0;
        let mut minor: i16 = 0;
        // SAFETY: both pointers are valid for the duration of the call.
        unsafe { self.ddk.device_get_version(&mut major, &mut minor) };
        (major, minor)
    }

    fn library_dir(&self) -> Option<&Path> {
        self.library_dir.as_deref()
    }

    fn name(&self) -> &str {
        "ibr_ddk"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_dll() {
        let err = IbrDevice::load(Path::new("/nonexistent/ibr_ddk.dll")).unwrap_err();
        match err {
            DaqError::Library { path, message } => {
                assert!(path.ends_with("ibr_ddk.dll"));
                assert_eq!(message, "missing DLL file");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_load_non_library_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ibr_ddk.dll");
        std::fs::write(&path, b"not a library").unwrap();

        let err = IbrDevice::load(&path).unwrap_err();
        assert!(matches!(err, DaqError::Library { .. }));
    }
}
