//! Low-level FFI surface for the IBR DDK gauge driver.
//!
//! The vendor ships the driver as `ibr_ddk.dll` together with its I/O
//! catalogue (`IBR_IO.CAT`) and serial driver (`IBR_DDK.USD`). The DLL is not
//! linked at build time; it is opened at run time from a configured path and
//! the four entry points below are resolved by name.
//!
//! # Safety
//!
//! Every call into [`IbrDdk`] is `unsafe`: the driver keeps process-wide state,
//! is not reentrant, and may pump the calling thread's message queue during
//! `Device_Init`. For a safe wrapper use the `ibr_daq` crate.
//!
//! # Example (unsafe)
//!
//! ```no_run
//! use ibr_ddk_sys::*;
//! use std::ffi::CString;
//! use std::ptr;
//!
//! unsafe {
//!     let ddk = IbrDdk::load(r"C:\IBR_DDK\DLL\x64\ibr_ddk.dll").unwrap();
//!     let setup = CString::new(r"C:\IMB_Test\IMB_Test.ddk").unwrap();
//!     let rc = ddk.device_init(LANGUAGE_ENGLISH, setup.as_ptr(), ptr::null_mut(), ptr::null_mut());
//!     if rc == DEVICE_OK {
//!         let mut value = 0.0;
//!         let status = ddk.device_value(1, 1, &mut value);
//!         println!("gauge 1: status {} value {}", status, value);
//!         ddk.device_deinit();
//!     }
//! }
//! ```

#![allow(non_snake_case)]
#![allow(unsafe_code)]

use std::ffi::OsStr;
use std::os::raw::{c_char, c_double, c_short, c_void};

use libloading::Library;

/// `short Device_Init(short language, const char* setup_file, void* parent, void* wh)`
pub type DeviceInitFn =
    unsafe extern "C" fn(c_short, *const c_char, *mut c_void, *mut c_void) -> c_short;

/// `short Device_Value(short device_nr, short address, double* value)`
pub type DeviceValueFn = unsafe extern "C" fn(c_short, c_short, *mut c_double) -> c_short;

/// `short Device_DeInit(void)`
pub type DeviceDeInitFn = unsafe extern "C" fn() -> c_short;

/// `void Device_GetVersion(short* major, short* minor)`
pub type DeviceGetVersionFn = unsafe extern "C" fn(*mut c_short, *mut c_short);

// Exported symbol names, NUL-terminated for `libloading`.

/// `Device_Init` symbol.
pub const SYM_DEVICE_INIT: &[u8] = b"Device_Init\0";
/// `Device_Value` symbol.
pub const SYM_DEVICE_VALUE: &[u8] = b"Device_Value\0";
/// `Device_DeInit` symbol.
pub const SYM_DEVICE_DEINIT: &[u8] = b"Device_DeInit\0";
/// `Device_GetVersion` symbol.
pub const SYM_DEVICE_GET_VERSION: &[u8] = b"Device_GetVersion\0";

/// Language selector for `Device_Init`. The driver only uses it for its own dialogs.
pub const LANGUAGE_ENGLISH: c_short = 1;

/// Generic success.
pub const DEVICE_OK: c_short = 0;

/// `Device_Init`: the driver was already initialized in this process.
pub const DEVICE_ALREADY_INITIALIZED: c_short = -1;

/// `Device_DeInit`: the driver was not initialized.
pub const DEVICE_NOT_INITIALIZED: c_short = -1;

/// `Device_Value`: the gauge reading is out of its measuring range.
pub const VALUE_OUT_OF_RANGE: c_short = 136;

// Device_Init error codes

/// `Device_Init`: invalid argument.
pub const INIT_WRONG_PARAMETER: c_short = 1;
/// `Device_Init`: the setup file could not be read.
pub const INIT_SETUP_FILE_ERROR: c_short = 2;
/// First per-device code; `(code - 1) / 2` is the device number.
pub const INIT_DEVICE_ERROR_FIRST: c_short = 3;
/// Last per-device code.
pub const INIT_DEVICE_ERROR_LAST: c_short = 18;
/// `Device_Init`: the setup file selects no instrument.
pub const INIT_NO_INSTRUMENT_SELECTED: c_short = 19;
/// `Device_Init`: the language resources failed to load.
pub const INIT_LANGUAGE_LOAD_ERROR: c_short = 20;
/// `Device_Init`: `IBR_IO.CAT` is missing next to the DLL.
pub const INIT_IO_CATALOGUE_MISSING: c_short = 21;
/// `Device_Init`: `IBR_DDK.USD` is missing next to the DLL.
pub const INIT_SERIAL_DRIVER_MISSING: c_short = 22;

/// A loaded `ibr_ddk.dll` with its entry points resolved.
///
/// The function pointers stay valid for as long as `_library` is alive, which
/// is the lifetime of this struct.
pub struct IbrDdk {
    device_init: DeviceInitFn,
    device_value: DeviceValueFn,
    device_deinit: DeviceDeInitFn,
    device_get_version: DeviceGetVersionFn,
    _library: Library,
}

impl IbrDdk {
    /// Load the driver library and resolve all entry points.
    ///
    /// # Safety
    ///
    /// Loading a library runs its initialization routines. The caller must
    /// trust the library at `path` and the signatures declared in this crate.
    pub unsafe fn load<P: AsRef<OsStr>>(path: P) -> Result<Self, libloading::Error> {
        // Resolve the driver's own dependencies from its directory first.
        #[cfg(windows)]
        let library: Library = libloading::os::windows::Library::load_with_flags(
            path,
            libloading::os::windows::LOAD_WITH_ALTERED_SEARCH_PATH,
        )?
        .into();
        #[cfg(not(windows))]
        let library = Library::new(path)?;
        let device_init = *library.get::<DeviceInitFn>(SYM_DEVICE_INIT)?;
        let device_value = *library.get::<DeviceValueFn>(SYM_DEVICE_VALUE)?;
        let device_deinit = *library.get::<DeviceDeInitFn>(SYM_DEVICE_DEINIT)?;
        let device_get_version = *library.get::<DeviceGetVersionFn>(SYM_DEVICE_GET_VERSION)?;

        Ok(Self {
            device_init,
            device_value,
            device_deinit,
            device_get_version,
            _library: library,
        })
    }

    /// # Safety
    ///
    /// `setup_file` must be a valid NUL-terminated string. The call may block
    /// and may require the calling thread's message queue to be serviced.
    pub unsafe fn device_init(
        &self,
        language: c_short,
        setup_file: *const c_char,
        parent: *mut c_void,
        wh: *mut c_void,
    ) -> c_short {
        (self.device_init)(language, setup_file, parent, wh)
    }

    /// # Safety
    ///
    /// `value` must be a valid, writable pointer. Not reentrant.
    pub unsafe fn device_value(
        &self,
        device_nr: c_short,
        address: c_short,
        value: *mut c_double,
    ) -> c_short {
        (self.device_value)(device_nr, address, value)
    }

    /// # Safety
    ///
    /// Releases driver-global state; must not race with other driver calls.
    pub unsafe fn device_deinit(&self) -> c_short {
        (self.device_deinit)()
    }

    /// # Safety
    ///
    /// Both pointers must be valid and writable.
    pub unsafe fn device_get_version(&self, major: *mut c_short, minor: *mut c_short) {
        (self.device_get_version)(major, minor)
    }
}

impl std::fmt::Debug for IbrDdk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IbrDdk").finish_non_exhaustive()
    }
}
