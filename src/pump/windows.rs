//! Win32 hidden window and `PeekMessage` loop.

#![allow(unsafe_code)]

use std::ffi::OsStr;
use std::iter::once;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr;

use tracing::{debug, warn};
use winapi::shared::minwindef::{LPARAM, LRESULT, UINT, WPARAM};
use winapi::shared::windef::HWND;
use winapi::shared::winerror::ERROR_CLASS_ALREADY_EXISTS;
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::libloaderapi::GetModuleHandleW;
use winapi::um::winuser::{
    CreateWindowExW, DefWindowProcW, DestroyWindow, DispatchMessageW, PeekMessageW,
    RegisterClassExW, TranslateMessage, MSG, PM_REMOVE, WNDCLASSEXW,
};

use crate::bridge::BridgeFault;
use crate::pump::PumpHandles;

const CLASS_NAME: &str = "IbrDaqMessagePump";
const WINDOW_TITLE: &str = "ibr-daq";

fn wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(once(0)).collect()
}

unsafe extern "system" fn window_proc(
    hwnd: HWND,
    msg: UINT,
    wparam: WPARAM,
    lparam: LPARAM,
) -> LRESULT {
    DefWindowProcW(hwnd, msg, wparam, lparam)
}

pub(super) struct PlatformPump {
    hwnd: HWND,
}

impl PlatformPump {
    pub(super) fn create() -> Result<Self, BridgeFault> {
        let class_name = wide(CLASS_NAME);
        let title = wide(WINDOW_TITLE);

        // SAFETY: all pointers passed below are either null or point to
        // NUL-terminated buffers that outlive the calls.
        unsafe {
            let hinstance = GetModuleHandleW(ptr::null());

            let class = WNDCLASSEXW {
                cbSize: mem::size_of::<WNDCLASSEXW>() as UINT,
                style: 0,
                lpfnWndProc: Some(window_proc),
                cbClsExtra: 0,
                cbWndExtra: 0,
                hInstance: hinstance,
                hIcon: ptr::null_mut(),
                hCursor: ptr::null_mut(),
                hbrBackground: ptr::null_mut(),
                lpszMenuName: ptr::null(),
                lpszClassName: class_name.as_ptr(),
                hIconSm: ptr::null_mut(),
            };

            if RegisterClassExW(&class) == 0 {
                let err = GetLastError();
                if err != ERROR_CLASS_ALREADY_EXISTS {
                    return Err(BridgeFault::PumpRegistration(format!(
                        "RegisterClassExW failed with error {err}"
                    )));
                }
                debug!(class = CLASS_NAME, "Window class already registered");
            }

            // No WS_VISIBLE: the window is never shown.
            let hwnd = CreateWindowExW(
                0,
                class_name.as_ptr(),
                title.as_ptr(),
                0,
                0,
                0,
                0,
                0,
                ptr::null_mut(),
                ptr::null_mut(),
                hinstance,
                ptr::null_mut(),
            );

            if hwnd.is_null() {
                return Err(BridgeFault::PumpWindow(format!(
                    "CreateWindowExW failed with error {}",
                    GetLastError()
                )));
            }

            Ok(Self { hwnd })
        }
    }

    pub(super) fn drain_once(&self) -> usize {
        let mut handled = 0;
        // SAFETY: msg is a plain C struct; a null hwnd drains every message
        // queued for this thread.
        unsafe {
            let mut msg: MSG = mem::zeroed();
            while PeekMessageW(&mut msg, ptr::null_mut(), 0, 0, PM_REMOVE) != 0 {
                TranslateMessage(&msg);
                DispatchMessageW(&msg);
                handled += 1;
            }
        }
        handled
    }

    pub(super) fn handles(&self) -> PumpHandles {
        PumpHandles {
            parent: self.hwnd as usize,
            message: 0,
        }
    }
}

impl Drop for PlatformPump {
    fn drop(&mut self) {
        // SAFETY: hwnd was created on this thread and is destroyed once.
        if unsafe { DestroyWindow(self.hwnd) } == 0 {
            warn!("Failed to destroy message pump window");
        }
    }
}
