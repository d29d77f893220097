//! Message Pump
//!
//! `Device_Init` may create windows and wait on messages delivered to the
//! thread that owns them. If nobody services that thread's queue, the call
//! never returns. The pump owns a hidden window on the waiting thread and
//! drains its queue on demand while the [`crate::bridge`] waits.
//!
//! On Windows this is a real Win32 window; elsewhere the pump is a no-op with
//! the same API so the bridge algorithm does not change.
//!
//! A pump is tied to the thread that created it and is deliberately `!Send`.
//!
//! A pump whose window was handed to a `Device_Init` call that never returned
//! is [detached](MessagePump::detach): the window stays alive until the
//! creating thread exits, since the abandoned call may still use it as a
//! parent.

use std::cell::RefCell;
use std::marker::PhantomData;

use tracing::debug;

use crate::bridge::BridgeFault;

#[cfg(not(windows))]
mod noop;
#[cfg(windows)]
mod windows;

#[cfg(not(windows))]
use noop::PlatformPump;
#[cfg(windows)]
use windows::PlatformPump;

thread_local! {
    static DETACHED: RefCell<Vec<PlatformPump>> = const { RefCell::new(Vec::new()) };
}

/// Raw handles passed to `Device_Init`, as integers so they can cross threads.
///
/// `parent` is the pump window (or 0 without a native pump); `message` is
/// always 0, the driver ignores it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpHandles {
    /// Parent window handle.
    pub parent: usize,
    /// Message window handle.
    pub message: usize,
}

/// Hidden message surface drained on the creating thread.
pub struct MessagePump {
    inner: PlatformPump,
    _not_send: PhantomData<*const ()>,
}

impl MessagePump {
    /// Create the surface on the current thread.
    ///
    /// # Errors
    ///
    /// Fails with a [`BridgeFault`] if the window class cannot be registered
    /// (for any reason other than it already existing in this process) or the
    /// window cannot be created.
    pub fn create() -> Result<Self, BridgeFault> {
        Ok(Self {
            inner: PlatformPump::create()?,
            _not_send: PhantomData,
        })
    }

    /// Dispatch every queued message without blocking. Returns how many were handled.
    pub fn drain_once(&self) -> usize {
        self.inner.drain_once()
    }

    /// Handles to hand to the native init call.
    pub fn handles(&self) -> PumpHandles {
        self.inner.handles()
    }

    /// Keep the surface alive for the rest of this thread's life instead of
    /// destroying it now.
    pub fn detach(self) {
        let handles = self.handles();
        DETACHED.with(|detached| detached.borrow_mut().push(self.inner));
        debug!(parent = handles.parent, "Message pump window retained for a detached init call");
    }

    /// Number of pumps detached on the current thread.
    pub fn detached_on_this_thread() -> usize {
        DETACHED.with(|detached| detached.borrow().len())
    }

    /// True when this platform has a real message queue to service.
    pub fn is_native() -> bool {
        cfg!(windows)
    }
}

impl std::fmt::Debug for MessagePump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePump")
            .field("handles", &self.handles())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_with_empty_queue() {
        let pump = MessagePump::create().unwrap();
        // Nothing queued: returns immediately, not an error.
        let start = std::time::Instant::now();
        pump.drain_once();
        pump.drain_once();
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[test]
    fn test_create_twice_in_one_process() {
        let first = MessagePump::create().unwrap();
        let second = MessagePump::create().unwrap();
        drop(first);
        second.drain_once();
    }

    #[test]
    fn test_detach_keeps_pump_for_thread() {
        let before = MessagePump::detached_on_this_thread();
        MessagePump::create().unwrap().detach();
        assert_eq!(MessagePump::detached_on_this_thread(), before + 1);

        // Other threads have their own list.
        let other = std::thread::spawn(MessagePump::detached_on_this_thread)
            .join()
            .unwrap();
        assert_eq!(other, 0);
    }

    #[cfg(not(windows))]
    #[test]
    fn test_noop_handles_are_null() {
        let pump = MessagePump::create().unwrap();
        assert_eq!(pump.handles(), PumpHandles::default());
        assert_eq!(pump.drain_once(), 0);
        assert!(!MessagePump::is_native());
    }
}
