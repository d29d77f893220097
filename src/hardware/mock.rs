//! Mock Gauge Driver
//!
//! Simulated driver for tests and `--simulate` runs. Behaves like the vendor
//! DLL where it matters to callers:
//!
//! - `init` returns the "already initialized" sentinel when called twice
//! - `deinit` returns the "not initialized" sentinel when nothing is open
//! - reads block for a configurable latency
//!
//! On top of that every behaviour is scriptable per channel, and call counters
//! let tests assert how the driver was used (including that no two reads were
//! ever in flight at once).
//!
//! # Example
//!
//! ```rust
//! use ibr_daq::hardware::{MockDevice, ReadingScript, NativeDevice};
//!
//! let device = MockDevice::new()
//!     .with_channel(1, ReadingScript::Constant(2.5))
//!     .with_channel(2, ReadingScript::Status(136));
//! let (status, value) = device.get_value(1, 1);
//! assert!(status.is_ok());
//! assert_eq!(value, 2.5);
//! ```

use std::collections::HashMap;
use std::ffi::CStr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::hardware::{ChannelId, ModuleId, NativeDevice, StatusCode};
use crate::pump::PumpHandles;

/// How the mock responds to `init`.
#[derive(Debug, Clone, PartialEq)]
pub enum InitBehavior {
    /// Return this status immediately (0 = success).
    Status(i16),
    /// Block for the given time, then return the status.
    Delay(Duration, i16),
    /// Never return until [`MockDevice::release_hang`] is called, then return 0.
    Hang,
    /// Panic inside the driver call.
    Panic(String),
}

/// How the mock responds to reads of one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ReadingScript {
    /// Always this value.
    Constant(f64),
    /// Cycle through these values, one per read.
    Sequence(Vec<f64>),
    /// Always fail with this status.
    Status(i16),
    /// Cycle through these results; `Err(status)` entries fail.
    Mixed(Vec<Result<f64, i16>>),
    /// `base` plus uniform noise in `[-amplitude, amplitude]`.
    Noisy {
        /// Centre value.
        base: f64,
        /// Half-width of the noise band.
        amplitude: f64,
    },
    /// `start + step * n` for the n-th read of the channel.
    Ramp {
        /// First value.
        start: f64,
        /// Increment per read.
        step: f64,
    },
}

/// Scriptable stand-in for the vendor driver.
pub struct MockDevice {
    init_behavior: Mutex<InitBehavior>,
    scripts: Mutex<HashMap<ChannelId, ReadingScript>>,
    cursors: Mutex<HashMap<ChannelId, usize>>,
    rng: Mutex<StdRng>,
    read_latency: Duration,
    deinit_status: i16,
    version: (i16, i16),
    initialized: AtomicBool,
    hang_released: AtomicBool,
    init_calls: AtomicU64,
    read_calls: AtomicU64,
    deinit_calls: AtomicU64,
    reads_in_flight: AtomicUsize,
    max_reads_in_flight: AtomicUsize,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    /// Mock that initializes successfully and reads 0.0 on unscripted channels.
    pub fn new() -> Self {
        Self {
            init_behavior: Mutex::new(InitBehavior::Status(0)),
            scripts: Mutex::new(HashMap::new()),
            cursors: Mutex::new(HashMap::new()),
            rng: Mutex::new(StdRng::seed_from_u64(0x1b2d_d4c0)),
            read_latency: Duration::ZERO,
            deinit_status: 0,
            version: (2, 4),
            initialized: AtomicBool::new(false),
            hang_released: AtomicBool::new(false),
            init_calls: AtomicU64::new(0),
            read_calls: AtomicU64::new(0),
            deinit_calls: AtomicU64::new(0),
            reads_in_flight: AtomicUsize::new(0),
            max_reads_in_flight: AtomicUsize::new(0),
        }
    }

    /// Mock used by `--simulate`: each channel drifts slowly with a little noise.
    pub fn simulated(channels: &[ChannelId]) -> Self {
        let mut device = Self::new()
            .with_read_latency(Duration::from_millis(20))
            .with_seed(rand::random());
        for &channel in channels {
            device = device.with_channel(
                channel,
                ReadingScript::Noisy {
                    base: f64::from(channel) * 0.5,
                    amplitude: 5e-5,
                },
            );
        }
        device
    }

    /// Set the `init` behaviour.
    pub fn with_init(self, behavior: InitBehavior) -> Self {
        *self.init_behavior.lock() = behavior;
        self
    }

    /// Script a channel.
    pub fn with_channel(self, channel: ChannelId, script: ReadingScript) -> Self {
        self.scripts.lock().insert(channel, script);
        self
    }

    /// Block every read for `latency`.
    pub fn with_read_latency(mut self, latency: Duration) -> Self {
        self.read_latency = latency;
        self
    }

    /// Status returned by `deinit` when the mock is initialized.
    pub fn with_deinit_status(mut self, status: i16) -> Self {
        self.deinit_status = status;
        self
    }

    /// Reseed the noise generator.
    pub fn with_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    /// Let a [`InitBehavior::Hang`] call return.
    pub fn release_hang(&self) {
        self.hang_released.store(true, Ordering::Release);
    }

    /// Whether the simulated driver context is open.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Number of `init` calls.
    pub fn init_calls(&self) -> u64 {
        self.init_calls.load(Ordering::Relaxed)
    }

    /// Number of `get_value` calls.
    pub fn read_calls(&self) -> u64 {
        self.read_calls.load(Ordering::Relaxed)
    }

    /// Number of `deinit` calls.
    pub fn deinit_calls(&self) -> u64 {
        self.deinit_calls.load(Ordering::Relaxed)
    }

    /// Highest number of reads observed in flight at once.
    pub fn max_reads_in_flight(&self) -> usize {
        self.max_reads_in_flight.load(Ordering::Relaxed)
    }

    fn next_reading(&self, channel: ChannelId) -> Result<f64, i16> {
        let scripts = self.scripts.lock();
        let Some(script) = scripts.get(&channel) else {
            return Ok(0.0);
        };

        let mut cursors = self.cursors.lock();
        let cursor = cursors.entry(channel).or_insert(0);
        let n = *cursor;
        *cursor += 1;

        match script {
            ReadingScript::Constant(v) => Ok(*v),
            ReadingScript::Sequence(values) if values.is_empty() => Ok(0.0),
            ReadingScript::Sequence(values) => Ok(values[n % values.len()]),
            ReadingScript::Status(status) => Err(*status),
            ReadingScript::Mixed(results) if results.is_empty() => Ok(0.0),
            ReadingScript::Mixed(results) => results[n % results.len()],
            ReadingScript::Noisy { base, amplitude } => {
                let noise = if *amplitude > 0.0 {
                    self.rng.lock().gen_range(-*amplitude..=*amplitude)
                } else {
                    0.0
                };
                Ok(base + noise)
            }
            ReadingScript::Ramp { start, step } => Ok(start + step * n as f64),
        }
    }
}

impl NativeDevice for MockDevice {
    #[allow(clippy::panic)]
    fn init(&self, _language: i16, setup_path: &CStr, _handles: PumpHandles) -> StatusCode {
        self.init_calls.fetch_add(1, Ordering::Relaxed);
        debug!(setup = ?setup_path, "Mock Device_Init");

        if self.initialized.load(Ordering::Acquire) {
            return StatusCode::ALREADY_INITIALIZED;
        }

        let behavior = self.init_behavior.lock().clone();
        let status = match behavior {
            InitBehavior::Status(code) => code,
            InitBehavior::Delay(delay, code) => {
                std::thread::sleep(delay);
                code
            }
            InitBehavior::Hang => {
                while !self.hang_released.load(Ordering::Acquire) {
                    std::thread::sleep(Duration::from_millis(20));
                }
                0
            }
            InitBehavior::Panic(message) => panic!("{message}"),
        };

        if status == 0 {
            self.initialized.store(true, Ordering::Release);
        }
        StatusCode(status)
    }

    fn get_value(&self, _module: ModuleId, channel: ChannelId) -> (StatusCode, f64) {
        self.read_calls.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.reads_in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_reads_in_flight
            .fetch_max(in_flight, Ordering::AcqRel);

        if !self.read_latency.is_zero() {
            std::thread::sleep(self.read_latency);
        }

        // Like the real driver, a read without an open context still "works"
        // and returns whatever the script says.
        let result = match self.next_reading(channel) {
            Ok(value) => (StatusCode::OK, value),
            Err(status) => (StatusCode(status), 0.0),
        };

        self.reads_in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    fn deinit(&self) -> StatusCode {
        self.deinit_calls.fetch_add(1, Ordering::Relaxed);
        if self.initialized.swap(false, Ordering::AcqRel) {
            StatusCode(self.deinit_status)
        } else {
            StatusCode::NOT_INITIALIZED
        }
    }

    fn version(&self) -> (i16, i16) {
        self.version
    }

    fn name(&self) -> &str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn setup() -> CString {
        CString::new("mock.ddk").unwrap()
    }

    #[test]
    fn test_init_twice_returns_sentinel() {
        let device = MockDevice::new();
        assert_eq!(device.init(1, &setup(), PumpHandles::default()), StatusCode::OK);
        assert_eq!(
            device.init(1, &setup(), PumpHandles::default()),
            StatusCode::ALREADY_INITIALIZED
        );
        assert_eq!(device.init_calls(), 2);
    }

    #[test]
    fn test_deinit_without_init() {
        let device = MockDevice::new();
        assert_eq!(device.deinit(), StatusCode::NOT_INITIALIZED);
    }

    #[test]
    fn test_failed_init_leaves_device_closed() {
        let device = MockDevice::new().with_init(InitBehavior::Status(2));
        assert_eq!(device.init(1, &setup(), PumpHandles::default()), StatusCode(2));
        assert!(!device.is_initialized());
    }

    #[test]
    fn test_sequence_cycles() {
        let device = MockDevice::new().with_channel(3, ReadingScript::Sequence(vec![1.0, 2.0]));
        let values: Vec<f64> = (0..4).map(|_| device.get_value(1, 3).1).collect();
        assert_eq!(values, vec![1.0, 2.0, 1.0, 2.0]);
    }

    #[test]
    fn test_mixed_script() {
        let device = MockDevice::new().with_channel(1, ReadingScript::Mixed(vec![Ok(1.5), Err(7)]));
        assert_eq!(device.get_value(1, 1), (StatusCode::OK, 1.5));
        assert_eq!(device.get_value(1, 1).0, StatusCode(7));
    }

    #[test]
    fn test_noisy_stays_in_band() {
        let device = MockDevice::new().with_channel(
            2,
            ReadingScript::Noisy {
                base: 10.0,
                amplitude: 0.01,
            },
        );
        for _ in 0..100 {
            let (status, value) = device.get_value(1, 2);
            assert!(status.is_ok());
            assert!((value - 10.0).abs() <= 0.01);
        }
    }

    #[test]
    fn test_ramp_and_counters() {
        let device = MockDevice::new().with_channel(
            1,
            ReadingScript::Ramp {
                start: 1.0,
                step: 0.5,
            },
        );
        assert_eq!(device.get_value(1, 1).1, 1.0);
        assert_eq!(device.get_value(1, 1).1, 1.5);
        assert_eq!(device.read_calls(), 2);
        assert_eq!(device.max_reads_in_flight(), 1);
    }
}
