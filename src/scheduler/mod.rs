//! Sampling Scheduler
//!
//! Produces one [`SampleRow`] per tick at a steady nominal rate. Each tick
//! reads every channel `oversample_count` times, reduces the readings to a
//! mean per channel, and hands the row to a [`Sink`].
//!
//! # Timing
//!
//! Tick `k` is scheduled at `start + k * period`, never at "end of previous
//! tick + period", so read latency does not accumulate into drift. A tick whose
//! reads overrun the period is followed immediately by the next one. If the
//! loop falls more than a full period behind, it re-anchors on the current
//! time instead of bursting to catch up.
//!
//! # Cancellation
//!
//! The [`CancelToken`] is checked before each tick, between oversample rounds
//! and while sleeping. A tick interrupted mid-batch is discarded, so every
//! emitted row is built from a complete batch.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Local;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub mod batch;
pub mod precision;

pub use batch::{ChannelValue, SampleBatch, SampleReading, SampleRow};
pub use precision::{PrecisionStep, PrecisionTable};

use crate::channels::Channel;
use crate::error::DaqError;
use crate::hardware::{ChannelId, ModuleId, ReadFailure, ReadFailureKind};
use crate::session::DeviceSession;
use crate::sink::Sink;

/// Lowest accepted sampling frequency.
pub const MIN_FREQUENCY_HZ: f64 = 0.001;
/// Highest accepted sampling frequency.
pub const MAX_FREQUENCY_HZ: f64 = 100.0;
/// Measured time for one `Device_Value` call on the reference setup.
pub const DEFAULT_MIN_READ_INTERVAL: Duration = Duration::from_millis(130);
/// Upper bound on readings per channel per tick.
pub const DEFAULT_MAX_OVERSAMPLE: usize = 50;

/// Loop-level invariant violations. Fatal to the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchedulingFault {
    /// A batch did not hold `expected` readings for a channel.
    #[error("tick {tick}: channel {channel} has {got} readings, expected {expected}")]
    IncompleteBatch {
        /// Tick index.
        tick: u64,
        /// Short channel.
        channel: ChannelId,
        /// Oversample count.
        expected: usize,
        /// Readings present.
        got: usize,
    },
    /// A reading for a channel that is not in the schedule.
    #[error("reading for unscheduled channel {0}")]
    UnknownChannel(ChannelId),
    /// Tick target time cannot be represented.
    #[error("schedule arithmetic overflowed at tick {tick}")]
    ScheduleOverflow {
        /// Tick index.
        tick: u64,
    },
    /// `run` called on a scheduler that already ran.
    #[error("scheduler cannot run from state {0}")]
    NotIdle(SchedulerState),
}

/// Scheduler lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Not started.
    Idle,
    /// Ticking.
    Running,
    /// Duration or tick limit reached.
    Completed,
    /// Stopped by the cancel token.
    Cancelled,
    /// Stopped by a scheduling or sink fault.
    Faulted,
}

impl fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// Cooperative cancellation flag shared between the scheduler and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// A token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Validated schedule.
#[derive(Debug, Clone)]
pub struct ScheduleConfig {
    frequency_hz: f64,
    duration: Option<Duration>,
    max_ticks: Option<u64>,
    channels: Vec<Channel>,
    module_id: ModuleId,
    min_read_interval: Duration,
    max_oversample_count: usize,
    precision: PrecisionTable,
    cancel_poll_interval: Duration,
}

impl ScheduleConfig {
    /// Start building a schedule.
    pub fn builder() -> ScheduleConfigBuilder {
        ScheduleConfigBuilder::default()
    }

    /// Nominal tick period, `1 / frequency`.
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.frequency_hz)
    }

    /// Readings per channel per tick: as many as fit in the period, capped,
    /// and never fewer than one.
    pub fn oversample_count(&self) -> usize {
        oversample_count(self.period(), self.min_read_interval, self.max_oversample_count)
    }

    /// Sampling frequency in Hz.
    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz
    }

    /// Run length, `None` for unbounded.
    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Tick limit, if any.
    pub fn max_ticks(&self) -> Option<u64> {
        self.max_ticks
    }

    /// Channels in emission order.
    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Module read by every channel.
    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    /// Precision table used for reduction.
    pub fn precision(&self) -> &PrecisionTable {
        &self.precision
    }
}

/// `min(floor(period / min_read_interval), max)`, at least 1.
pub fn oversample_count(period: Duration, min_read_interval: Duration, max: usize) -> usize {
    if min_read_interval.is_zero() {
        return max.max(1);
    }
    let fits = (period.as_secs_f64() / min_read_interval.as_secs_f64()).floor() as usize;
    fits.min(max).max(1)
}

/// Builder for [`ScheduleConfig`].
#[derive(Debug, Clone)]
pub struct ScheduleConfigBuilder {
    frequency_hz: f64,
    duration: Option<Duration>,
    max_ticks: Option<u64>,
    channels: Vec<Channel>,
    module_id: ModuleId,
    min_read_interval: Duration,
    max_oversample_count: usize,
    precision: PrecisionTable,
    cancel_poll_interval: Duration,
}

impl Default for ScheduleConfigBuilder {
    fn default() -> Self {
        Self {
            frequency_hz: 1.0,
            duration: None,
            max_ticks: None,
            channels: Vec::new(),
            module_id: 1,
            min_read_interval: DEFAULT_MIN_READ_INTERVAL,
            max_oversample_count: DEFAULT_MAX_OVERSAMPLE,
            precision: PrecisionTable::default(),
            cancel_poll_interval: Duration::from_millis(100),
        }
    }
}

impl ScheduleConfigBuilder {
    /// Sampling frequency in Hz.
    pub fn frequency_hz(mut self, hz: f64) -> Self {
        self.frequency_hz = hz;
        self
    }

    /// Stop after this long; `None` runs until cancelled.
    pub fn duration(mut self, duration: Option<Duration>) -> Self {
        self.duration = duration;
        self
    }

    /// Stop after this many ticks.
    pub fn max_ticks(mut self, ticks: Option<u64>) -> Self {
        self.max_ticks = ticks;
        self
    }

    /// Channels to read, in emission order.
    pub fn channels(mut self, channels: Vec<Channel>) -> Self {
        self.channels = channels;
        self
    }

    /// Module (device number) to read.
    pub fn module_id(mut self, module: ModuleId) -> Self {
        self.module_id = module;
        self
    }

    /// Shortest time one read can take.
    pub fn min_read_interval(mut self, interval: Duration) -> Self {
        self.min_read_interval = interval;
        self
    }

    /// Oversampling cap.
    pub fn max_oversample_count(mut self, max: usize) -> Self {
        self.max_oversample_count = max;
        self
    }

    /// Precision table.
    pub fn precision(mut self, precision: PrecisionTable) -> Self {
        self.precision = precision;
        self
    }

    /// How often the cancel token is checked while sleeping.
    pub fn cancel_poll_interval(mut self, interval: Duration) -> Self {
        self.cancel_poll_interval = interval;
        self
    }

    /// Validate and build.
    ///
    /// # Errors
    ///
    /// [`DaqError::Configuration`] describing the first invalid field.
    pub fn build(self) -> Result<ScheduleConfig, DaqError> {
        let invalid = |msg: String| Err(DaqError::Configuration(msg));

        if !self.frequency_hz.is_finite()
            || !(MIN_FREQUENCY_HZ..=MAX_FREQUENCY_HZ).contains(&self.frequency_hz)
        {
            return invalid(format!(
                "frequency must be between {MIN_FREQUENCY_HZ} and {MAX_FREQUENCY_HZ} Hz, got {}",
                self.frequency_hz
            ));
        }
        if self.min_read_interval.is_zero() {
            return invalid("minimum read interval must be positive".to_string());
        }
        let period = 1.0 / self.frequency_hz;
        if period < self.min_read_interval.as_secs_f64() {
            return invalid(format!(
                "frequency too high: interval {:.3} s is below the minimum read interval {:.3} s",
                period,
                self.min_read_interval.as_secs_f64()
            ));
        }
        if self.max_oversample_count == 0 {
            return invalid("max oversample count must be at least 1".to_string());
        }
        if self.channels.is_empty() {
            return invalid("at least one channel must be selected".to_string());
        }
        for (i, channel) in self.channels.iter().enumerate() {
            if self.channels[..i].iter().any(|c| c.id == channel.id) {
                return invalid(format!("channel {} selected twice", channel.id));
            }
        }
        if matches!(self.duration, Some(d) if d.is_zero()) {
            return invalid("duration must be positive".to_string());
        }
        if self.cancel_poll_interval.is_zero() {
            return invalid("cancel poll interval must be positive".to_string());
        }

        Ok(ScheduleConfig {
            frequency_hz: self.frequency_hz,
            duration: self.duration,
            max_ticks: self.max_ticks,
            channels: self.channels,
            module_id: self.module_id,
            min_read_interval: self.min_read_interval,
            max_oversample_count: self.max_oversample_count,
            precision: self.precision,
            cancel_poll_interval: self.cancel_poll_interval,
        })
    }
}

/// What a finished run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Rows emitted.
    pub ticks: u64,
    /// Ticks whose reads took longer than the period.
    pub overruns: u64,
    /// Failed reads other than out-of-range.
    pub failed_reads: u64,
    /// Reads that returned the out-of-range status.
    pub out_of_range_reads: u64,
    /// `Completed` or `Cancelled`.
    pub final_state: SchedulerState,
    /// Wall time from first tick to exit.
    pub elapsed: Duration,
}

#[derive(Default)]
struct Counters {
    ticks: u64,
    overruns: u64,
    failed_reads: u64,
    out_of_range_reads: u64,
}

/// Steady-rate oversampling acquisition loop.
#[derive(Debug)]
pub struct SamplingScheduler {
    config: ScheduleConfig,
    state: SchedulerState,
}

impl SamplingScheduler {
    /// Scheduler in `Idle`.
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            state: SchedulerState::Idle,
        }
    }

    /// Current state.
    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// The schedule.
    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Run until the duration or tick limit is reached, or `cancel` fires.
    ///
    /// The sink receives `begin` with the channel labels, one `emit` per tick
    /// and `finish` on every exit path.
    ///
    /// # Errors
    ///
    /// [`DaqError::Scheduling`] for loop faults, [`DaqError::Sink`] if the sink
    /// rejects a row. Both leave the scheduler `Faulted`.
    pub fn run(
        &mut self,
        session: &DeviceSession,
        sink: &mut dyn Sink,
        cancel: &CancelToken,
    ) -> Result<RunSummary, DaqError> {
        if self.state != SchedulerState::Idle {
            return Err(SchedulingFault::NotIdle(self.state).into());
        }
        self.state = SchedulerState::Running;

        let labels: Vec<String> = self.config.channels.iter().map(|c| c.label.clone()).collect();
        if let Err(e) = sink.begin(&labels) {
            self.state = SchedulerState::Faulted;
            return Err(e.into());
        }

        let started = Instant::now();
        let mut counters = Counters::default();
        let result = self.tick_loop(session, sink, cancel, started, &mut counters);

        match result {
            Ok(final_state) => {
                self.state = final_state;
                sink.finish().map_err(|e| {
                    self.state = SchedulerState::Faulted;
                    DaqError::from(e)
                })?;
                let summary = RunSummary {
                    ticks: counters.ticks,
                    overruns: counters.overruns,
                    failed_reads: counters.failed_reads,
                    out_of_range_reads: counters.out_of_range_reads,
                    final_state,
                    elapsed: started.elapsed(),
                };
                info!(
                    phase = "schedule",
                    ticks = summary.ticks,
                    overruns = summary.overruns,
                    failed_reads = summary.failed_reads,
                    out_of_range_reads = summary.out_of_range_reads,
                    state = %final_state,
                    "Sampling finished"
                );
                Ok(summary)
            }
            Err(e) => {
                self.state = SchedulerState::Faulted;
                if let Err(finish_err) = sink.finish() {
                    warn!(error = %finish_err, "Sink finish failed after scheduling fault");
                }
                error!(
                    phase = "schedule",
                    ticks = counters.ticks,
                    error = %e,
                    "Sampling aborted"
                );
                Err(e)
            }
        }
    }

    fn tick_loop(
        &self,
        session: &DeviceSession,
        sink: &mut dyn Sink,
        cancel: &CancelToken,
        started: Instant,
        counters: &mut Counters,
    ) -> Result<SchedulerState, DaqError> {
        let period = self.config.period();
        let oversample = self.config.oversample_count();
        let deadline = match self.config.duration {
            Some(d) => Some(
                started
                    .checked_add(d)
                    .ok_or(SchedulingFault::ScheduleOverflow { tick: 0 })?,
            ),
            None => None,
        };

        info!(
            phase = "schedule",
            oversample,
            period_ms = period.as_secs_f64() * 1000.0,
            "Measurement started with {oversample}x oversampling"
        );

        let mut anchor = started;
        let mut since_anchor: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return Ok(SchedulerState::Cancelled);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(SchedulerState::Completed);
            }
            if self.config.max_ticks.is_some_and(|max| counters.ticks >= max) {
                return Ok(SchedulerState::Completed);
            }

            let tick = counters.ticks;
            let tick_start = Instant::now();
            let mut batch = SampleBatch::new(
                tick,
                Local::now(),
                tick_start.duration_since(started),
                &self.config.channels,
            );

            for round in 0..oversample {
                if round > 0 && cancel.is_cancelled() {
                    debug!(tick, round, "Discarding partial batch on cancellation");
                    return Ok(SchedulerState::Cancelled);
                }
                for channel in &self.config.channels {
                    let reading = self.read(session, channel, counters);
                    batch.push(reading)?;
                }
            }

            let read_duration = tick_start.elapsed();
            batch.check_complete(oversample)?;
            let row = batch.reduce(read_duration, &self.config.precision);
            sink.emit(&row)?;
            counters.ticks += 1;

            if read_duration > period {
                counters.overruns += 1;
                warn!(
                    phase = "schedule",
                    tick,
                    read_ms = read_duration.as_secs_f64() * 1000.0,
                    period_ms = period.as_secs_f64() * 1000.0,
                    "Tick overrun: oversampling took longer than the tick period"
                );
            }

            since_anchor = since_anchor
                .checked_add(1)
                .ok_or(SchedulingFault::ScheduleOverflow { tick })?;
            let next_target = period
                .checked_mul(since_anchor)
                .and_then(|offset| anchor.checked_add(offset))
                .ok_or(SchedulingFault::ScheduleOverflow { tick })?;

            let now = Instant::now();
            if now >= next_target {
                let behind = now.duration_since(next_target);
                if behind > period {
                    warn!(
                        phase = "schedule",
                        tick,
                        behind_ms = behind.as_secs_f64() * 1000.0,
                        "Fell more than one period behind schedule, re-anchoring"
                    );
                    anchor = now;
                    since_anchor = 0;
                }
                continue;
            }

            let wake = match deadline {
                Some(d) if d < next_target => d,
                _ => next_target,
            };
            self.sleep_until(wake, cancel);
        }
    }

    fn read(&self, session: &DeviceSession, channel: &Channel, counters: &mut Counters) -> SampleReading {
        let module = self.config.module_id;
        let (status, value) = session.read_value(module, channel.id);
        if status.is_ok() {
            return SampleReading {
                channel: channel.id,
                value: Ok(value),
            };
        }

        let failure = ReadFailure {
            module,
            channel: channel.id,
            status,
        };
        match failure.kind() {
            ReadFailureKind::OutOfRange => {
                counters.out_of_range_reads += 1;
                warn!(
                    phase = "read",
                    channel = channel.id,
                    label = %channel.label,
                    status = %status,
                    "Gauge out of range"
                );
            }
            ReadFailureKind::Status => {
                counters.failed_reads += 1;
                error!(
                    phase = "read",
                    channel = channel.id,
                    label = %channel.label,
                    module,
                    status = %status,
                    "Gauge read failed"
                );
            }
        }
        SampleReading {
            channel: channel.id,
            value: Err(failure),
        }
    }

    fn sleep_until(&self, target: Instant, cancel: &CancelToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now >= target {
                return;
            }
            thread::sleep((target - now).min(self.config.cancel_poll_interval));
        }
    }
}
