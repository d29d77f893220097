//! Per-tick readings and their reduction to one row.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat};

use crate::channels::Channel;
use crate::hardware::{ChannelId, ReadFailure, ReadFailureKind};
use crate::scheduler::precision::PrecisionTable;
use crate::scheduler::SchedulingFault;

/// One `Device_Value` call. A failed read is kept as `Err` so the batch
/// length stays equal to the oversample count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SampleReading {
    /// Gauge that was read.
    pub channel: ChannelId,
    /// The value, or why it is absent.
    pub value: Result<f64, ReadFailure>,
}

impl SampleReading {
    /// True when the read failed.
    pub fn is_absent(&self) -> bool {
        self.value.is_err()
    }
}

/// Reduced value of one channel for one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelValue {
    /// Mean of the successful readings.
    Measured {
        /// Arithmetic mean.
        mean: f64,
        /// max - min of the successful readings.
        spread: f64,
        /// Digits chosen from the spread.
        decimals: usize,
    },
    /// Every reading failed, at least one for a reason other than range.
    Error {
        /// Number of failed readings.
        failures: usize,
    },
    /// Every reading failed with the out-of-range status.
    OutOfRange,
}

impl ChannelValue {
    /// Reduce one channel's readings.
    pub fn reduce(readings: &[SampleReading], precision: &PrecisionTable) -> Self {
        let values: Vec<f64> = readings.iter().filter_map(|r| r.value.ok()).collect();

        if values.is_empty() {
            let all_out_of_range = !readings.is_empty()
                && readings.iter().all(|r| {
                    matches!(&r.value, Err(failure) if failure.kind() == ReadFailureKind::OutOfRange)
                });
            return if all_out_of_range {
                Self::OutOfRange
            } else {
                Self::Error {
                    failures: readings.len(),
                }
            };
        }

        let (min, max, sum) = values.iter().fold(
            (f64::INFINITY, f64::NEG_INFINITY, 0.0),
            |(min, max, sum), &v| (min.min(v), max.max(v), sum + v),
        );
        let spread = max - min;
        Self::Measured {
            mean: sum / values.len() as f64,
            spread,
            decimals: precision.decimals_for(spread),
        }
    }

    /// True for a numeric value.
    pub fn is_measured(&self) -> bool {
        matches!(self, Self::Measured { .. })
    }

    /// The value as written to sinks.
    pub fn formatted(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ChannelValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measured { mean, decimals, .. } => write!(f, "{mean:.decimals$}"),
            Self::Error { .. } => f.write_str("error"),
            Self::OutOfRange => f.write_str("out-of-range"),
        }
    }
}

/// Everything read during one tick, grouped by channel in configured order.
#[derive(Debug, Clone)]
pub struct SampleBatch {
    tick: u64,
    timestamp: DateTime<Local>,
    offset: Duration,
    channels: Vec<(Channel, Vec<SampleReading>)>,
}

impl SampleBatch {
    /// Empty batch for the given channels.
    pub fn new(tick: u64, timestamp: DateTime<Local>, offset: Duration, channels: &[Channel]) -> Self {
        Self {
            tick,
            timestamp,
            offset,
            channels: channels
                .iter()
                .map(|c| (c.clone(), Vec::new()))
                .collect(),
        }
    }

    /// Tick index.
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Record a reading.
    ///
    /// # Errors
    ///
    /// [`SchedulingFault::UnknownChannel`] if the channel is not part of the batch.
    pub fn push(&mut self, reading: SampleReading) -> Result<(), SchedulingFault> {
        let slot = self
            .channels
            .iter_mut()
            .find(|(c, _)| c.id == reading.channel)
            .ok_or(SchedulingFault::UnknownChannel(reading.channel))?;
        slot.1.push(reading);
        Ok(())
    }

    /// Readings recorded for a channel.
    pub fn readings(&self, channel: ChannelId) -> Option<&[SampleReading]> {
        self.channels
            .iter()
            .find(|(c, _)| c.id == channel)
            .map(|(_, r)| r.as_slice())
    }

    /// Check every channel holds exactly `oversample` readings.
    ///
    /// # Errors
    ///
    /// [`SchedulingFault::IncompleteBatch`] naming the first short channel.
    pub fn check_complete(&self, oversample: usize) -> Result<(), SchedulingFault> {
        for (channel, readings) in &self.channels {
            if readings.len() != oversample {
                return Err(SchedulingFault::IncompleteBatch {
                    tick: self.tick,
                    channel: channel.id,
                    expected: oversample,
                    got: readings.len(),
                });
            }
        }
        Ok(())
    }

    /// Reduce to one row.
    pub fn reduce(&self, read_duration: Duration, precision: &PrecisionTable) -> SampleRow {
        SampleRow {
            tick: self.tick,
            timestamp: self.timestamp,
            offset: self.offset,
            read_duration,
            values: self
                .channels
                .iter()
                .map(|(channel, readings)| {
                    (channel.clone(), ChannelValue::reduce(readings, precision))
                })
                .collect(),
        }
    }
}

/// One emitted row.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    /// Tick index, starting at 0.
    pub tick: u64,
    /// Wall-clock time at tick start.
    pub timestamp: DateTime<Local>,
    /// Tick start relative to run start on the monotonic clock.
    pub offset: Duration,
    /// Time spent reading.
    pub read_duration: Duration,
    /// Reduced values in configured channel order.
    pub values: Vec<(Channel, ChannelValue)>,
}

impl SampleRow {
    /// ISO-8601 local timestamp with offset and microseconds.
    pub fn timestamp_iso(&self) -> String {
        self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, false)
    }

    /// Values as written to sinks.
    pub fn formatted_values(&self) -> Vec<String> {
        self.values.iter().map(|(_, v)| v.formatted()).collect()
    }

    /// Value for a channel id.
    pub fn value(&self, channel: ChannelId) -> Option<&ChannelValue> {
        self.values
            .iter()
            .find(|(c, _)| c.id == channel)
            .map(|(_, v)| v)
    }
}
