//! Row sinks.
//!
//! A [`Sink`] receives the channel labels once, then every [`SampleRow`] in
//! tick order, then `finish`. The scheduler treats any sink error as fatal.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::scheduler::SampleRow;

/// Failure writing rows.
#[derive(Error, Debug)]
pub enum SinkError {
    /// File or stream error.
    #[error("sink I/O error: {0}")]
    Io(#[from] io::Error),
    /// CSV encoding error.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    /// `emit` before `begin`.
    #[error("sink '{0}' received a row before its header")]
    NotStarted(&'static str),
}

/// Destination for finished rows.
pub trait Sink: Send {
    /// Called once with the channel labels in column order.
    fn begin(&mut self, labels: &[String]) -> Result<(), SinkError>;
    /// Called once per tick, in tick order.
    fn emit(&mut self, row: &SampleRow) -> Result<(), SinkError>;
    /// Called once when the run ends, on every exit path.
    fn finish(&mut self) -> Result<(), SinkError>;
}

/// Timestamp used in output file names, e.g. `2024-05-01T14-03-22`.
pub fn run_stamp(at: DateTime<Local>) -> String {
    at.format("%Y-%m-%dT%H-%M-%S").to_string()
}

/// Writes `measurement_<stamp>.csv`, flushing after every row.
///
/// The file is opened by `begin`, so a run that never starts sampling leaves
/// nothing behind.
pub struct CsvSink {
    path: PathBuf,
    writer: Option<csv::Writer<File>>,
}

impl CsvSink {
    /// Target `measurement_<stamp>.csv` in `output_dir`, creating the directory if needed.
    pub fn create(output_dir: &Path, stamp: &str) -> Result<Self, SinkError> {
        fs::create_dir_all(output_dir)?;
        Ok(Self::at_path(output_dir.join(format!("measurement_{stamp}.csv"))))
    }

    /// Target an explicit path; it is created (truncated) on `begin`.
    pub fn at_path(path: PathBuf) -> Self {
        Self { path, writer: None }
    }

    /// Output file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for CsvSink {
    fn begin(&mut self, labels: &[String]) -> Result<(), SinkError> {
        let file = File::create(&self.path)?;
        info!(path = %self.path.display(), "CSV output file created");
        let mut writer = csv::Writer::from_writer(file);

        let mut header = Vec::with_capacity(labels.len() + 1);
        header.push("Timestamp");
        header.extend(labels.iter().map(String::as_str));
        writer.write_record(&header)?;
        writer.flush()?;
        self.writer = Some(writer);
        Ok(())
    }

    fn emit(&mut self, row: &SampleRow) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::NotStarted("csv"))?;
        let mut record = Vec::with_capacity(row.values.len() + 1);
        record.push(row.timestamp_iso());
        record.extend(row.formatted_values());
        writer.write_record(&record)?;
        writer.flush()?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// Prints `timestamp | value | value ...` per row.
pub struct ConsoleSink<W: Write + Send = io::Stdout> {
    out: W,
}

impl ConsoleSink {
    /// Console sink on stdout.
    pub fn stdout() -> Self {
        Self { out: io::stdout() }
    }
}

impl<W: Write + Send> ConsoleSink<W> {
    /// Console sink on an arbitrary writer.
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Give back the writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write + Send> Sink for ConsoleSink<W> {
    fn begin(&mut self, labels: &[String]) -> Result<(), SinkError> {
        writeln!(self.out, "Timestamp | {}", labels.join(" | "))?;
        Ok(())
    }

    fn emit(&mut self, row: &SampleRow) -> Result<(), SinkError> {
        let mut fields = vec![row.timestamp_iso()];
        fields.extend(row.formatted_values());
        writeln!(self.out, "{}", fields.join(" | "))?;
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.out.flush()?;
        Ok(())
    }
}

/// Everything a [`MemorySink`] received.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecord {
    /// Labels from `begin`.
    pub labels: Vec<String>,
    /// Rows in emission order.
    pub rows: Vec<SampleRow>,
    /// Whether `finish` ran.
    pub finished: bool,
}

/// Keeps rows in memory. Clones share the same record.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemoryRecord>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of what was received.
    pub fn record(&self) -> MemoryRecord {
        self.inner.lock().clone()
    }
}

impl Sink for MemorySink {
    fn begin(&mut self, labels: &[String]) -> Result<(), SinkError> {
        self.inner.lock().labels = labels.to_vec();
        Ok(())
    }

    fn emit(&mut self, row: &SampleRow) -> Result<(), SinkError> {
        self.inner.lock().rows.push(row.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        self.inner.lock().finished = true;
        Ok(())
    }
}

/// Forwards to several sinks in order; the first error wins.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn Sink>>,
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink").field("sinks", &self.sinks.len()).finish()
    }
}

impl FanoutSink {
    /// Empty fan-out.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink.
    pub fn with(mut self, sink: Box<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of sinks.
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// True without sinks.
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Sink for FanoutSink {
    fn begin(&mut self, labels: &[String]) -> Result<(), SinkError> {
        self.sinks.iter_mut().try_for_each(|s| s.begin(labels))
    }

    fn emit(&mut self, row: &SampleRow) -> Result<(), SinkError> {
        self.sinks.iter_mut().try_for_each(|s| s.emit(row))
    }

    fn finish(&mut self) -> Result<(), SinkError> {
        // Every sink gets to flush even if an earlier one fails.
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finish() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::Channel;
    use crate::scheduler::ChannelValue;
    use chrono::TimeZone;
    use std::time::Duration;

    fn row(tick: u64) -> SampleRow {
        SampleRow {
            tick,
            timestamp: Local.with_ymd_and_hms(2024, 5, 1, 14, 3, 22).unwrap(),
            offset: Duration::from_secs(tick),
            read_duration: Duration::from_millis(10),
            values: vec![
                (
                    Channel::new(1),
                    ChannelValue::Measured {
                        mean: 0.5,
                        spread: 0.0,
                        decimals: 4,
                    },
                ),
                (Channel::new(2), ChannelValue::Error { failures: 3 }),
            ],
        }
    }

    fn labels() -> Vec<String> {
        vec!["Z direction 1".into(), "Z direction 2".into()]
    }

    #[test]
    fn test_run_stamp() {
        let at = Local.with_ymd_and_hms(2024, 5, 1, 14, 3, 22).unwrap();
        assert_eq!(run_stamp(at), "2024-05-01T14-03-22");
    }

    #[test]
    fn test_csv_sink_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested");
        let mut sink = CsvSink::create(&out, "2024-05-01T14-03-22").unwrap();
        assert!(sink.path().ends_with("measurement_2024-05-01T14-03-22.csv"));

        sink.begin(&labels()).unwrap();
        sink.emit(&row(0)).unwrap();
        sink.emit(&row(1)).unwrap();

        // Rows are flushed as they are written.
        let text = std::fs::read_to_string(sink.path()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Timestamp,Z direction 1,Z direction 2");
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("2024-05-01T14:03:22.000000"));
        assert!(lines[1].ends_with(",0.5000,error"));
        sink.finish().unwrap();
    }

    #[test]
    fn test_csv_emit_before_begin() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path(), "x").unwrap();
        assert!(matches!(sink.emit(&row(0)), Err(SinkError::NotStarted("csv"))));
    }

    #[test]
    fn test_csv_file_created_on_begin() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvSink::create(dir.path(), "x").unwrap();
        assert!(!sink.path().exists());

        // A run that ends before sampling leaves nothing behind.
        sink.finish().unwrap();
        assert!(!sink.path().exists());

        sink.begin(&labels()).unwrap();
        assert!(sink.path().exists());
    }

    #[test]
    fn test_csv_create_rejects_file_as_directory() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, b"").unwrap();
        assert!(matches!(
            CsvSink::create(&blocker, "x"),
            Err(SinkError::Io(_))
        ));
    }

    #[test]
    fn test_console_sink_format() {
        let mut sink = ConsoleSink::new(Vec::new());
        sink.begin(&labels()).unwrap();
        sink.emit(&row(0)).unwrap();
        sink.finish().unwrap();
        let text = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Timestamp | Z direction 1 | Z direction 2");
        assert!(lines[1].ends_with(" | 0.5000 | error"));
    }

    #[test]
    fn test_fanout_forwards_to_all() {
        let a = MemorySink::new();
        let b = MemorySink::new();
        let mut fan = FanoutSink::new()
            .with(Box::new(a.clone()))
            .with(Box::new(b.clone()));
        assert_eq!(fan.len(), 2);

        fan.begin(&labels()).unwrap();
        fan.emit(&row(0)).unwrap();
        fan.finish().unwrap();

        for sink in [a, b] {
            let record = sink.record();
            assert_eq!(record.labels, labels());
            assert_eq!(record.rows.len(), 1);
            assert!(record.finished);
        }
    }
}
