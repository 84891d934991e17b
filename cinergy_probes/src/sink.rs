use std::{
    fmt::Display,
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::{round_to, SinkError};

pub const CSV_HEADER: &str = "timestamp,domain,measure";
const WRITER_BUFFER_CAPACITY: usize = 8192;

/// The value of a metric.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Number(f64),
    /// Contextual tags, such as the phase label.
    Text(String),
}

impl Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Number(n) => write!(f, "{n}"),
            MetricValue::Text(t) => f.write_str(t),
        }
    }
}

impl From<f64> for MetricValue {
    fn from(value: f64) -> Self {
        MetricValue::Number(value)
    }
}

impl From<u32> for MetricValue {
    fn from(value: u32) -> Self {
        MetricValue::Number(value.into())
    }
}

impl From<&str> for MetricValue {
    fn from(value: &str) -> Self {
        MetricValue::Text(value.to_owned())
    }
}

impl From<String> for MetricValue {
    fn from(value: String) -> Self {
        MetricValue::Text(value)
    }
}

/// All the metrics of one tick, in insertion order.
///
/// Numbers are rounded to `precision` decimal digits when they are pushed.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub timestamp_ns: i64,
    precision: u32,
    metrics: Vec<(String, MetricValue)>,
}

impl Sample {
    pub fn new(timestamp_ns: i64, precision: u32) -> Sample {
        Sample {
            timestamp_ns,
            precision,
            metrics: Vec::new(),
        }
    }

    pub fn number<S: Into<String>>(&mut self, name: S, value: f64) {
        let rounded = round_to(value, self.precision);
        self.metrics.push((name.into(), MetricValue::Number(rounded)));
    }

    pub fn push<S: Into<String>, V: Into<MetricValue>>(&mut self, name: S, value: V) {
        self.metrics.push((name.into(), value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// Shortcut for numeric metrics.
    pub fn get_number(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            MetricValue::Number(n) => Some(*n),
            MetricValue::Text(_) => None,
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetricValue)> {
        self.metrics.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }
}

/// Receives the samples, tick after tick.
pub trait MetricSink: Send {
    /// Starts a new time series called `label`, replacing any previous one.
    fn open(&mut self, label: &str) -> Result<(), SinkError>;

    /// Appends one sample. `relative_secs` is the time since the series was opened.
    fn write(&mut self, relative_secs: i64, sample: &Sample) -> Result<(), SinkError>;

    fn close(&mut self) -> Result<(), SinkError>;
}

/// Writes `<prefix>-<label>.csv` files, one record per line.
pub struct CsvSink {
    dir: PathBuf,
    prefix: String,
    current: Option<(PathBuf, BufWriter<File>)>,
}

impl CsvSink {
    pub fn new<P: AsRef<Path>, S: Into<String>>(dir: P, prefix: S) -> CsvSink {
        CsvSink {
            dir: dir.as_ref().to_path_buf(),
            prefix: prefix.into(),
            current: None,
        }
    }

    pub fn path_of(&self, label: &str) -> PathBuf {
        self.dir.join(format!("{}-{label}.csv", self.prefix))
    }
}

impl MetricSink for CsvSink {
    fn open(&mut self, label: &str) -> Result<(), SinkError> {
        self.close()?;
        let path = self.path_of(label);
        let io_err = |source| SinkError::Io {
            path: path.clone(),
            source,
        };
        let file = File::create(&path).map_err(io_err)?;
        let mut writer = BufWriter::with_capacity(WRITER_BUFFER_CAPACITY, file);
        writeln!(writer, "{CSV_HEADER}").and_then(|_| writer.flush()).map_err(io_err)?;
        self.current = Some((path, writer));
        Ok(())
    }

    fn write(&mut self, relative_secs: i64, sample: &Sample) -> Result<(), SinkError> {
        let (path, writer) = self.current.as_mut().ok_or(SinkError::NotOpen)?;
        let mut write_all = || -> std::io::Result<()> {
            for (name, value) in sample.iter() {
                writeln!(writer, "{relative_secs},{name},{value}")?;
            }
            // each tick must reach the file, a gap in the series can't be tolerated
            writer.flush()
        };
        write_all().map_err(|source| SinkError::Io {
            path: path.clone(),
            source,
        })
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if let Some((path, mut writer)) = self.current.take() {
            writer.flush().map_err(|source| SinkError::Io { path, source })?;
        }
        Ok(())
    }
}

/// Lines of the live display: the power of each domain, next to its cpu usage when there is one.
///
/// Empty when the sample has no power.
pub fn live_lines(sample: &Sample) -> Vec<String> {
    let watts: Vec<(&str, String)> = sample
        .iter()
        .filter_map(|(name, value)| name.strip_suffix("-watt").map(|domain| (domain, value.to_string())))
        .collect();
    if watts.is_empty() {
        return Vec::new();
    }
    let name_width = watts.iter().map(|(d, _)| d.len()).max().unwrap_or(0);
    let value_width = watts.iter().map(|(_, v)| v.len()).max().unwrap_or(0);

    let mut lines: Vec<String> = watts
        .iter()
        .map(|(domain, watt)| {
            let mut line = format!("{domain:<name_width$} {watt:<value_width$} W");
            if let Some(usage) = sample.get(&format!("cpu%_{domain}")) {
                line.push_str(&format!(" - {usage}%"));
            }
            line
        })
        .collect();
    lines.push("---".to_owned());
    lines
}

/// Prints every sample to `out` before passing it to the inner sink.
pub struct LiveSink<S, W> {
    inner: S,
    out: W,
}

impl<S: MetricSink, W: Write + Send> LiveSink<S, W> {
    pub fn new(inner: S, out: W) -> LiveSink<S, W> {
        LiveSink { inner, out }
    }

    pub fn into_parts(self) -> (S, W) {
        (self.inner, self.out)
    }
}

impl<S: MetricSink, W: Write + Send> MetricSink for LiveSink<S, W> {
    fn open(&mut self, label: &str) -> Result<(), SinkError> {
        self.inner.open(label)
    }

    fn write(&mut self, relative_secs: i64, sample: &Sample) -> Result<(), SinkError> {
        let mut print = || -> std::io::Result<()> {
            for line in live_lines(sample) {
                writeln!(self.out, "{line}")?;
            }
            self.out.flush()
        };
        // the display is a convenience, only the time series must not miss a tick
        if let Err(e) = print() {
            log::warn!("live display failed: {e}");
        }
        self.inner.write(relative_secs, sample)
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.inner.close()
    }
}

/// One line of a time series.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub label: String,
    pub relative_secs: i64,
    pub name: String,
    pub value: MetricValue,
}

/// Keeps the records in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<Record>>>,
    label: Option<String>,
}

impl MemorySink {
    pub fn new() -> MemorySink {
        MemorySink::default()
    }

    pub fn records(&self) -> Vec<Record> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl MetricSink for MemorySink {
    fn open(&mut self, label: &str) -> Result<(), SinkError> {
        if let Ok(mut records) = self.records.lock() {
            records.retain(|r| r.label != label);
        }
        self.label = Some(label.to_owned());
        Ok(())
    }

    fn write(&mut self, relative_secs: i64, sample: &Sample) -> Result<(), SinkError> {
        let label = self.label.as_ref().ok_or(SinkError::NotOpen)?;
        let mut records = self.records.lock().map_err(|_| SinkError::NotOpen)?;
        records.extend(sample.iter().map(|(name, value)| Record {
            label: label.clone(),
            relative_secs,
            name: name.to_owned(),
            value: value.clone(),
        }));
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.label = None;
        Ok(())
    }
}
