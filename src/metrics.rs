//! Scalar metric logging for training and validation

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Aggregation hints passed along with every logged value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricOptions {
    /// Record the raw value at the current step
    pub on_step: bool,
    /// Contribute to an epoch-level mean
    pub on_epoch: bool,
    /// Ask a distributed backend to reduce the value across devices
    pub sync_dist: bool,
}

impl MetricOptions {
    /// Logged every step and averaged per epoch
    pub const STEP_AND_EPOCH: Self = Self {
        on_step: true,
        on_epoch: true,
        sync_dist: false,
    };

    /// Epoch-level only, reduced across devices
    pub const EPOCH_SYNCED: Self = Self {
        on_step: false,
        on_epoch: true,
        sync_dist: true,
    };
}

/// Receiver of scalar metrics. Values are never read back by the model.
pub trait MetricSink {
    fn log(&mut self, name: &str, value: f32, options: MetricOptions);

    /// Global step that subsequent values belong to
    fn set_step(&mut self, _step: usize) {}

    /// Called once after the last step of an epoch
    fn end_epoch(&mut self, _epoch: usize) {}
}

impl<S: MetricSink + ?Sized> MetricSink for Box<S> {
    fn log(&mut self, name: &str, value: f32, options: MetricOptions) {
        (**self).log(name, value, options);
    }

    fn set_step(&mut self, step: usize) {
        (**self).set_step(step);
    }

    fn end_epoch(&mut self, epoch: usize) {
        (**self).end_epoch(epoch);
    }
}

/// Emits every value as a `debug!` event
#[derive(Debug, Default)]
pub struct TracingSink {
    step: usize,
}

impl TracingSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricSink for TracingSink {
    fn log(&mut self, name: &str, value: f32, _options: MetricOptions) {
        tracing::debug!("step {} | {} = {:.5}", self.step, name, value);
    }

    fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

/// One `step,value` CSV file per metric tag
pub struct CsvSink {
    log_dir: PathBuf,
    step: usize,
}

impl CsvSink {
    pub fn new(log_dir: impl AsRef<Path>) -> Result<Self> {
        let log_dir = log_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&log_dir)?;
        Ok(Self { log_dir, step: 0 })
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// File backing a tag; `/` separators are flattened.
    pub fn path_for(&self, tag: &str) -> PathBuf {
        self.log_dir.join(format!("{}.csv", tag.replace('/', "_")))
    }

    fn append(&self, tag: &str, value: f32) -> Result<()> {
        let path = self.path_for(tag);
        let new_file = !path.exists();
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        if new_file {
            writeln!(file, "step,value")?;
        }
        writeln!(file, "{},{}", self.step, value)?;
        Ok(())
    }
}

impl MetricSink for CsvSink {
    fn log(&mut self, name: &str, value: f32, _options: MetricOptions) {
        if let Err(e) = self.append(name, value) {
            tracing::warn!("Failed to write metric {}: {}", name, e);
        }
    }

    fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

/// A value as it was handed to a [`MemorySink`]
#[derive(Debug, Clone, PartialEq)]
pub struct LoggedMetric {
    pub name: String,
    pub value: f32,
    pub step: usize,
    pub options: MetricOptions,
}

/// Keeps every call in order
#[derive(Debug, Default)]
pub struct MemorySink {
    step: usize,
    pub entries: Vec<LoggedMetric>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recent value logged under `name`
    pub fn last(&self, name: &str) -> Option<f32> {
        self.entries
            .iter()
            .rev()
            .find(|entry| entry.name == name)
            .map(|entry| entry.value)
    }

    pub fn values(&self, name: &str) -> Vec<f32> {
        self.entries
            .iter()
            .filter(|entry| entry.name == name)
            .map(|entry| entry.value)
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.iter().map(|e| e.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        names
    }
}

impl MetricSink for MemorySink {
    fn log(&mut self, name: &str, value: f32, options: MetricOptions) {
        self.entries.push(LoggedMetric {
            name: name.to_string(),
            value,
            step: self.step,
            options,
        });
    }

    fn set_step(&mut self, step: usize) {
        self.step = step;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct RunningMean {
    sum: f64,
    count: usize,
    /// Raw values were forwarded too, so the mean needs its own tag
    per_step: bool,
}

impl RunningMean {
    fn push(&mut self, value: f32) {
        self.sum += value as f64;
        self.count += 1;
    }

    fn mean(&self) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            (self.sum / self.count as f64) as f32
        }
    }
}

/// Forwards `on_step` values to the wrapped sink and averages `on_epoch`
/// values, flushing the means as `{name}_epoch` when the epoch ends.
pub struct EpochMeanSink<S: MetricSink> {
    inner: S,
    means: BTreeMap<String, RunningMean>,
}

impl<S: MetricSink> EpochMeanSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            means: BTreeMap::new(),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Mean of the values collected so far this epoch
    pub fn current_mean(&self, name: &str) -> Option<f32> {
        self.means.get(name).map(RunningMean::mean)
    }
}

impl<S: MetricSink> MetricSink for EpochMeanSink<S> {
    fn log(&mut self, name: &str, value: f32, options: MetricOptions) {
        if options.on_step {
            self.inner.log(name, value, options);
        }
        if options.on_epoch {
            let mean = self.means.entry(name.to_string()).or_default();
            mean.per_step |= options.on_step;
            mean.push(value);
        }
    }

    fn set_step(&mut self, step: usize) {
        self.inner.set_step(step);
    }

    fn end_epoch(&mut self, epoch: usize) {
        let flush = MetricOptions {
            on_step: true,
            on_epoch: false,
            sync_dist: false,
        };
        for (name, mean) in std::mem::take(&mut self.means) {
            let tag = if mean.per_step {
                format!("{}_epoch", name)
            } else {
                name
            };
            self.inner.log(&tag, mean.mean(), flush);
        }
        self.inner.end_epoch(epoch);
    }
}

/// Sends every call to each wrapped sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn MetricSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl MetricSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricSink for FanoutSink {
    fn log(&mut self, name: &str, value: f32, options: MetricOptions) {
        for sink in &mut self.sinks {
            sink.log(name, value, options);
        }
    }

    fn set_step(&mut self, step: usize) {
        for sink in &mut self.sinks {
            sink.set_step(step);
        }
    }

    fn end_epoch(&mut self, epoch: usize) {
        for sink in &mut self.sinks {
            sink.end_epoch(epoch);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STEP_ONLY: MetricOptions = MetricOptions {
        on_step: true,
        on_epoch: false,
        sync_dist: false,
    };

    #[test]
    fn test_memory_sink_records_steps() {
        let mut sink = MemorySink::new();
        sink.log("train/total_loss", 1.0, STEP_ONLY);
        sink.set_step(3);
        sink.log("train/total_loss", 0.5, STEP_ONLY);

        assert_eq!(sink.values("train/total_loss"), vec![1.0, 0.5]);
        assert_eq!(sink.entries[1].step, 3);
        assert_eq!(sink.last("train/total_loss"), Some(0.5));
        assert_eq!(sink.last("missing"), None);

        sink.log("val_kl/kl_loss", 0.1, STEP_ONLY);
        assert_eq!(sink.names(), vec!["train/total_loss", "val_kl/kl_loss"]);
    }

    #[test]
    fn test_epoch_mean_sink() {
        let mut sink = EpochMeanSink::new(MemorySink::new());
        sink.log("train/action_loss", 1.0, MetricOptions::STEP_AND_EPOCH);
        sink.log("train/action_loss", 2.0, MetricOptions::STEP_AND_EPOCH);
        sink.log("train/action_loss", 3.0, MetricOptions::STEP_AND_EPOCH);
        sink.log("val_kl/kl_loss", 0.25, MetricOptions::EPOCH_SYNCED);
        assert!((sink.current_mean("train/action_loss").unwrap() - 2.0).abs() < 1e-6);

        sink.end_epoch(0);
        let inner = sink.into_inner();
        assert_eq!(inner.values("train/action_loss").len(), 3);
        assert!((inner.last("train/action_loss_epoch").unwrap() - 2.0).abs() < 1e-6);
        assert!((inner.last("val_kl/kl_loss").unwrap() - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_csv_sink_writes_header_once() {
        let dir = std::env::temp_dir().join(format!("play_lmp_csv_{}", std::process::id()));
        let mut sink = CsvSink::new(&dir).unwrap();
        sink.log("train/kl_beta", 0.1, STEP_ONLY);
        sink.set_step(1);
        sink.log("train/kl_beta", 0.2, STEP_ONLY);

        let contents = std::fs::read_to_string(sink.path_for("train/kl_beta")).unwrap();
        assert_eq!(contents, "step,value\n0,0.1\n1,0.2\n");
        std::fs::remove_dir_all(&dir).ok();
    }
}
