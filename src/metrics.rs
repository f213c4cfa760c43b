// Metric plumbing: stage-prefixed key naming and the recorder seam the
// loss engine writes through. Key formatting lives here and nowhere else,
// so "train"/"val"/"test" prefixes and the "_epoch" suffix cannot drift
// between call sites.

use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Train,
    Val,
    Test,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Train => "train",
            Stage::Val => "val",
            Stage::Test => "test",
        }
    }

    /// Per-step key: `{stage}_{name}`.
    pub fn key(&self, name: &str) -> String {
        format!("{}_{}", self.as_str(), name)
    }

    /// Epoch-level key: `{stage}_{name}_epoch`.
    pub fn epoch_key(&self, name: &str) -> String {
        format!("{}_{}_epoch", self.as_str(), name)
    }
}

pub trait MetricRecorder {
    fn record(&mut self, key: &str, value: f64);
}

/// Keeps every recorded value in memory, in arrival order per key.
#[derive(Debug, Default)]
pub struct BufferRecorder {
    values: HashMap<String, Vec<f64>>,
}

impl BufferRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn series(&self, key: &str) -> Option<&[f64]> {
        self.values.get(key).map(|v| v.as_slice())
    }

    pub fn last(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(|v| v.last().copied())
    }

    pub fn mean(&self, key: &str) -> Option<f64> {
        let series = self.values.get(key)?;
        if series.is_empty() {
            return None;
        }
        Some(series.iter().sum::<f64>() / series.len() as f64)
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.values.keys().map(|k| k.as_str()).collect();
        keys.sort_unstable();
        keys
    }
}

impl MetricRecorder for BufferRecorder {
    fn record(&mut self, key: &str, value: f64) {
        self.values.entry(key.to_string()).or_default().push(value);
    }
}

/// Discards everything. Validation steps log per-step metrics nowhere;
/// only their epoch aggregates are kept.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl MetricRecorder for NullRecorder {
    fn record(&mut self, _key: &str, _value: f64) {}
}

/// Prints each metric as it arrives.
#[derive(Debug, Default)]
pub struct StderrRecorder;

impl MetricRecorder for StderrRecorder {
    fn record(&mut self, key: &str, value: f64) {
        eprintln!("[METRIC] {key} = {value:.6}");
    }
}
