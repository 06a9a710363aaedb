//! Metrics sinks.
//!
//! Every sink is bound to a channel, normally the model identity string, so
//! points from different runs never mix. Posting never fails from the
//! caller's point of view.

use pairrank_core::MetricsSink;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// One posted scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub channel: String,
    pub name: String,
    pub value: f64,
    pub step: u64,
}

/// Discards every point.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn post(&mut self, _name: &str, _value: f64, _step: u64) {}
}

/// Records points in memory.
///
/// Clones share the same buffer, so a test can keep one handle and give the
/// other to a trainer.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    channel: String,
    points: Arc<Mutex<Vec<MetricPoint>>>,
}

impl MemorySink {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            points: Arc::default(),
        }
    }

    /// Snapshot of everything posted so far.
    pub fn points(&self) -> Vec<MetricPoint> {
        match self.points.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Values posted under `name`, in posting order.
    pub fn series(&self, name: &str) -> Vec<(u64, f64)> {
        self.points()
            .into_iter()
            .filter(|p| p.name == name)
            .map(|p| (p.step, p.value))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn post(&mut self, name: &str, value: f64, step: u64) {
        let point = MetricPoint {
            channel: self.channel.clone(),
            name: name.to_string(),
            value,
            step,
        };
        match self.points.lock() {
            Ok(mut guard) => guard.push(point),
            Err(poisoned) => poisoned.into_inner().push(point),
        }
    }
}

/// Emits one `tracing` event per point.
#[derive(Debug, Clone)]
pub struct TracingSink {
    channel: String,
}

impl TracingSink {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl MetricsSink for TracingSink {
    fn post(&mut self, name: &str, value: f64, step: u64) {
        tracing::info!(channel = %self.channel, metric = name, value, step, "metric");
    }
}

/// Appends one JSON object per point to a file.
pub struct JsonlSink {
    channel: String,
    writer: BufWriter<File>,
}

impl JsonlSink {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn create(channel: impl Into<String>, path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            channel: channel.into(),
            writer: BufWriter::new(file),
        })
    }

    fn write_point(&mut self, point: &MetricPoint) -> std::io::Result<()> {
        serde_json::to_writer(&mut self.writer, point)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}

impl MetricsSink for JsonlSink {
    fn post(&mut self, name: &str, value: f64, step: u64) {
        let point = MetricPoint {
            channel: self.channel.clone(),
            name: name.to_string(),
            value,
            step,
        };
        if let Err(e) = self.write_point(&point) {
            tracing::warn!(error = %e, metric = name, step, "Failed to write metric point");
        }
    }
}
