use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context as AnyhowContext, Result};
use chrono::Local;
use serde::Serialize;

use crate::threat::ThreatLevel;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Threat-scored record of one annotated detection.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Alert {
    pub timestamp: String,
    pub object_type: String,
    pub confidence: f64,
    pub bbox: [i32; 4],
    pub speed: f64,
    pub is_running: bool,
    pub threat_level: ThreatLevel,
    pub frame_index: usize,
    pub video_reference: String,
}

impl Alert {
    /// Stamped with the local wall clock; confidence and speed are rounded
    /// to two decimals.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        object_type: &str,
        confidence: f64,
        bbox: [i32; 4],
        speed: f64,
        is_running: bool,
        threat_level: ThreatLevel,
        frame_index: usize,
        video_reference: &str,
    ) -> Self {
        Self {
            timestamp: Local::now().format(TIMESTAMP_FORMAT).to_string(),
            object_type: object_type.to_string(),
            confidence: round2(confidence),
            bbox,
            speed: round2(speed),
            is_running,
            threat_level,
            frame_index,
            video_reference: video_reference.to_string(),
        }
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.).round() / 100.
}

/// Destination of alerts. The pipeline only ever appends.
pub trait AlertSink {
    fn append(&mut self, alert: &Alert) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One JSON object per line, appended to an existing file.
pub struct JsonlAlertSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlAlertSink {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open alert log {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }
}

impl AlertSink for JsonlAlertSink {
    fn append(&mut self, alert: &Alert) -> Result<()> {
        serde_json::to_writer(&mut self.writer, alert)?;
        self.writer
            .write_all(b"\n")
            .with_context(|| format!("cannot write to {}", self.path.display()))?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps alerts in memory, oldest first.
#[derive(Clone, Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Vec<Alert>,
}

impl MemoryAlertSink {
    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// The newest `n` alerts, newest first.
    pub fn recent(&self, n: usize) -> Vec<&Alert> {
        self.alerts.iter().rev().take(n).collect()
    }

    /// Newest-first listing, optionally restricted to one object type.
    pub fn query(&self, object_type: Option<&str>, skip: usize, limit: usize) -> Vec<&Alert> {
        self.alerts
            .iter()
            .rev()
            .filter(|a| object_type.map_or(true, |t| a.object_type == t))
            .skip(skip)
            .take(limit)
            .collect()
    }
}

impl AlertSink for MemoryAlertSink {
    fn append(&mut self, alert: &Alert) -> Result<()> {
        self.alerts.push(alert.clone());
        Ok(())
    }
}
