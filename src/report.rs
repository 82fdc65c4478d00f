//! Metrics persistence and the operator digest.
//!
//! Each monitor tick appends one JSON line to a date-stamped log
//! (`state_metrics_YYYYMMDD.jsonl`); shutdown writes a full stats snapshot.
//! Write failures are logged and counted, never returned to callers on the
//! request path.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use thiserror::Error;

use crate::config::RotationConfig;
use crate::recorder::{Anomaly, MetricsSnapshot};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("persistence disabled")]
    Disabled,
}

/// Full dump written on shutdown.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub saved_at: DateTime<Utc>,
    pub total_events: usize,
    pub transition_counts: BTreeMap<String, u64>,
    pub anomalies: Vec<Anomaly>,
    pub metrics: MetricsSnapshot,
}

/// Append-only line writer with optional size based rotation.  Backups are
/// `<file>.1` .. `<file>.<keep>`; with compression the newest backup becomes
/// `<file>.1.gz`.
struct RotatingWriter {
    path: PathBuf,
    file: fs::File,
    rotation: RotationConfig,
}

impl RotatingWriter {
    fn open(path: &Path, rotation: &RotationConfig) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            rotation: rotation.clone(),
        })
    }

    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.check_rotate();
        writeln!(self.file, "{}", line)?;
        self.file.flush()
    }

    fn check_rotate(&mut self) {
        if let Some(limit) = self.rotation.max_bytes {
            if self.exceeds_limit(limit) {
                self.rotate_backups();
                self.compress_latest_backup();
                self.reopen_current();
            }
        }
    }

    fn exceeds_limit(&self, limit: u64) -> bool {
        self.path
            .metadata()
            .map(|meta| meta.len() >= limit)
            .unwrap_or(false)
    }

    fn backup_path(&self, idx: usize, suffix: &str) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}{}", idx, suffix));
        PathBuf::from(name)
    }

    fn rotate_backups(&self) {
        if self.rotation.keep == 0 {
            return;
        }
        for idx in (1..self.rotation.keep).rev() {
            for suffix in ["", ".gz"] {
                let old = self.backup_path(idx, suffix);
                if old.exists() {
                    let _ = fs::rename(&old, self.backup_path(idx + 1, suffix));
                }
            }
        }
        let _ = fs::rename(&self.path, self.backup_path(1, ""));
    }

    fn compress_latest_backup(&self) {
        if !self.rotation.compress || self.rotation.keep == 0 {
            return;
        }
        let rotated = self.backup_path(1, "");
        if let Ok(data) = fs::read(&rotated) {
            let mut gz = GzEncoder::new(Vec::new(), Compression::default());
            if gz.write_all(&data).is_ok() {
                if let Ok(buf) = gz.finish() {
                    if fs::write(self.backup_path(1, ".gz"), buf).is_ok() {
                        let _ = fs::remove_file(&rotated);
                    }
                }
            }
        }
    }

    fn reopen_current(&mut self) {
        if let Ok(newf) = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
        {
            self.file = newf;
        }
    }
}

struct DailyLog {
    stamp: String,
    writer: RotatingWriter,
}

pub struct MetricsPersister {
    metrics_dir: Option<PathBuf>,
    stats_dir: Option<PathBuf>,
    rotation: RotationConfig,
    current: Mutex<Option<DailyLog>>,
    lines_total: AtomicU64,
    write_errors_total: AtomicU64,
}

impl MetricsPersister {
    pub fn new(
        metrics_dir: Option<PathBuf>,
        stats_dir: Option<PathBuf>,
        rotation: RotationConfig,
    ) -> Self {
        Self {
            metrics_dir,
            stats_dir,
            rotation,
            current: Mutex::new(None),
            lines_total: AtomicU64::new(0),
            write_errors_total: AtomicU64::new(0),
        }
    }

    /// Persister that writes nothing.
    pub fn disabled() -> Self {
        Self::new(None, None, RotationConfig::default())
    }

    /// Append one metrics line.  Returns false when nothing was written.
    pub fn append_metrics(&self, metrics: &MetricsSnapshot) -> bool {
        if self.metrics_dir.is_none() {
            return false;
        }
        match self.try_append(metrics) {
            Ok(()) => {
                self.lines_total.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.write_errors_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(error = %e, "Failed to write metrics line");
                false
            }
        }
    }

    fn try_append(&self, metrics: &MetricsSnapshot) -> Result<(), PersistError> {
        let dir = self.metrics_dir.as_ref().ok_or(PersistError::Disabled)?;
        let line = serde_json::to_string(metrics)?;
        let stamp = metrics.timestamp.format("%Y%m%d").to_string();
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let stale = current.as_ref().map_or(true, |log| log.stamp != stamp);
        if stale {
            let path = dir.join(format!("state_metrics_{}.jsonl", stamp));
            let writer = RotatingWriter::open(&path, &self.rotation)?;
            *current = Some(DailyLog { stamp, writer });
        }
        match current.as_mut() {
            Some(log) => log.writer.write_line(&line)?,
            None => return Err(PersistError::Disabled),
        }
        Ok(())
    }

    /// Path of the metrics log for the day containing `at`.
    pub fn metrics_path(&self, at: DateTime<Utc>) -> Option<PathBuf> {
        self.metrics_dir
            .as_ref()
            .map(|dir| dir.join(format!("state_metrics_{}.jsonl", at.format("%Y%m%d"))))
    }

    /// Write a timestamped snapshot file and return its path.
    pub async fn write_snapshot(&self, snapshot: &StatsSnapshot) -> Result<PathBuf, PersistError> {
        let dir = self.stats_dir.as_ref().ok_or(PersistError::Disabled)?;
        let body = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join(format!(
            "state_stats_{}.json",
            snapshot.saved_at.format("%Y%m%d_%H%M%S")
        ));
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }

    pub fn lines_total(&self) -> u64 {
        self.lines_total.load(Ordering::Relaxed)
    }

    pub fn write_errors_total(&self) -> u64 {
        self.write_errors_total.load(Ordering::Relaxed)
    }
}

/// Human readable digest of `metrics`.
pub fn generate_report(metrics: &MetricsSnapshot) -> String {
    let mut buf = String::new();
    writeln!(&mut buf, "State monitoring report").ok();
    writeln!(&mut buf).ok();
    writeln!(&mut buf, "Window: last hour").ok();
    writeln!(&mut buf, "Unique users: {}", metrics.unique_users).ok();
    writeln!(&mut buf, "Total transitions: {}", metrics.total_transitions).ok();
    writeln!(
        &mut buf,
        "Invalid transitions: {} ({:.1}%)",
        metrics.invalid_transitions, metrics.error_rate
    )
    .ok();
    writeln!(&mut buf, "Blocked users: {}", metrics.blocked_users).ok();
    writeln!(&mut buf, "Anomalies detected: {}", metrics.anomalies_detected).ok();
    writeln!(&mut buf).ok();
    write!(&mut buf, "Top transitions:").ok();
    for t in &metrics.top_transitions {
        write!(
            &mut buf,
            "\n- {}: {} ({:.1}%)",
            t.transition, t.count, t.percentage
        )
        .ok();
    }
    buf
}
