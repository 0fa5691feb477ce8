/// Audit Event Journal
///
/// Every externally visible outcome of the distribution overlay — downloads,
/// uploads, verification verdicts, blacklists, cache hits — is journaled as
/// one JSON object per line. The journal rotates by size, keeping a bounded
/// number of backups. Writing is strictly best-effort: an audit failure is
/// logged and swallowed, it never blocks or fails the operation that
/// produced the event.
use crate::config::AuditConfig;
use crate::error::truncate_id;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    DownloadComplete,
    DownloadFailed,
    UploadComplete,
    VerificationFailed,
    CacheHit,
    PeerBlacklisted,
    MultiSourceVerified,
    MultiSourceUnverified,
}

/// One journal record. Hashes and peer ids are truncated to 16 characters
/// at construction; full identifiers never reach the log.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub package_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub duration_ms: u64,
    pub bytes_p2p: u64,
    pub bytes_mirror: u64,
    pub chunks_total: u32,
    pub chunks_p2p: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider_count: Option<usize>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, package_hash: &str) -> Self {
        Self {
            timestamp: Utc::now(),
            event_type,
            package_hash: truncate_id(package_hash),
            package_name: None,
            package_size: None,
            source: None,
            peer_id: None,
            duration_ms: 0,
            bytes_p2p: 0,
            bytes_mirror: 0,
            chunks_total: 0,
            chunks_p2p: 0,
            error: None,
            reason: None,
            provider_count: None,
        }
    }

    pub fn with_package_name(mut self, name: impl Into<String>) -> Self {
        self.package_name = Some(name.into());
        self
    }

    pub fn with_package_size(mut self, size: u64) -> Self {
        self.package_size = Some(size);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_peer_id(mut self, peer_id: &str) -> Self {
        self.peer_id = Some(truncate_id(peer_id));
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    pub fn with_transfer(mut self, bytes_p2p: u64, bytes_mirror: u64) -> Self {
        self.bytes_p2p = bytes_p2p;
        self.bytes_mirror = bytes_mirror;
        self
    }

    pub fn with_chunks(mut self, total: u32, p2p: u32) -> Self {
        self.chunks_total = total;
        self.chunks_p2p = p2p;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_provider_count(mut self, count: usize) -> Self {
        self.provider_count = Some(count);
        self
    }
}

struct AuditSink {
    file: File,
    /// Bytes actually written to the current file. Exact accounting, so the
    /// rotation threshold is honored to the byte.
    written: u64,
}

/// JSON-lines audit journal with size-based rotation.
pub struct AuditLogger {
    path: PathBuf,
    max_size: u64,
    max_backups: usize,
    sink: Mutex<AuditSink>,
}

impl AuditLogger {
    pub fn new(path: PathBuf, config: &AuditConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create audit log directory: {:?}", parent))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("Failed to open audit log: {:?}", path))?;
        let written = file.metadata().map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            path,
            max_size: config.max_size_bytes,
            max_backups: config.max_backups,
            sink: Mutex::new(AuditSink { file, written }),
        })
    }

    /// Append one event to the journal. Never fails the caller: write and
    /// rotation errors are reported through tracing and dropped.
    pub fn log(&self, event: &AuditEvent) {
        if let Err(e) = self.try_log(event) {
            warn!("audit event dropped: {}", e);
        }
    }

    fn try_log(&self, event: &AuditEvent) -> Result<()> {
        let line = serde_json::to_string(event).context("Failed to serialize audit event")?;
        let mut sink = self.sink.lock().unwrap();

        if sink.written + line.len() as u64 + 1 > self.max_size && sink.written > 0 {
            // Rotation failures must not drop the event; fall through and
            // keep appending to the oversized file.
            if let Err(e) = self.rotate(&mut sink) {
                warn!("audit log rotation failed: {}", e);
            }
        }

        sink.file.write_all(line.as_bytes())?;
        sink.file.write_all(b"\n")?;
        sink.file.flush()?;
        sink.written += line.len() as u64 + 1;
        Ok(())
    }

    /// Shift `audit.log.N` -> `audit.log.N+1`, dropping the oldest, then
    /// move the live file to `.1` and start a fresh one.
    fn rotate(&self, sink: &mut AuditSink) -> Result<()> {
        let oldest = self.backup_path(self.max_backups);
        if oldest.exists() {
            fs::remove_file(&oldest)
                .with_context(|| format!("Failed to remove oldest backup: {:?}", oldest))?;
        }
        for i in (1..self.max_backups).rev() {
            let from = self.backup_path(i);
            if from.exists() {
                fs::rename(&from, self.backup_path(i + 1))?;
            }
        }

        sink.file.flush()?;
        fs::rename(&self.path, self.backup_path(1))?;

        sink.file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to reopen audit log: {:?}", self.path))?;
        sink.written = 0;
        Ok(())
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{}", index));
        PathBuf::from(name)
    }

    /// Read up to `limit` of the most recent events from the live file.
    pub fn tail(&self, limit: usize) -> Result<Vec<AuditEvent>> {
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read audit log: {:?}", self.path))?;
        let mut events: Vec<AuditEvent> = contents
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();
        if events.len() > limit {
            events.drain(0..events.len() - limit);
        }
        Ok(events)
    }
}
