use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the pkgswarm node.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Download engine configuration
    pub download: DownloadConfig,
    /// Bandwidth limiting configuration
    pub rate_limit: RateLimitConfig,
    /// Peer scorer configuration
    pub scorer: ScorerConfig,
    /// Resume store configuration
    pub resume: ResumeConfig,
    /// Audit log configuration
    pub audit: AuditConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Chunk size for parallel downloads, in bytes
    pub chunk_size: u64,
    /// Files below this size are raced whole instead of chunked
    pub min_chunked_size: u64,
    /// Maximum concurrent chunk workers per download
    pub max_concurrent_chunks: usize,
    /// Retry attempts per chunk before the download fails
    pub max_chunk_retries: u32,
    /// Deadline for a single chunk attempt, in seconds
    pub chunk_timeout_secs: u64,
    /// Head start given to peers before the mirror joins a race, in ms
    pub mirror_fallback_delay_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 4 * 1024 * 1024,
            min_chunked_size: 10 * 1024 * 1024,
            max_concurrent_chunks: 8,
            max_chunk_retries: 3,
            chunk_timeout_secs: 30,
            mirror_fallback_delay_ms: 200,
        }
    }
}

impl DownloadConfig {
    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn mirror_fallback_delay(&self) -> Duration {
        Duration::from_millis(self.mirror_fallback_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Global download budget in bytes/sec; 0 disables throttling
    pub global_download_bps: u64,
    /// Global upload budget in bytes/sec; 0 disables throttling
    pub global_upload_bps: u64,
    /// Fixed per-peer rate in bytes/sec; 0 derives it from the global rate
    pub per_peer_rate_bps: u64,
    /// Peer population used when deriving the per-peer rate
    pub expected_peers: usize,
    /// Floor for any per-peer rate, in bytes/sec
    pub min_peer_rate_bps: u64,
    /// Upper bound on adaptive boost as a multiple of the base rate
    pub max_boost: f64,
    /// Latency above this threshold starts penalizing a peer's rate, in ms
    pub latency_threshold_ms: f64,
    /// How often adaptive rates are recomputed, in seconds
    pub adaptive_interval_secs: u64,
    /// How often idle per-peer limiters are swept, in seconds
    pub cleanup_interval_secs: u64,
    /// A per-peer limiter idle for longer than this is removed, in seconds
    pub idle_timeout_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_download_bps: 0,
            global_upload_bps: 0,
            per_peer_rate_bps: 0,
            expected_peers: 50,
            min_peer_rate_bps: 100 * 1024,
            max_boost: 2.0,
            latency_threshold_ms: 300.0,
            adaptive_interval_secs: 10,
            cleanup_interval_secs: 30,
            idle_timeout_secs: 30,
        }
    }
}

impl RateLimitConfig {
    pub fn adaptive_interval(&self) -> Duration {
        Duration::from_secs(self.adaptive_interval_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScorerConfig {
    /// Peers unseen for longer than this are pruned, in hours
    pub retention_hours: u64,
    /// Blacklist duration applied to peers caught serving bad bytes, in hours
    pub mismatch_blacklist_hours: u64,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            retention_hours: 24,
            mismatch_blacklist_hours: 24,
        }
    }
}

impl ScorerConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn mismatch_blacklist(&self) -> Duration {
        Duration::from_secs(self.mismatch_blacklist_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeConfig {
    /// Path to the resume database; None uses the default data directory
    pub db_path: Option<PathBuf>,
    /// Unfinished records older than this are swept by the janitor, in hours
    pub max_age_hours: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_age_hours: 24,
        }
    }
}

impl ResumeConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_hours * 3600)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Path to the audit log; None uses the default data directory
    pub log_path: Option<PathBuf>,
    /// Rotate the audit log once it reaches this many bytes
    pub max_size_bytes: u64,
    /// Rotated copies kept before the oldest is dropped
    pub max_backups: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_path: None,
            max_size_bytes: 100 * 1024 * 1024,
            max_backups: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, or return defaults if the file
    /// does not exist yet.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    /// Write the configuration to a TOML file, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    /// Default config file location.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .context("Could not determine config directory")?;
        Ok(config_dir.join("pkgswarm").join("config.toml"))
    }

    /// Resolve the resume database path, falling back to the data directory.
    pub fn resume_db_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.resume.db_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
            .context("Could not determine data directory")?;
        Ok(data_dir.join("pkgswarm").join("resume.db"))
    }

    /// Resolve the audit log path, falling back to the data directory.
    pub fn audit_log_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.audit.log_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir()
            .or_else(|| dirs::home_dir().map(|h| h.join(".local/share")))
            .context("Could not determine data directory")?;
        Ok(data_dir.join("pkgswarm").join("audit.log"))
    }
}
