//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use sysinfo::System;
use tracing::info;

/// Default pipe capacity for remote-to-remote transfers (512 MiB).
pub const DEFAULT_MAX_BUFFERED_BYTES: u64 = 512 * 1024 * 1024;

/// Smallest pipe capacity auto-tuning will pick (8 MiB).
pub const MIN_AUTO_BUFFERED_BYTES: u64 = 8 * 1024 * 1024;

/// Default read/stream chunk size (1 MiB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in bytes.
    pub total_memory_bytes: u64,
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_memory();

        let total_memory_bytes = sys.total_memory();
        let total_memory_gb = total_memory_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_bytes,
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Local store and local server settings.
    #[serde(default)]
    pub local: LocalConfig,

    /// Transfer behavior (buffering, throttling, progress).
    #[serde(default)]
    pub transfer: TransferConfig,

    /// HTTP client settings.
    #[serde(default)]
    pub http: HttpConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.transfer = self.transfer.with_auto_tuning(&resources);
        self
    }
}

/// Local models tree and the server that registers models in it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    /// Models directory holding `manifests/` and `blobs/`
    /// (default: $OLLAMA_MODELS, else ~/.ollama/models).
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    /// Local server URL used to create models copied into the local store
    /// (default: http://127.0.0.1:11434).
    #[serde(default = "default_server_url")]
    pub server_url: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            models_dir: default_models_dir(),
            server_url: default_server_url(),
        }
    }
}

/// Transfer behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum bytes held in memory by a remote-to-remote pipe.
    /// Auto-tuned from RAM if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_buffered_bytes: Option<u64>,

    /// Bandwidth ceiling in bytes/sec (default: 0 = unlimited).
    #[serde(default)]
    pub bandwidth_limit: u64,

    /// Bytes per read chunk (default: 1 MiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Progress sampling interval in milliseconds (default: 500).
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Verify sha256 of blobs downloaded into the local store (default: true).
    #[serde(default = "default_true")]
    pub verify_downloads: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_buffered_bytes: None,
            bandwidth_limit: 0,
            chunk_size: default_chunk_size(),
            progress_interval_ms: default_progress_interval_ms(),
            verify_downloads: true,
        }
    }
}

impl TransferConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        // Pipe capacity: an eighth of RAM, capped at the 512 MiB default
        if self.max_buffered_bytes.is_none() {
            let by_ram = resources.total_memory_bytes / 8;
            let capacity = by_ram
                .min(DEFAULT_MAX_BUFFERED_BYTES)
                .max(MIN_AUTO_BUFFERED_BYTES);
            self.max_buffered_bytes = Some(capacity);
        }

        info!(
            "Auto-tuned config: max_buffered_bytes={}, chunk_size={}, bandwidth_limit={}",
            self.get_max_buffered_bytes(),
            self.chunk_size,
            self.bandwidth_limit,
        );

        self
    }

    pub fn get_max_buffered_bytes(&self) -> usize {
        self.max_buffered_bytes
            .unwrap_or(DEFAULT_MAX_BUFFERED_BYTES)
            .min(usize::MAX as u64) as usize
    }

    pub fn progress_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.progress_interval_ms)
    }
}

/// HTTP client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// TCP connect timeout in seconds (default: 30).
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Whole-request timeout in seconds. Unset by default since multi-gigabyte
    /// blobs can take hours.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,

    /// User-Agent header.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: None,
            user_agent: default_user_agent(),
        }
    }
}

// Default value functions for serde
fn default_models_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("OLLAMA_MODELS") {
        return PathBuf::from(dir);
    }
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join(".ollama").join("models"))
        .unwrap_or_else(|| PathBuf::from(".ollama/models"))
}

fn default_server_url() -> String {
    "http://127.0.0.1:11434".to_string()
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("model-copy/{}", env!("CARGO_PKG_VERSION"))
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resources(gb: u64) -> SystemResources {
        SystemResources {
            total_memory_bytes: gb * 1024 * 1024 * 1024,
            total_memory_gb: gb as f64,
            cpu_cores: 8,
        }
    }

    #[test]
    fn test_auto_tuning_caps_at_default() {
        let tuned = TransferConfig::default().with_auto_tuning(&resources(64));
        assert_eq!(tuned.max_buffered_bytes, Some(DEFAULT_MAX_BUFFERED_BYTES));
    }

    #[test]
    fn test_auto_tuning_scales_with_small_ram() {
        let tuned = TransferConfig::default().with_auto_tuning(&resources(2));
        assert_eq!(tuned.max_buffered_bytes, Some(256 * 1024 * 1024));
    }

    #[test]
    fn test_auto_tuning_keeps_explicit_value() {
        let config = TransferConfig {
            max_buffered_bytes: Some(1024),
            ..Default::default()
        };
        let tuned = config.with_auto_tuning(&resources(64));
        assert_eq!(tuned.max_buffered_bytes, Some(1024));
    }

    #[test]
    fn test_defaults() {
        let config = TransferConfig::default();
        assert_eq!(config.get_max_buffered_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.bandwidth_limit, 0);
        assert!(config.verify_downloads);
        assert_eq!(HttpConfig::default().request_timeout_secs, None);
        assert_eq!(LocalConfig::default().server_url, "http://127.0.0.1:11434");
    }
}
