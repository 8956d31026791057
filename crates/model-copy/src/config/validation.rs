//! Configuration validation.

use super::Config;
use crate::error::{CopyError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Local validation
    if config.local.models_dir.as_os_str().is_empty() {
        return Err(CopyError::Config("local.models_dir is required".into()));
    }
    reqwest::Url::parse(&config.local.server_url).map_err(|e| {
        CopyError::Config(format!(
            "local.server_url '{}' is not a valid URL: {}",
            config.local.server_url, e
        ))
    })?;

    // Transfer validation - only check the buffer if explicitly set
    let transfer = &config.transfer;
    if transfer.chunk_size == 0 {
        return Err(CopyError::Config(
            "transfer.chunk_size must be at least 1".into(),
        ));
    }
    if let Some(max) = transfer.max_buffered_bytes {
        if max == 0 {
            return Err(CopyError::Config(
                "transfer.max_buffered_bytes must be at least 1".into(),
            ));
        }
        if max < transfer.chunk_size as u64 {
            return Err(CopyError::Config(format!(
                "transfer.max_buffered_bytes ({}) must be at least transfer.chunk_size ({})",
                max, transfer.chunk_size
            )));
        }
    }
    if transfer.progress_interval_ms == 0 {
        return Err(CopyError::Config(
            "transfer.progress_interval_ms must be at least 1".into(),
        ));
    }

    // HTTP validation
    if config.http.connect_timeout_secs == 0 {
        return Err(CopyError::Config(
            "http.connect_timeout_secs must be at least 1".into(),
        ));
    }
    if let Some(0) = config.http.request_timeout_secs {
        return Err(CopyError::Config(
            "http.request_timeout_secs must be at least 1 when set".into(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpConfig, LocalConfig, TransferConfig};
    use std::path::PathBuf;

    fn valid_config() -> Config {
        Config {
            local: LocalConfig {
                models_dir: PathBuf::from("/var/lib/models"),
                server_url: "http://127.0.0.1:11434".to_string(),
            },
            transfer: TransferConfig::default(),
            http: HttpConfig::default(),
        }
    }

    #[test]
    fn test_valid_config() {
        let config = valid_config();
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_missing_models_dir() {
        let mut config = valid_config();
        config.local.models_dir = PathBuf::new();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_bad_server_url() {
        let mut config = valid_config();
        config.local.server_url = "not a url".to_string();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_zero_chunk_size() {
        let mut config = valid_config();
        config.transfer.chunk_size = 0;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_buffer_smaller_than_chunk() {
        let mut config = valid_config();
        config.transfer.chunk_size = 4096;
        config.transfer.max_buffered_bytes = Some(1024);
        assert!(validate(&config).is_err());

        config.transfer.max_buffered_bytes = Some(0);
        assert!(validate(&config).is_err());

        config.transfer.max_buffered_bytes = Some(4096);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_zero_timeouts() {
        let mut config = valid_config();
        config.http.connect_timeout_secs = 0;
        assert!(validate(&config).is_err());

        let mut config = valid_config();
        config.http.request_timeout_secs = Some(0);
        assert!(validate(&config).is_err());
    }
}
