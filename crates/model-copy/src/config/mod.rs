//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML file, falling back to defaults when the
    /// file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => Self::from_yaml(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(
                    "No config file at {:?}, using defaults",
                    path.as_ref()
                );
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_from_yaml_full() {
        let yaml = r#"
local:
  models_dir: /data/models
  server_url: http://10.0.0.5:11434
transfer:
  max_buffered_bytes: 67108864
  bandwidth_limit: 10485760
  chunk_size: 65536
  progress_interval_ms: 250
  verify_downloads: false
http:
  connect_timeout_secs: 5
  request_timeout_secs: 7200
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.local.models_dir, Path::new("/data/models"));
        assert_eq!(config.transfer.get_max_buffered_bytes(), 64 * 1024 * 1024);
        assert_eq!(config.transfer.bandwidth_limit, 10 * 1024 * 1024);
        assert_eq!(config.transfer.chunk_size, 65536);
        assert!(!config.transfer.verify_downloads);
        assert_eq!(config.http.request_timeout_secs, Some(7200));
    }

    #[test]
    fn test_from_yaml_empty_sections_use_defaults() {
        let config = Config::from_yaml("transfer:\n  bandwidth_limit: 1000\n").unwrap();
        assert_eq!(config.transfer.bandwidth_limit, 1000);
        assert_eq!(config.transfer.chunk_size, DEFAULT_CHUNK_SIZE);
        assert_eq!(config.http.connect_timeout_secs, 30);
    }

    #[test]
    fn test_from_yaml_rejects_invalid() {
        assert!(Config::from_yaml("transfer:\n  chunk_size: 0\n").is_err());
        assert!(Config::from_yaml("transfer: [1, 2]\n").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "local:\n  models_dir: /tmp/models").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.local.models_dir, Path::new("/tmp/models"));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.yaml")).unwrap();
        assert_eq!(config.transfer.bandwidth_limit, 0);
        assert!(Config::load(dir.path().join("absent.yaml")).is_err());
    }
}
