use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub data_dir: Option<String>,
    pub downloads_dir: Option<String>,
    pub daemon_url: Option<String>,
    pub daemon_token: Option<String>,
    pub max_concurrent_downloads: Option<usize>,
    pub search_timeout_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
    pub journal_staleness_hours: Option<u64>,
    pub dispatch_delay_ms: Option<u64>,
    pub shutdown_grace_secs: Option<u64>,
    pub weight_profile: Option<String>,

    // Feature configs
    pub retry: Option<RetryConfig>,
    pub maintenance: Option<MaintenanceConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: Option<u32>,
    pub initial_backoff_secs: Option<u64>,
    pub max_backoff_secs: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub interval_secs: Option<u64>,
    pub auto_reset_dead_letters: Option<bool>,
    pub dead_letter_batch: Option<usize>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.data_dir.is_none());
        assert!(config.retry.is_none());
        assert!(config.maintenance.is_none());
    }

    #[test]
    fn test_full_file_parses() {
        let config: FileConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/soulfetch"
            downloads_dir = "/music"
            daemon_url = "http://localhost:5030"
            daemon_token = "secret"
            max_concurrent_downloads = 5
            search_timeout_secs = 20
            stall_timeout_secs = 90
            journal_staleness_hours = 48
            dispatch_delay_ms = 100
            shutdown_grace_secs = 15
            weight_profile = "quality"

            [retry]
            max_retries = 6
            initial_backoff_secs = 2
            max_backoff_secs = 120
            backoff_multiplier = 3.0

            [maintenance]
            interval_secs = 300
            auto_reset_dead_letters = true
            dead_letter_batch = 10
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir.as_deref(), Some("/var/lib/soulfetch"));
        assert_eq!(config.max_concurrent_downloads, Some(5));
        assert_eq!(config.weight_profile.as_deref(), Some("quality"));
        let retry = config.retry.unwrap();
        assert_eq!(retry.max_retries, Some(6));
        assert_eq!(retry.backoff_multiplier, Some(3.0));
        let maintenance = config.maintenance.unwrap();
        assert_eq!(maintenance.auto_reset_dead_letters, Some(true));
        assert_eq!(maintenance.dead_letter_batch, Some(10));
    }

    #[test]
    fn test_partial_sections_fill_with_none() {
        let config: FileConfig = toml::from_str(
            r#"
            daemon_url = "http://localhost:5030"

            [retry]
            max_retries = 1
            "#,
        )
        .unwrap();
        let retry = config.retry.unwrap();
        assert_eq!(retry.max_retries, Some(1));
        assert!(retry.initial_backoff_secs.is_none());
    }

    #[test]
    fn test_load_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileConfig::load(&dir.path().join("absent.toml")).is_err());
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("soulfetch.toml");
        std::fs::write(&path, "max_concurrent_downloads = 7\n").unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.max_concurrent_downloads, Some(7));
    }
}
