mod file_config;

pub use file_config::{FileConfig, MaintenanceConfig, RetryConfig};

use crate::orchestrator::{OrchestratorSettings, RetryPolicy};
use crate::scoring::WeightProfile;
use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub data_dir: Option<PathBuf>,
    pub downloads_dir: Option<PathBuf>,
    pub daemon_url: Option<String>,
    pub daemon_token: Option<String>,
    pub max_concurrent_downloads: usize,
    pub search_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub journal_staleness_hours: u64,
    pub dispatch_delay_ms: u64,
    pub shutdown_grace_secs: u64,
    pub weight_profile: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            downloads_dir: None,
            daemon_url: None,
            daemon_token: None,
            max_concurrent_downloads: 3,
            search_timeout_secs: 30,
            stall_timeout_secs: 60,
            journal_staleness_hours: 24,
            dispatch_delay_ms: 200,
            shutdown_grace_secs: 30,
            weight_profile: "balanced".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    // Core settings
    pub data_dir: PathBuf,
    pub downloads_dir: PathBuf,
    pub daemon_url: String,
    pub daemon_token: Option<String>,
    pub max_concurrent_downloads: usize,
    pub search_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub journal_staleness_hours: u64,
    pub dispatch_delay_ms: u64,
    pub shutdown_grace_secs: u64,
    pub weight_profile: String,

    // Feature configs (with defaults)
    pub retry: RetrySettings,
    pub maintenance: MaintenanceSettings,
}

#[derive(Debug, Clone)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 300,
            backoff_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MaintenanceSettings {
    pub interval_secs: u64,
    pub auto_reset_dead_letters: bool,
    pub dead_letter_batch: usize,
}

impl Default for MaintenanceSettings {
    fn default() -> Self {
        Self {
            interval_secs: 600,
            auto_reset_dead_letters: false,
            dead_letter_batch: 25,
        }
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        // TOML overrides CLI for each field
        let data_dir = file
            .data_dir
            .map(PathBuf::from)
            .or_else(|| cli.data_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("data_dir must be specified via --data-dir or in config file")
            })?;

        let downloads_dir = file
            .downloads_dir
            .map(PathBuf::from)
            .or_else(|| cli.downloads_dir.clone())
            .unwrap_or_else(|| data_dir.join("downloads"));

        let daemon_url = file
            .daemon_url
            .or_else(|| cli.daemon_url.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("daemon_url must be specified via --daemon-url or in config file")
            })?;

        let daemon_token = file.daemon_token.or_else(|| cli.daemon_token.clone());

        let max_concurrent_downloads = file
            .max_concurrent_downloads
            .unwrap_or(cli.max_concurrent_downloads);
        let search_timeout_secs = file.search_timeout_secs.unwrap_or(cli.search_timeout_secs);
        let stall_timeout_secs = file.stall_timeout_secs.unwrap_or(cli.stall_timeout_secs);
        let journal_staleness_hours = file
            .journal_staleness_hours
            .unwrap_or(cli.journal_staleness_hours);
        let dispatch_delay_ms = file.dispatch_delay_ms.unwrap_or(cli.dispatch_delay_ms);
        let shutdown_grace_secs = file
            .shutdown_grace_secs
            .unwrap_or(cli.shutdown_grace_secs);
        let weight_profile = file
            .weight_profile
            .unwrap_or_else(|| cli.weight_profile.clone());

        if max_concurrent_downloads == 0 {
            bail!("max_concurrent_downloads must be at least 1");
        }
        if search_timeout_secs == 0 {
            bail!("search_timeout_secs must be at least 1");
        }
        if stall_timeout_secs == 0 {
            bail!("stall_timeout_secs must be at least 1");
        }
        if journal_staleness_hours == 0 {
            bail!("journal_staleness_hours must be at least 1");
        }
        if WeightProfile::by_name(&weight_profile).is_none() {
            bail!(
                "Unknown weight profile '{}', valid profiles: {}",
                weight_profile,
                WeightProfile::builtin_names().join(", ")
            );
        }

        // Retry settings - merge file config with defaults
        let retry_file = file.retry.unwrap_or_default();
        let retry_defaults = RetrySettings::default();
        let retry = RetrySettings {
            max_retries: retry_file.max_retries.unwrap_or(retry_defaults.max_retries),
            initial_backoff_secs: retry_file
                .initial_backoff_secs
                .unwrap_or(retry_defaults.initial_backoff_secs),
            max_backoff_secs: retry_file
                .max_backoff_secs
                .unwrap_or(retry_defaults.max_backoff_secs),
            backoff_multiplier: retry_file
                .backoff_multiplier
                .unwrap_or(retry_defaults.backoff_multiplier),
        };
        if retry.backoff_multiplier < 1.0 {
            bail!("backoff_multiplier must be at least 1.0");
        }

        let maintenance_file = file.maintenance.unwrap_or_default();
        let maintenance_defaults = MaintenanceSettings::default();
        let maintenance = MaintenanceSettings {
            interval_secs: maintenance_file
                .interval_secs
                .unwrap_or(maintenance_defaults.interval_secs),
            auto_reset_dead_letters: maintenance_file
                .auto_reset_dead_letters
                .unwrap_or(maintenance_defaults.auto_reset_dead_letters),
            dead_letter_batch: maintenance_file
                .dead_letter_batch
                .unwrap_or(maintenance_defaults.dead_letter_batch),
        };
        if maintenance.interval_secs == 0 {
            bail!("maintenance interval_secs must be at least 1");
        }

        Ok(Self {
            data_dir,
            downloads_dir,
            daemon_url,
            daemon_token,
            max_concurrent_downloads,
            search_timeout_secs,
            stall_timeout_secs,
            journal_staleness_hours,
            dispatch_delay_ms,
            shutdown_grace_secs,
            weight_profile,
            retry,
            maintenance,
        })
    }

    pub fn journal_db_path(&self) -> PathBuf {
        self.data_dir.join("recovery_journal.db")
    }

    pub fn projection_db_path(&self) -> PathBuf {
        self.data_dir.join("track_projection.db")
    }

    pub fn staleness_window(&self) -> Duration {
        Duration::from_secs(self.journal_staleness_hours * 60 * 60)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            initial_backoff_secs: self.retry.initial_backoff_secs,
            max_backoff_secs: self.retry.max_backoff_secs,
            backoff_multiplier: self.retry.backoff_multiplier,
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            downloads_dir: self.downloads_dir.clone(),
            max_concurrent_downloads: self.max_concurrent_downloads,
            search_timeout: Duration::from_secs(self.search_timeout_secs),
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            dispatch_delay: Duration::from_millis(self.dispatch_delay_ms),
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            maintenance_interval: Duration::from_secs(self.maintenance.interval_secs),
            dead_letter_batch: self.maintenance.dead_letter_batch,
            auto_reset_dead_letters: self.maintenance.auto_reset_dead_letters,
            weight_profile: WeightProfile::by_name(&self.weight_profile)
                .unwrap_or_else(WeightProfile::balanced),
            retry: self.retry_policy(),
        }
    }
}
