// Pipeline Configuration Module
// Timeouts, fan-out bounds and retry settings, persisted as JSON

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to create config directory: {0}")]
    CreateDir(std::io::Error),
    #[error("Failed to serialize config: {0}")]
    Serialize(serde_json::Error),
    #[error("Failed to write config: {0}")]
    Write(std::io::Error),
}

/// Backoff settings for transient 429/5xx responses
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff (default: 1000)
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds (default: 30000)
    pub max_delay_ms: u64,
    /// Backoff multiplier (default: 2.0)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Request pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    /// Timeout for metadata calls, in seconds
    pub request_timeout_secs: u64,
    /// Timeout for upload/download sessions, in seconds
    pub transfer_timeout_secs: u64,
    /// Timeout for a token refresh exchange, in seconds
    pub refresh_timeout_secs: u64,
    /// Concurrent category probes when listing the portal root (1-8, default: 1)
    pub category_fetch_concurrency: usize,
    /// Page size used when expanding a folder node
    pub folder_page_size: usize,
    /// Page size of the category probes
    pub category_probe_page_size: usize,
    /// Upload body chunk size in bytes; progress is reported per chunk
    pub upload_chunk_size: usize,
    pub retry: RetryConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            transfer_timeout_secs: 4 * 3600,
            refresh_timeout_secs: 30,
            category_fetch_concurrency: 1,
            folder_page_size: 1000,
            category_probe_page_size: 1,
            upload_chunk_size: 256 * 1024,
            retry: RetryConfig::default(),
        }
    }
}

impl PipelineConfig {
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_secs)
    }

    pub fn transfer_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.transfer_timeout_secs)
    }

    pub fn refresh_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.refresh_timeout_secs)
    }
}

/// Get the path to the pipeline config file
pub fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("docbridge").join("pipeline.json")
}

/// Load configuration from the default location
pub fn load_config() -> PipelineConfig {
    load_config_from(&get_config_path())
}

/// Load configuration from `path`, falling back to defaults on any error
pub fn load_config_from(path: &Path) -> PipelineConfig {
    if path.exists() {
        match fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<PipelineConfig>(&content) {
                Ok(mut config) => {
                    validate_config(&mut config);
                    return config;
                }
                Err(e) => {
                    tracing::warn!("Failed to parse pipeline config: {}", e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read pipeline config: {}", e);
            }
        }
    }

    PipelineConfig::default()
}

/// Save configuration to the default location
pub fn save_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    save_config_to(config, &get_config_path())
}

pub fn save_config_to(config: &PipelineConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(ConfigError::CreateDir)?;
    }

    let content = serde_json::to_string_pretty(config).map_err(ConfigError::Serialize)?;
    fs::write(path, content).map_err(ConfigError::Write)?;

    tracing::info!("Pipeline config saved to {:?}", path);
    Ok(())
}

/// Clamp out-of-range values in place
pub fn validate_config(config: &mut PipelineConfig) {
    config.request_timeout_secs = config.request_timeout_secs.max(1);
    config.refresh_timeout_secs = config.refresh_timeout_secs.max(1);
    config.transfer_timeout_secs = config.transfer_timeout_secs.max(config.request_timeout_secs);
    config.category_fetch_concurrency = config.category_fetch_concurrency.clamp(1, 8);
    config.folder_page_size = config.folder_page_size.max(1);
    config.category_probe_page_size = config.category_probe_page_size.max(1);
    config.upload_chunk_size = config.upload_chunk_size.max(1024);
    if config.retry.max_delay_ms < config.retry.base_delay_ms {
        config.retry.max_delay_ms = config.retry.base_delay_ms;
    }
    if !(config.retry.backoff_multiplier >= 1.0) {
        config.retry.backoff_multiplier = 1.0;
    }
}
