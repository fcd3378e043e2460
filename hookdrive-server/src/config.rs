use hookdrive_core::{
    DEFAULT_CHUNK_SIZE, DEFAULT_DOWNLOAD_WORKERS, DEFAULT_UPLOAD_WORKERS, DriveError, Manager,
    MemoryMetadataStore, MetadataStore, Result, RetryPolicy, SqliteMetadataStore,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub drive: DriveConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: i64,
    /// Webhook URLs chunks are spread over.
    #[serde(default)]
    pub webhooks: Vec<String>,
    #[serde(default = "default_upload_workers")]
    pub upload_workers: usize,
    #[serde(default = "default_download_workers")]
    pub download_workers: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// How long an endpoint that rejected our credentials is skipped.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

fn default_chunk_size() -> i64 {
    DEFAULT_CHUNK_SIZE as i64
}

fn default_upload_workers() -> usize {
    DEFAULT_UPLOAD_WORKERS
}

fn default_download_workers() -> usize {
    DEFAULT_DOWNLOAD_WORKERS
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_cooldown_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.jitter,
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    pub backend: MetadataBackend,
    #[serde(default = "default_metadata_path")]
    pub path: PathBuf,
}

fn default_metadata_path() -> PathBuf {
    PathBuf::from("hookdrive.db")
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            backend: MetadataBackend::Sqlite,
            path: default_metadata_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind_addr: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:2526".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    pub enabled: bool,
    pub interval_secs: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 5,
        }
    }
}

impl Config {
    /// Loads `path` and overlays `HOOKDRIVE__SECTION__KEY` environment
    /// variables. `HOOKDRIVE__DRIVE__WEBHOOKS` takes a comma-separated list.
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("HOOKDRIVE")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("drive.webhooks")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DriveError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| DriveError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Chunk size and endpoint validation happen here.
    pub fn build_manager(&self) -> Result<Manager> {
        Manager::builder()
            .chunk_size(self.drive.chunk_size)
            .endpoints(self.drive.webhooks.clone())
            .upload_workers(self.drive.upload_workers)
            .download_workers(self.drive.download_workers)
            .request_timeout(Duration::from_secs(self.drive.request_timeout_secs))
            .cooldown(Duration::from_secs(self.drive.cooldown_secs))
            .retry_policy(self.retry.policy())
            .build()
    }

    pub fn build_metadata_store(&self) -> Result<Arc<dyn MetadataStore>> {
        match self.metadata.backend {
            MetadataBackend::Sqlite => {
                tracing::info!("Using SQLite metadata at {}", self.metadata.path.display());
                Ok(Arc::new(SqliteMetadataStore::open(&self.metadata.path)?))
            }
            MetadataBackend::Memory => {
                tracing::warn!("Using in-memory metadata; the namespace is lost on restart");
                Ok(Arc::new(MemoryMetadataStore::new()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_fill_missing_sections() {
        let file = write_config(
            "drive:\n  webhooks:\n    - https://host/api/webhooks/1/aaaa\n    - https://host/api/webhooks/2/bbbb\n",
        );
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert_eq!(config.drive.webhooks.len(), 2);
        assert_eq!(config.drive.chunk_size, DEFAULT_CHUNK_SIZE as i64);
        assert_eq!(config.drive.upload_workers, 4);
        assert_eq!(config.metadata.backend, MetadataBackend::Sqlite);
        assert_eq!(config.http.bind_addr, "0.0.0.0:2526");
        assert_eq!(config.retry.policy(), RetryPolicy::default());
        assert!(config.build_manager().is_ok());
    }

    #[test]
    fn test_invalid_drive_settings_fail_manager_build() {
        let file = write_config("drive:\n  chunk_size: 0\n  webhooks:\n    - https://host/hook\n");
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(matches!(config.build_manager(), Err(DriveError::Config(_))));

        let file = write_config("drive:\n  chunk_size: 1024\n");
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert!(matches!(config.build_manager(), Err(DriveError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = Config::from_file("/nonexistent/hookdrive.yaml");
        assert!(matches!(result, Err(DriveError::Config(_))));
    }
}
