//! docflow Config
//!
//! Application configuration, loaded once at startup and shared by reference
//! with every component. Sources, lowest priority first:
//!
//! 1. Built-in defaults
//! 2. An optional configuration file (TOML, YAML or JSON by extension)
//! 3. Environment variables prefixed with `DOCFLOW_`, nested with `__`
//!    (`DOCFLOW_RETRY__MAX_ATTEMPTS=3`)

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  #[error("failed to load configuration: {0}")]
  Load(#[from] config::ConfigError),

  #[error("invalid configuration '{field}': {reason}")]
  Invalid { field: &'static str, reason: String },
}

/// Retry policy for task invocations that fail with a transient fault.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Total attempts, including the first.
  pub max_attempts: u32,
  pub interval_ms: u64,
  pub backoff_rate: f64,
  /// Upper bound on any single backoff delay.
  pub max_interval_ms: u64,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      max_attempts: 6,
      interval_ms: 2_000,
      backoff_rate: 2.0,
      max_interval_ms: 60_000,
    }
  }
}

impl RetryConfig {
  pub fn interval(&self) -> Duration {
    Duration::from_millis(self.interval_ms)
  }

  pub fn max_interval(&self) -> Duration {
    Duration::from_millis(self.max_interval_ms)
  }
}

/// Base URL of an HTTP collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
  pub base_url: String,
}

impl Default for EndpointConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:9000".to_string(),
    }
  }
}

/// Error-count alarm over a rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmConfig {
  pub threshold: u32,
  pub window_secs: u64,
}

impl Default for AlarmConfig {
  fn default() -> Self {
    Self {
      threshold: 1,
      window_secs: 300,
    }
  }
}

impl AlarmConfig {
  pub fn window(&self) -> Duration {
    Duration::from_secs(self.window_secs)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
  /// Capacity of the inbound request channel.
  pub buffer_size: usize,
}

impl Default for RunnerConfig {
  fn default() -> Self {
    Self { buffer_size: 100 }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
  /// SQLite URL. Defaults to `docflow.db` under the data directory.
  pub database_url: Option<String>,
  pub listen_addr: String,
  /// Bucket the analysis service writes its results to.
  pub analysis_output_bucket: String,
  pub poll_interval_secs: u64,
  /// Maximum status checks per execution. Unbounded when unset.
  pub max_polls: Option<u32>,
  pub request_timeout_secs: u64,
  /// How long a worker may hold an execution without checkpointing before
  /// another worker can take it over.
  pub lease_secs: u64,
  pub retry: RetryConfig,
  pub workers: EndpointConfig,
  pub analysis: EndpointConfig,
  pub alarm: AlarmConfig,
  pub runner: RunnerConfig,
}

impl Default for AppConfig {
  fn default() -> Self {
    Self {
      database_url: None,
      listen_addr: "0.0.0.0:8080".to_string(),
      analysis_output_bucket: "textract-output".to_string(),
      poll_interval_secs: 30,
      max_polls: None,
      request_timeout_secs: 30,
      lease_secs: 300,
      retry: RetryConfig::default(),
      workers: EndpointConfig::default(),
      analysis: EndpointConfig::default(),
      alarm: AlarmConfig::default(),
      runner: RunnerConfig::default(),
    }
  }
}

impl AppConfig {
  /// Load from the optional file and the process environment, then validate.
  pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
    Self::from_sources(path, None)
  }

  /// Load with an explicit environment instead of the process environment.
  pub fn from_sources(
    path: Option<&Path>,
    env: Option<HashMap<String, String>>,
  ) -> Result<Self, ConfigError> {
    let mut builder = Config::builder();

    if let Some(path) = path {
      builder = builder.add_source(File::from(path).required(true));
    }

    builder = builder.add_source(
      Environment::with_prefix("DOCFLOW")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
        .source(env),
    );

    let config: AppConfig = builder.build()?.try_deserialize()?;
    config.validate()?;
    Ok(config)
  }

  /// Load `.env` from the working directory if present.
  pub fn load_env_file() -> bool {
    match dotenvy::dotenv() {
      Ok(path) => {
        tracing::debug!(path = %path.display(), "env_file_loaded");
        true
      }
      Err(_) => false,
    }
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.analysis_output_bucket.trim().is_empty() {
      return Err(invalid("analysis_output_bucket", "must not be empty"));
    }
    if self.poll_interval_secs == 0 {
      return Err(invalid("poll_interval_secs", "must be greater than zero"));
    }
    if self.max_polls == Some(0) {
      return Err(invalid("max_polls", "must be greater than zero when set"));
    }
    if self.retry.max_attempts == 0 {
      return Err(invalid("retry.max_attempts", "must be at least 1"));
    }
    if !self.retry.backoff_rate.is_finite() || self.retry.backoff_rate < 1.0 {
      return Err(invalid(
        "retry.backoff_rate",
        format!("must be a finite number of at least 1.0, got {}", self.retry.backoff_rate),
      ));
    }
    if self.retry.max_interval_ms < self.retry.interval_ms {
      return Err(invalid(
        "retry.max_interval_ms",
        "must not be less than retry.interval_ms",
      ));
    }
    if self.lease_secs <= self.poll_interval_secs {
      return Err(invalid(
        "lease_secs",
        "must be greater than poll_interval_secs",
      ));
    }
    if self.alarm.threshold == 0 {
      return Err(invalid("alarm.threshold", "must be at least 1"));
    }
    if self.runner.buffer_size == 0 {
      return Err(invalid("runner.buffer_size", "must be greater than zero"));
    }
    if self.workers.base_url.trim().is_empty() {
      return Err(invalid("workers.base_url", "must not be empty"));
    }
    if self.analysis.base_url.trim().is_empty() {
      return Err(invalid("analysis.base_url", "must not be empty"));
    }
    Ok(())
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.poll_interval_secs)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_secs(self.request_timeout_secs)
  }

  pub fn lease(&self) -> Duration {
    Duration::from_secs(self.lease_secs)
  }

  /// The configured database URL, or `docflow.db` under `data_dir`.
  pub fn database_url_or(&self, data_dir: &Path) -> String {
    match &self.database_url {
      Some(url) => url.clone(),
      None => {
        let path: PathBuf = data_dir.join("docflow.db");
        format!("sqlite://{}", path.display())
      }
    }
  }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
  ConfigError::Invalid {
    field,
    reason: reason.into(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn env(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
    Some(
      pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    )
  }

  #[test]
  fn test_defaults() {
    let config = AppConfig::from_sources(None, env(&[])).unwrap();
    assert_eq!(config.poll_interval(), Duration::from_secs(30));
    assert_eq!(config.max_polls, None);
    assert_eq!(config.retry.max_attempts, 6);
    assert_eq!(config.retry.interval(), Duration::from_secs(2));
    assert_eq!(config.retry.backoff_rate, 2.0);
    assert_eq!(config.retry.max_interval(), Duration::from_secs(60));
    assert_eq!(config.lease(), Duration::from_secs(300));
    assert_eq!(config.alarm.threshold, 1);
    assert_eq!(config.runner.buffer_size, 100);
  }

  #[test]
  fn test_environment_overrides() {
    let config = AppConfig::from_sources(
      None,
      env(&[
        ("DOCFLOW_POLL_INTERVAL_SECS", "5"),
        ("DOCFLOW_MAX_POLLS", "20"),
        ("DOCFLOW_RETRY__MAX_ATTEMPTS", "3"),
        ("DOCFLOW_WORKERS__BASE_URL", "http://workers:8000"),
      ]),
    )
    .unwrap();

    assert_eq!(config.poll_interval_secs, 5);
    assert_eq!(config.max_polls, Some(20));
    assert_eq!(config.retry.max_attempts, 3);
    assert_eq!(config.retry.backoff_rate, 2.0);
    assert_eq!(config.workers.base_url, "http://workers:8000");
  }

  #[test]
  fn test_file_then_environment() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
      file,
      "analysis_output_bucket = \"from-file\"\npoll_interval_secs = 10\n\n[alarm]\nthreshold = 4"
    )
    .unwrap();

    let config = AppConfig::from_sources(
      Some(file.path()),
      env(&[("DOCFLOW_POLL_INTERVAL_SECS", "15")]),
    )
    .unwrap();

    assert_eq!(config.analysis_output_bucket, "from-file");
    assert_eq!(config.poll_interval_secs, 15);
    assert_eq!(config.alarm.threshold, 4);
    assert_eq!(config.alarm.window_secs, 300);
  }

  #[test]
  fn test_rejects_invalid_values() {
    let err = AppConfig::from_sources(None, env(&[("DOCFLOW_POLL_INTERVAL_SECS", "0")])).unwrap_err();
    assert!(matches!(
      err,
      ConfigError::Invalid {
        field: "poll_interval_secs",
        ..
      }
    ));

    let mut config = AppConfig::default();
    config.retry.backoff_rate = 0.5;
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid {
        field: "retry.backoff_rate",
        ..
      })
    ));

    let mut config = AppConfig::default();
    config.analysis_output_bucket = " ".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.lease_secs = config.poll_interval_secs;
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid {
        field: "lease_secs",
        ..
      })
    ));
  }

  #[test]
  fn test_rejects_non_finite_backoff() {
    for rate in ["NaN", "inf"] {
      let err = AppConfig::from_sources(None, env(&[("DOCFLOW_RETRY__BACKOFF_RATE", rate)]))
        .unwrap_err();
      assert!(
        matches!(
          err,
          ConfigError::Invalid {
            field: "retry.backoff_rate",
            ..
          }
        ),
        "backoff rate {} was accepted",
        rate
      );
    }

    let mut config = AppConfig::default();
    config.retry.max_interval_ms = 1_000;
    assert!(matches!(
      config.validate(),
      Err(ConfigError::Invalid {
        field: "retry.max_interval_ms",
        ..
      })
    ));
  }

  #[test]
  fn test_database_url_defaults_to_data_dir() {
    let config = AppConfig::default();
    assert_eq!(
      config.database_url_or(Path::new("/var/lib/docflow")),
      "sqlite:///var/lib/docflow/docflow.db"
    );
  }
}
