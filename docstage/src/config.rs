//! Runtime configuration.
//!
//! Loaded from JSON (file or string), then overridden by `DOCSTAGE_*`
//! environment variables, then validated. Every field has a default, so an
//! empty object is a valid configuration.

use crate::errors::{ConfigError, OrchestratorResult};
use crate::orchestrator::Orchestrator;
use crate::registry::StageRegistry;
use crate::retry::RetryPolicy;
use crate::store::Stores;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DOCSTAGE_";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Number of concurrent stage workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Queue, scan and reaper timing.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry policy overrides keyed by stage name. Stored as overrides at
    /// startup, taking precedence over the registry defaults.
    #[serde(default)]
    pub retry: BTreeMap<String, RetryPolicy>,

    /// Storage backend.
    #[serde(default)]
    pub store: StoreConfig,

    /// Log output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            scheduler: SchedulerConfig::default(),
            retry: BTreeMap::new(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_workers() -> usize {
    4
}

/// Scheduling intervals and timeouts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often pending rows are scanned for work created outside the pool.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// Maximum startable keys queued per scan.
    #[serde(default = "default_scan_batch")]
    pub scan_batch: usize,

    /// How often the stale-run reaper runs.
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,

    /// Age after which a running attempt is presumed lost.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,

    /// Per-handler timeout; a timed-out run fails as transient.
    #[serde(default)]
    pub handler_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            scan_batch: default_scan_batch(),
            reap_interval_ms: default_reap_interval_ms(),
            stale_timeout_secs: default_stale_timeout_secs(),
            handler_timeout_ms: None,
        }
    }
}

fn default_scan_interval_ms() -> u64 {
    1000
}

fn default_scan_batch() -> usize {
    256
}

fn default_reap_interval_ms() -> u64 {
    30_000
}

fn default_stale_timeout_secs() -> u64 {
    15 * 60
}

impl SchedulerConfig {
    /// Scan interval as a duration.
    #[must_use]
    pub const fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Reaper interval as a duration.
    #[must_use]
    pub const fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    /// Stale timeout as a duration.
    #[must_use]
    pub const fn stale_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_timeout_secs)
    }

    /// Handler timeout, if any.
    #[must_use]
    pub fn handler_timeout(&self) -> Option<Duration> {
        self.handler_timeout_ms.map(Duration::from_millis)
    }

    /// Sets the scan interval.
    #[must_use]
    pub const fn with_scan_interval_ms(mut self, ms: u64) -> Self {
        self.scan_interval_ms = ms;
        self
    }

    /// Sets the maximum number of keys queued per scan.
    #[must_use]
    pub const fn with_scan_batch(mut self, batch: usize) -> Self {
        self.scan_batch = batch;
        self
    }

    /// Sets the reaper interval.
    #[must_use]
    pub const fn with_reap_interval_ms(mut self, ms: u64) -> Self {
        self.reap_interval_ms = ms;
        self
    }

    /// Sets the stale timeout.
    #[must_use]
    pub const fn with_stale_timeout_secs(mut self, secs: u64) -> Self {
        self.stale_timeout_secs = secs;
        self
    }

    /// Sets the handler timeout.
    #[must_use]
    pub const fn with_handler_timeout_ms(mut self, ms: u64) -> Self {
        self.handler_timeout_ms = Some(ms);
        self
    }
}

/// Storage backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local maps; state is lost on exit.
    #[default]
    Memory,
    /// SQLite database file.
    Sqlite {
        /// Database path.
        path: PathBuf,
    },
}

/// Log output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

impl OrchestratorConfig {
    /// Parses a JSON document.
    ///
    /// # Errors
    ///
    /// `Parse` for malformed JSON or wrong field types.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON file, applies environment overrides and validates.
    ///
    /// # Errors
    ///
    /// `Io`, `Parse`, `Env` or `Invalid`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_json_str(&raw)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `DOCSTAGE_*` overrides from the process environment.
    ///
    /// # Errors
    ///
    /// `Env` if a variable holds an unparsable value.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary lookup.
    ///
    /// Recognized variables: `WORKERS`, `STORE` (`memory` or `sqlite`),
    /// `SQLITE_PATH`, `LOG_LEVEL`, `LOG_JSON`, `STALE_TIMEOUT_SECS`,
    /// `HANDLER_TIMEOUT_MS`, `SCAN_INTERVAL_MS`, `REAP_INTERVAL_MS`, each
    /// with the `DOCSTAGE_` prefix.
    ///
    /// # Errors
    ///
    /// `Env` if a variable holds an unparsable value.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{ENV_PREFIX}{suffix}");
            lookup(&name).map(|value| (name, value))
        };

        if let Some(v) = var("WORKERS") {
            self.workers = parse_env(v)?;
        }
        if let Some(v) = var("STALE_TIMEOUT_SECS") {
            self.scheduler.stale_timeout_secs = parse_env(v)?;
        }
        if let Some(v) = var("HANDLER_TIMEOUT_MS") {
            self.scheduler.handler_timeout_ms = Some(parse_env(v)?);
        }
        if let Some(v) = var("SCAN_INTERVAL_MS") {
            self.scheduler.scan_interval_ms = parse_env(v)?;
        }
        if let Some(v) = var("REAP_INTERVAL_MS") {
            self.scheduler.reap_interval_ms = parse_env(v)?;
        }
        if let Some(v) = var("LOG_LEVEL") {
            self.logging.level = v.1;
        }
        if let Some(v) = var("LOG_JSON") {
            self.logging.json = parse_env(v)?;
        }

        let sqlite_path = var("SQLITE_PATH").map(|(_, p)| PathBuf::from(p));
        match var("STORE") {
            Some((_, backend)) if backend.eq_ignore_ascii_case("memory") => {
                self.store = StoreConfig::Memory;
            }
            Some((name, backend)) if backend.eq_ignore_ascii_case("sqlite") => {
                let path = sqlite_path
                    .or_else(|| match &self.store {
                        StoreConfig::Sqlite { path } => Some(path.clone()),
                        StoreConfig::Memory => None,
                    })
                    .ok_or(ConfigError::Env { var: name, value: backend })?;
                self.store = StoreConfig::Sqlite { path };
            }
            Some((var, value)) => return Err(ConfigError::Env { var, value }),
            None => {
                if let Some(path) = sqlite_path {
                    self.store = StoreConfig::Sqlite { path };
                }
            }
        }
        Ok(())
    }

    /// Checks ranges and cross-field constraints.
    ///
    /// # Errors
    ///
    /// `Invalid` naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.scheduler.scan_interval_ms == 0 {
            return Err(ConfigError::invalid("scheduler.scan_interval_ms", "must be positive"));
        }
        if self.scheduler.scan_batch == 0 {
            return Err(ConfigError::invalid("scheduler.scan_batch", "must be positive"));
        }
        if self.scheduler.reap_interval_ms == 0 {
            return Err(ConfigError::invalid("scheduler.reap_interval_ms", "must be positive"));
        }
        if self.scheduler.stale_timeout_secs == 0 {
            return Err(ConfigError::invalid("scheduler.stale_timeout_secs", "must be positive"));
        }
        if let Some(timeout) = self.scheduler.handler_timeout_ms {
            if timeout == 0 {
                return Err(ConfigError::invalid("scheduler.handler_timeout_ms", "must be positive"));
            }
            if timeout / 1000 >= self.scheduler.stale_timeout_secs {
                return Err(ConfigError::invalid(
                    "scheduler.handler_timeout_ms",
                    "must be shorter than stale_timeout_secs",
                ));
            }
        }
        for (stage, policy) in &self.retry {
            policy.validate().map_err(|e| match e {
                ConfigError::Invalid { field, message } => {
                    ConfigError::invalid(format!("retry.{stage}.{field}"), message)
                }
                other => other,
            })?;
        }
        if let StoreConfig::Sqlite { path } = &self.store {
            if path.as_os_str().is_empty() {
                return Err(ConfigError::invalid("store.path", "must not be empty"));
            }
        }
        if self.logging.level.trim().is_empty() {
            return Err(ConfigError::invalid("logging.level", "must not be empty"));
        }
        Ok(())
    }

    /// Opens the configured backends.
    ///
    /// # Errors
    ///
    /// Backend failures, or `Config` when SQLite is selected but the
    /// `sqlite` feature is disabled.
    pub fn open_stores(&self) -> OrchestratorResult<Stores> {
        match &self.store {
            StoreConfig::Memory => Ok(Stores::in_memory()),
            #[cfg(feature = "sqlite")]
            StoreConfig::Sqlite { path } => {
                let store = crate::store::SqliteStore::open(path)?;
                Ok(Stores::sqlite(store))
            }
            #[cfg(not(feature = "sqlite"))]
            StoreConfig::Sqlite { .. } => Err(ConfigError::invalid(
                "store.backend",
                "sqlite support is not compiled in",
            )
            .into()),
        }
    }

    /// Builds an orchestrator over the configured stores and stores the
    /// configured retry overrides.
    ///
    /// # Errors
    ///
    /// Store failures, or `UnknownStage` for an override naming a stage
    /// outside the registry.
    pub async fn build_orchestrator(&self, registry: StageRegistry) -> OrchestratorResult<Orchestrator> {
        let orchestrator = Orchestrator::new(registry, self.open_stores()?);
        for (stage, policy) in &self.retry {
            orchestrator.set_retry_policy(stage, policy.clone()).await?;
        }
        info!(
            workers = self.workers,
            store = ?self.store,
            overrides = self.retry.len(),
            "Orchestrator configured"
        );
        Ok(orchestrator)
    }
}

fn parse_env<T: std::str::FromStr>((var, value): (String, String)) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env { var, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ErrorType;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_empty_object_uses_defaults() {
        let config = OrchestratorConfig::from_json_str("{}").unwrap();
        assert_eq!(config, OrchestratorConfig::default());
        assert_eq!(config.workers, 4);
        assert_eq!(config.store, StoreConfig::Memory);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_document() {
        let json = r#"{
            "workers": 8,
            "scheduler": { "scan_interval_ms": 250, "handler_timeout_ms": 30000 },
            "retry": { "embedding": { "max_attempts": 5, "retryable_error_types": ["transient"] } },
            "store": { "backend": "sqlite", "path": "/var/lib/docstage/state.db" },
            "logging": { "level": "docstage=debug", "json": true }
        }"#;
        let config = OrchestratorConfig::from_json_str(json).unwrap();

        assert_eq!(config.workers, 8);
        assert_eq!(config.scheduler.scan_interval_ms, 250);
        assert_eq!(config.scheduler.reap_interval_ms, 30_000);
        assert_eq!(config.scheduler.handler_timeout(), Some(Duration::from_secs(30)));
        let embedding = &config.retry["embedding"];
        assert_eq!(embedding.max_attempts, 5);
        assert_eq!(embedding.backoff_base_ms, 1000);
        assert!(embedding.is_retryable(ErrorType::Transient));
        assert!(!embedding.is_retryable(ErrorType::ResourceExhausted));
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: "/var/lib/docstage/state.db".into()
            }
        );
        assert!(config.logging.json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("DOCSTAGE_WORKERS", "2"),
            ("DOCSTAGE_STORE", "sqlite"),
            ("DOCSTAGE_SQLITE_PATH", "/tmp/docstage.db"),
            ("DOCSTAGE_LOG_JSON", "true"),
            ("DOCSTAGE_STALE_TIMEOUT_SECS", "60"),
        ]
        .into_iter()
        .collect();

        let mut config = OrchestratorConfig::default();
        config
            .apply_env_from(|name| env.get(name).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(
            config.store,
            StoreConfig::Sqlite {
                path: "/tmp/docstage.db".into()
            }
        );
        assert!(config.logging.json);
        assert_eq!(config.scheduler.stale_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn test_env_rejects_garbage() {
        let mut config = OrchestratorConfig::default();
        let err = config
            .apply_env_from(|name| (name == "DOCSTAGE_WORKERS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { ref var, .. } if var == "DOCSTAGE_WORKERS"));

        let err = config
            .apply_env_from(|name| (name == "DOCSTAGE_STORE").then(|| "postgres".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));

        let err = config
            .apply_env_from(|name| (name == "DOCSTAGE_STORE").then(|| "sqlite".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }), "sqlite without a path");
    }

    #[test]
    fn test_validation_names_field() {
        let mut config = OrchestratorConfig::default();
        config.workers = 0;
        assert!(config.validate().unwrap_err().to_string().contains("workers"));

        let mut config = OrchestratorConfig::default();
        config
            .retry
            .insert("chunking".into(), RetryPolicy::new().with_max_attempts(0));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retry.chunking.max_attempts"));

        let mut config = OrchestratorConfig::default();
        config.scheduler = config.scheduler.with_stale_timeout_secs(10).with_handler_timeout_ms(20_000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = OrchestratorConfig::from_json_str(r#"{ "workers": "four" }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docstage.json");
        std::fs::write(&path, r#"{ "workers": 3 }"#).unwrap();
        let config = OrchestratorConfig::load(&path).unwrap();
        assert!(config.workers >= 1);

        let missing = OrchestratorConfig::load(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }

    #[tokio::test]
    async fn test_build_orchestrator_stores_overrides() {
        let mut config = OrchestratorConfig::default();
        config
            .retry
            .insert("b".into(), RetryPolicy::new().with_max_attempts(7));
        let registry = crate::registry::presets::linear(&["a", "b"]).unwrap();

        let orchestrator = config.build_orchestrator(registry).await.unwrap();
        assert_eq!(orchestrator.retry_policy("b").await.unwrap().max_attempts, 7);
        assert_eq!(orchestrator.retry_policy("a").await.unwrap().max_attempts, 3);
    }
}
