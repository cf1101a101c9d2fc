//! Configuration of the storage result backend

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{BackendError, Result};
use crate::retry::{Backoff, RetryPolicy};

/// Subdirectory of the media root used by the default provider
pub const DEFAULT_RESULTS_DIR: &str = "celery-results";

/// Name of the provider used when none is configured
pub const DEFAULT_PROVIDER: &str = "filesystem";

/// Namespace prefixes the task queue puts in front of result keys
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct KeyPrefixes {
    #[serde(rename = "task_keyprefix")]
    pub task: String,

    #[serde(rename = "group_keyprefix")]
    pub group: String,

    #[serde(rename = "chord_keyprefix")]
    pub chord: String,
}

impl Default for KeyPrefixes {
    fn default() -> Self {
        Self {
            task: "celery-task-meta-".to_string(),
            group: "celery-taskset-meta-".to_string(),
            chord: "chord-unlock-".to_string(),
        }
    }
}

impl KeyPrefixes {
    /// Whether `name` belongs to one of the three namespaces
    pub fn owns(&self, name: &str) -> bool {
        [&self.task, &self.group, &self.chord]
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

/// Backend configuration, resolved once at construction
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Provider name in the registry; `None` selects the default filesystem
    /// provider under `media_root`
    #[serde(rename = "result_storage")]
    pub storage: Option<String>,

    /// Options passed to the provider factory
    #[serde(rename = "result_storage_config")]
    pub storage_config: toml::Table,

    #[serde(rename = "result_safe_to_retry")]
    pub safe_to_retry: RetryPolicy,

    /// Additional attempts after the first failure
    #[serde(rename = "result_backend_max_retries")]
    pub max_retries: u32,

    #[serde(rename = "result_backend_base_sleep_between_retries_ms")]
    pub base_sleep_between_retries_ms: u64,

    #[serde(rename = "result_backend_max_sleep_between_retries_ms")]
    pub max_sleep_between_retries_ms: u64,

    /// Age in seconds after which cleanup removes a result
    #[serde(rename = "result_expires")]
    pub expires: Option<u64>,

    pub media_root: PathBuf,

    #[serde(flatten)]
    pub prefixes: KeyPrefixes,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            storage: None,
            storage_config: toml::Table::new(),
            safe_to_retry: RetryPolicy::Disabled,
            max_retries: 3,
            base_sleep_between_retries_ms: 10,
            max_sleep_between_retries_ms: 10_000,
            expires: Some(86_400), // 1 day
            media_root: PathBuf::from("."),
            prefixes: KeyPrefixes::default(),
        }
    }
}

impl BackendConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            BackendError::configuration_caused_by(
                format!("failed to read config file {}", path.as_ref().display()),
                Box::new(e),
            )
        })?;

        toml::from_str(&content).map_err(|e| {
            BackendError::configuration_caused_by("failed to parse config", Box::new(e))
        })
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Merge configuration from file and environment, env vars take precedence
    pub fn load(path: Option<impl AsRef<Path>>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Override fields from `RESULT_*` and `MEDIA_ROOT` environment variables
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_vars(|name| std::env::var(name).ok())
    }

    fn apply_vars(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(storage) = var("RESULT_STORAGE") {
            self.storage = Some(storage);
        }
        if let Some(root) = var("MEDIA_ROOT") {
            self.media_root = PathBuf::from(root);
        }
        if let Some(retries) = var("RESULT_BACKEND_MAX_RETRIES") {
            self.max_retries = parse_var("RESULT_BACKEND_MAX_RETRIES", &retries)?;
        }
        if let Some(expires) = var("RESULT_EXPIRES") {
            self.expires = Some(parse_var("RESULT_EXPIRES", &expires)?);
        }
        if let Some(retry) = var("RESULT_SAFE_TO_RETRY") {
            let always: bool = parse_var("RESULT_SAFE_TO_RETRY", &retry)?;
            self.safe_to_retry = if always {
                RetryPolicy::Always
            } else {
                RetryPolicy::Disabled
            };
        }
        Ok(())
    }

    /// Provider name and options, falling back to the filesystem provider
    /// under `<media_root>/celery-results`
    pub fn resolved_storage(&self) -> (String, toml::Table) {
        match &self.storage {
            Some(storage) => (storage.clone(), self.storage_config.clone()),
            None => {
                let location = self.media_root.join(DEFAULT_RESULTS_DIR);
                let mut options = toml::Table::new();
                options.insert(
                    "location".to_string(),
                    toml::Value::String(location.to_string_lossy().into_owned()),
                );
                (DEFAULT_PROVIDER.to_string(), options)
            }
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            base: Duration::from_millis(self.base_sleep_between_retries_ms),
            max: Duration::from_millis(self.max_sleep_between_retries_ms),
        }
    }

    pub fn expires(&self) -> Option<Duration> {
        self.expires.map(Duration::from_secs)
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value.trim().parse().map_err(|e: T::Err| {
        BackendError::configuration_caused_by(
            format!("invalid value for {name}: {value:?}"),
            Box::new(e),
        )
    })
}
