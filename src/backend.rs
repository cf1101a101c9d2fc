//! Task-result key/value store on top of a [`StorageBackend`].
//!
//! Every result key maps to one entry of the provider, named after the key and
//! holding the value text. Reads and writes go through the configured
//! [`RetryPolicy`]; deletes are attempted once. [`KeyValueStore::cleanup`]
//! sweeps the provider root for expired entries the task queue produced.

use chrono::Utc;
use log::{debug, error, info, warn};
use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::time::Duration;

use crate::config::{BackendConfig, KeyPrefixes};
use crate::error::{BackendError, Result};
use crate::registry::ProviderRegistry;
use crate::retry::{Backoff, RetryPolicy};
use crate::storage_backend::StorageBackend;

/// The key/value contract the task queue drives its result store through.
pub trait KeyValueStore {
    /// Fetch the value stored under `key`, or `None` when nothing was stored.
    fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<String>>;

    /// Fetch several keys; absent keys yield `None` at their position.
    fn mget<K: AsRef<[u8]>>(&self, keys: &[K]) -> Result<Vec<Option<String>>> {
        keys.iter().map(|key| self.get(key)).collect()
    }

    fn set(&self, key: impl AsRef<[u8]>, value: &str) -> Result<()>;

    fn delete(&self, key: impl AsRef<[u8]>) -> Result<()>;

    /// Remove expired results.
    fn cleanup(&self) -> Result<CleanupReport>;

    /// Whether a provider failure may be retried.
    fn exception_safe_to_retry(&self, err: &io::Error) -> bool;
}

/// Outcome of a cleanup sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Entries listed under the provider root
    pub scanned: usize,
    /// Entries left alone because no key prefix matched
    pub skipped: usize,
    pub deleted: usize,
    /// Expired or unreadable entries whose removal failed
    pub failed: usize,
}

/// Decode a key to text, replacing invalid UTF-8.
pub fn normalize_key(key: &[u8]) -> Cow<'_, str> {
    String::from_utf8_lossy(key)
}

#[derive(Debug, Clone, Copy)]
enum Operation {
    Fetch,
    Store,
}

impl Operation {
    fn fail(self, key: &str, attempts: u32, source: io::Error) -> BackendError {
        let key = key.to_string();
        match self {
            Operation::Fetch => BackendError::Fetch {
                key,
                attempts,
                source,
            },
            Operation::Store => BackendError::Store {
                key,
                attempts,
                source,
            },
        }
    }
}

/// Result store persisting one provider entry per key.
pub struct StorageResultBackend {
    provider: Box<dyn StorageBackend>,
    safe_to_retry: RetryPolicy,
    max_retries: u32,
    backoff: Backoff,
    expires: Option<Duration>,
    prefixes: KeyPrefixes,
}

impl StorageResultBackend {
    /// Build the backend with the built-in providers.
    pub fn new(config: BackendConfig) -> Result<Self> {
        Self::with_registry(config, &ProviderRegistry::default())
    }

    /// Build the backend, resolving the provider through `registry`.
    pub fn with_registry(config: BackendConfig, registry: &ProviderRegistry) -> Result<Self> {
        let (name, options) = config.resolved_storage();
        let provider = registry.create(&name, &options)?;
        Ok(Self::with_provider(config, provider))
    }

    /// Build the backend around an already constructed provider. The
    /// provider settings of `config` are ignored.
    pub fn with_provider(config: BackendConfig, provider: Box<dyn StorageBackend>) -> Self {
        let backoff = config.backoff();
        let expires = config.expires();
        info!(
            "Storage result backend using {} provider (retry: {:?}, max retries: {}, backoff: {:?})",
            provider.kind(),
            config.safe_to_retry,
            config.max_retries,
            backoff
        );
        Self {
            provider,
            safe_to_retry: config.safe_to_retry,
            max_retries: config.max_retries,
            backoff,
            expires,
            prefixes: config.prefixes,
        }
    }

    pub fn provider(&self) -> &dyn StorageBackend {
        &*self.provider
    }

    pub fn prefixes(&self) -> &KeyPrefixes {
        &self.prefixes
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    pub fn expires(&self) -> Option<Duration> {
        self.expires
    }

    pub fn key_for_task(&self, task_id: &str) -> String {
        format!("{}{}", self.prefixes.task, task_id)
    }

    pub fn key_for_group(&self, group_id: &str) -> String {
        format!("{}{}", self.prefixes.group, group_id)
    }

    pub fn key_for_chord(&self, group_id: &str) -> String {
        format!("{}{}", self.prefixes.chord, group_id)
    }

    /// Run `attempt` until it succeeds, the failure is not safe to retry, or
    /// the retries are used up.
    fn with_retries<T>(
        &self,
        operation: Operation,
        key: &str,
        mut attempt: impl FnMut() -> io::Result<T>,
    ) -> Result<T> {
        let mut retries = 0;
        loop {
            let err = match attempt() {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !self.exception_safe_to_retry(&err) {
                error!("{:?} of {} failed: {}", operation, key, err);
                return Err(BackendError::Storage(err));
            }
            if retries >= self.max_retries {
                error!(
                    "{:?} of {} failed after {} retries: {}",
                    operation, key, retries, err
                );
                return Err(operation.fail(key, retries + 1, err));
            }

            retries += 1;
            let delay = self.backoff.delay(retries);
            warn!(
                "{:?} of {} failed ({}), retry {}/{} in {:?}",
                operation, key, err, retries, self.max_retries, delay
            );
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
    }

    fn read_entry(&self, key: &str) -> io::Result<Option<String>> {
        let mut reader = match self.provider.reader(key) {
            Ok(reader) => reader,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("File not found reading {}, ignored", key);
                return Ok(None);
            }
            Err(err) => return Err(err),
        };
        let mut value = String::new();
        reader.read_to_string(&mut value)?;
        Ok(Some(value))
    }

    fn write_entry(&self, key: &str, value: &str) -> io::Result<()> {
        let mut writer = self.provider.writer(key)?;
        writer.write_all(value.as_bytes())?;
        writer.flush()
    }

    /// Check one listed entry, deleting it when expired. Returns whether it
    /// was deleted.
    fn sweep_entry(&self, name: &str, expires: Duration) -> io::Result<bool> {
        let modified = self.provider.modified_time(name)?;
        let age = Utc::now().signed_duration_since(modified);
        if !age.to_std().is_ok_and(|age| age > expires) {
            return Ok(false);
        }
        debug!("File {} modified time {} should be deleted", name, modified);
        self.provider.delete(name)?;
        Ok(true)
    }
}

impl KeyValueStore for StorageResultBackend {
    fn get(&self, key: impl AsRef<[u8]>) -> Result<Option<String>> {
        let key = normalize_key(key.as_ref());
        debug!("Reading {}", key);
        self.with_retries(Operation::Fetch, &key, || self.read_entry(&key))
    }

    fn set(&self, key: impl AsRef<[u8]>, value: &str) -> Result<()> {
        let key = normalize_key(key.as_ref());
        debug!("Writing {}: {:?}", key, value);
        self.with_retries(Operation::Store, &key, || self.write_entry(&key, value))
    }

    fn delete(&self, key: impl AsRef<[u8]>) -> Result<()> {
        let key = normalize_key(key.as_ref());
        debug!("Deleting {}", key);
        self.provider.delete(&key).map_err(|err| {
            error!("Exception while deleting {}: {}", key, err);
            BackendError::Storage(err)
        })
    }

    fn cleanup(&self) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        debug!("Cleaning up, expires: {:?}", self.expires);

        let (_, files) = self.provider.listdir(".")?;
        for name in files {
            report.scanned += 1;
            if !self.prefixes.owns(&name) {
                debug!("File is not produced by me, skipped: {}", name);
                report.skipped += 1;
                continue;
            }
            let Some(expires) = self.expires else {
                continue;
            };
            match self.sweep_entry(&name, expires) {
                Ok(true) => report.deleted += 1,
                Ok(false) => {}
                Err(err) => {
                    // Keep sweeping, one bad entry must not stop the rest
                    warn!("Failed to clean up {}: {}", name, err);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Cleanup finished: {} scanned, {} deleted, {} failed",
            report.scanned, report.deleted, report.failed
        );
        Ok(report)
    }

    fn exception_safe_to_retry(&self, err: &io::Error) -> bool {
        debug!("Check if the exception is safe to retry: {}", err);
        self.safe_to_retry.is_safe_to_retry(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_backend::MemoryBackend;

    fn backend(config: BackendConfig) -> StorageResultBackend {
        StorageResultBackend::with_provider(config, Box::new(MemoryBackend::new()))
    }

    #[test]
    fn normalizes_byte_keys() {
        assert_eq!(normalize_key(b"celery-task-meta-1"), "celery-task-meta-1");
        assert_eq!(normalize_key(b"bad-\xff"), "bad-\u{fffd}");
    }

    #[test]
    fn byte_and_text_keys_address_the_same_entry() {
        let backend = backend(BackendConfig::default());
        backend.set(b"celery-task-meta-1".as_slice(), "done").unwrap();
        assert_eq!(
            backend.get("celery-task-meta-1").unwrap().as_deref(),
            Some("done")
        );
    }

    #[test]
    fn mget_keeps_positions() {
        let backend = backend(BackendConfig::default());
        backend.set("a", "1").unwrap();
        backend.set("c", "3").unwrap();
        let values = backend.mget(&["a", "b", "c"]).unwrap();
        assert_eq!(
            values,
            vec![Some("1".to_string()), None, Some("3".to_string())]
        );
    }

    #[test]
    fn key_helpers_use_prefixes() {
        let backend = backend(BackendConfig::default());
        assert_eq!(backend.key_for_task("id"), "celery-task-meta-id");
        assert_eq!(backend.key_for_group("id"), "celery-taskset-meta-id");
        assert_eq!(backend.key_for_chord("id"), "chord-unlock-id");
    }

    #[test]
    fn retry_settings_come_from_config() {
        let backend = backend(BackendConfig {
            max_retries: 3,
            base_sleep_between_retries_ms: 5,
            max_sleep_between_retries_ms: 40,
            ..Default::default()
        });
        assert_eq!(backend.max_retries(), 3);
        assert_eq!(
            backend.backoff(),
            Backoff {
                base: Duration::from_millis(5),
                max: Duration::from_millis(40),
            }
        );
    }

    #[test]
    fn delete_of_missing_key_propagates() {
        let backend = backend(BackendConfig::default());
        let err = backend.delete("missing").unwrap_err();
        assert!(matches!(err, BackendError::Storage(ref e) if e.kind() == io::ErrorKind::NotFound));
    }

    #[test]
    fn cleanup_without_expiry_deletes_nothing() {
        let backend = backend(BackendConfig {
            expires: None,
            ..Default::default()
        });
        backend.set("celery-task-meta-1", "x").unwrap();
        let report = backend.cleanup().unwrap();
        assert_eq!(report.scanned, 1);
        assert_eq!(report.deleted, 0);
        assert!(backend.get("celery-task-meta-1").unwrap().is_some());
    }
}
