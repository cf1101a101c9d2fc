//! Provider selection by name.
//!
//! The backend never names a concrete provider type. Configuration carries a
//! provider name plus a table of options, and the registry turns the pair into
//! a boxed [`StorageBackend`]. `filesystem` and `memory` are registered by
//! default; other providers (object stores and the like) are added with
//! [`ProviderRegistry::register`].

use log::{debug, error};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{BackendError, BoxError, Result};
use crate::folder_backend::FolderBackend;
use crate::memory_backend::MemoryBackend;
use crate::storage_backend::StorageBackend;

/// Builds a provider from its option table
pub type ProviderFactory =
    Box<dyn Fn(&toml::Table) -> std::result::Result<Box<dyn StorageBackend>, BoxError> + Send + Sync>;

pub struct ProviderRegistry {
    factories: BTreeMap<String, ProviderFactory>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct FolderOptions {
    location: PathBuf,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct MemoryOptions {}

fn parse_options<T: DeserializeOwned>(options: &toml::Table) -> std::result::Result<T, BoxError> {
    Ok(toml::Value::Table(options.clone()).try_into()?)
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("filesystem", |options| {
            let FolderOptions { location } = parse_options(options)?;
            Ok(Box::new(FolderBackend::new(location)?))
        });
        registry.register("memory", |options| {
            let MemoryOptions {} = parse_options(options)?;
            Ok(Box::new(MemoryBackend::new()))
        });
        registry
    }
}

impl ProviderRegistry {
    /// A registry without the built-in providers
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Add or replace the factory for `name`
    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&toml::Table) -> std::result::Result<Box<dyn StorageBackend>, BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    /// Instantiate provider `name`. Lookup and construction failures are
    /// logged and reported as configuration errors.
    pub fn create(&self, name: &str, options: &toml::Table) -> Result<Box<dyn StorageBackend>> {
        debug!("Storage provider: {}({:?})", name, options);
        let Some(factory) = self.factories.get(name) else {
            error!(
                "Unknown storage provider {:?}, registered: {:?}",
                name,
                self.names().collect::<Vec<_>>()
            );
            return Err(BackendError::configuration(format!(
                "cannot resolve storage provider implementation: {name}"
            )));
        };

        factory(options).map_err(|cause| {
            error!("Failed to create storage provider {}: {}", name, cause);
            BackendError::configuration_caused_by(
                format!("cannot create an instance of the storage provider: {name}({options:?})"),
                cause,
            )
        })
    }
}
