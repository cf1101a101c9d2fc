//! Task result store backed by a pluggable file storage provider.
//!
//! [`StorageResultBackend`] implements the [`KeyValueStore`] contract a task
//! queue uses for results: each key becomes one entry of a
//! [`StorageBackend`] (a local directory by default), reads and writes follow a
//! configurable [`RetryPolicy`], and [`KeyValueStore::cleanup`] removes expired
//! results.
//!
//! ```no_run
//! use storage_results::{BackendConfig, KeyValueStore, StorageResultBackend};
//!
//! fn example() -> storage_results::Result<()> {
//!     let backend = StorageResultBackend::new(BackendConfig::default())?;
//!     backend.set("celery-task-meta-abc", r#"{"status": "SUCCESS"}"#)?;
//!     let value = backend.get("celery-task-meta-abc")?;
//!     assert!(value.is_some());
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod folder_backend;
pub mod memory_backend;
pub mod registry;
pub mod retry;
pub mod storage_backend;

pub use backend::{CleanupReport, KeyValueStore, StorageResultBackend, normalize_key};
pub use config::{BackendConfig, KeyPrefixes};
pub use error::{BackendError, BoxError, Result};
pub use folder_backend::FolderBackend;
pub use memory_backend::MemoryBackend;
pub use registry::{ProviderFactory, ProviderRegistry};
pub use retry::{Backoff, ErrorClass, RetryPolicy};
pub use storage_backend::StorageBackend;
