//! The storage provider contract the result backend delegates to.

use chrono::{DateTime, Utc};
use std::io::{self, Read, Write};
use std::sync::Arc;

/// A store of named entries, such as a local directory or an object store.
///
/// Every failure is an [`io::Error`]. A missing entry must be reported with
/// [`io::ErrorKind::NotFound`], the result backend relies on that kind to tell
/// "no result yet" apart from real failures.
pub trait StorageBackend: Send + Sync {
    /// Short name used in log lines, e.g. `"filesystem"`.
    fn kind(&self) -> &'static str;

    /// Open an entry for reading.
    fn reader(&self, name: &str) -> io::Result<Box<dyn Read + '_>>;

    /// Open an entry for writing, creating it or truncating existing content.
    fn writer(&self, name: &str) -> io::Result<Box<dyn Write + '_>>;

    fn delete(&self, name: &str) -> io::Result<()>;

    /// List the directories and files directly under `path`, each sorted.
    fn listdir(&self, path: &str) -> io::Result<(Vec<String>, Vec<String>)>;

    fn modified_time(&self, name: &str) -> io::Result<DateTime<Utc>>;
}

macro_rules! forward_storage_backend {
    ($($wrapper:ident),*) => {$(
        impl<T: StorageBackend + ?Sized> StorageBackend for $wrapper<T> {
            fn kind(&self) -> &'static str {
                (**self).kind()
            }
            fn reader(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
                (**self).reader(name)
            }
            fn writer(&self, name: &str) -> io::Result<Box<dyn Write + '_>> {
                (**self).writer(name)
            }
            fn delete(&self, name: &str) -> io::Result<()> {
                (**self).delete(name)
            }
            fn listdir(&self, path: &str) -> io::Result<(Vec<String>, Vec<String>)> {
                (**self).listdir(path)
            }
            fn modified_time(&self, name: &str) -> io::Result<DateTime<Utc>> {
                (**self).modified_time(name)
            }
        }
    )*};
}

forward_storage_backend!(Box, Arc);

/// Reject names that would escape the provider root.
pub(crate) fn validate_name(name: &str) -> io::Result<()> {
    let escapes = name.is_empty()
        || name.starts_with('/')
        || name.starts_with('\\')
        || name.split(['/', '\\']).any(|part| part == "..");
    if escapes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid entry name {name:?}"),
        ));
    }
    Ok(())
}
