//! In-process provider, useful for tests and for embedding the backend where
//! results do not need to outlive the process.

use chrono::{DateTime, Utc};
use log::warn;
use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Cursor, Read, Write};
use std::sync::{Mutex, MutexGuard};

use crate::storage_backend::{StorageBackend, validate_name};

struct MemoryEntry {
    data: Vec<u8>,
    modified: DateTime<Utc>,
}

type Entries = BTreeMap<String, MemoryEntry>;

#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<Entries>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the modification time of an existing entry.
    pub fn set_modified_time(&self, name: &str, modified: DateTime<Utc>) -> io::Result<()> {
        let mut entries = lock(&self.entries)?;
        let entry = entries.get_mut(name).ok_or_else(|| not_found(name))?;
        entry.modified = modified;
        Ok(())
    }

    pub fn entry_count(&self) -> io::Result<usize> {
        Ok(lock(&self.entries)?.len())
    }
}

fn lock(entries: &Mutex<Entries>) -> io::Result<MutexGuard<'_, Entries>> {
    entries
        .lock()
        .map_err(|_| io::Error::other("memory storage lock poisoned"))
}

fn not_found(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("no entry named {name:?}"))
}

/// Buffers written bytes and swaps them in as the whole entry on flush or
/// drop, so readers never see a partial value and the last writer wins.
struct MemoryWriter<'a> {
    entries: &'a Mutex<Entries>,
    name: String,
    buffer: Vec<u8>,
    pending: bool,
}

impl MemoryWriter<'_> {
    fn commit(&mut self) -> io::Result<()> {
        lock(self.entries)?.insert(
            self.name.clone(),
            MemoryEntry {
                data: self.buffer.clone(),
                modified: Utc::now(),
            },
        );
        self.pending = false;
        Ok(())
    }
}

impl Write for MemoryWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        self.pending = true;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.pending {
            self.commit()?;
        }
        Ok(())
    }
}

impl Drop for MemoryWriter<'_> {
    fn drop(&mut self) {
        if self.pending
            && let Err(err) = self.commit()
        {
            warn!("Failed to store memory entry {}: {}", self.name, err);
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn reader(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
        validate_name(name)?;
        let entries = lock(&self.entries)?;
        let entry = entries.get(name).ok_or_else(|| not_found(name))?;
        Ok(Box::new(Cursor::new(entry.data.clone())))
    }

    fn writer(&self, name: &str) -> io::Result<Box<dyn Write + '_>> {
        validate_name(name)?;
        // An opened writer stores an empty entry even if nothing is written
        Ok(Box::new(MemoryWriter {
            entries: &self.entries,
            name: name.to_string(),
            buffer: Vec::new(),
            pending: true,
        }))
    }

    fn delete(&self, name: &str) -> io::Result<()> {
        validate_name(name)?;
        lock(&self.entries)?
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| not_found(name))
    }

    fn listdir(&self, path: &str) -> io::Result<(Vec<String>, Vec<String>)> {
        let prefix = match path {
            "" | "." => String::new(),
            dir => {
                validate_name(dir)?;
                format!("{}/", dir.trim_end_matches('/'))
            }
        };
        let entries = lock(&self.entries)?;
        let mut dirs = BTreeSet::new();
        let mut files = Vec::new();
        for name in entries.keys() {
            let Some(rest) = name.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    dirs.insert(dir.to_string());
                }
                None => files.push(rest.to_string()),
            }
        }
        Ok((dirs.into_iter().collect(), files))
    }

    fn modified_time(&self, name: &str) -> io::Result<DateTime<Utc>> {
        validate_name(name)?;
        let entries = lock(&self.entries)?;
        entries
            .get(name)
            .map(|entry| entry.modified)
            .ok_or_else(|| not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn write_then_read() {
        let backend = MemoryBackend::new();
        backend.writer("key").unwrap().write_all(b"value").unwrap();

        let mut content = String::new();
        backend
            .reader("key")
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        assert_eq!(content, "value");
        assert_eq!(backend.entry_count().unwrap(), 1);
    }

    #[test]
    fn reopening_for_write_truncates() {
        let backend = MemoryBackend::new();
        backend.writer("key").unwrap().write_all(b"first").unwrap();
        backend.writer("key").unwrap().write_all(b"2").unwrap();

        let mut content = Vec::new();
        backend
            .reader("key")
            .unwrap()
            .read_to_end(&mut content)
            .unwrap();
        assert_eq!(content, b"2");
    }

    fn read_string(backend: &MemoryBackend, name: &str) -> String {
        let mut content = String::new();
        backend
            .reader(name)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    #[test]
    fn overlapping_writers_last_write_wins() {
        let backend = MemoryBackend::new();
        let mut started = backend.writer("celery-task-meta-1").unwrap();
        let mut success = backend.writer("celery-task-meta-1").unwrap();
        started.write_all(br#"{"status": "STARTED"}"#).unwrap();
        success.write_all(br#"{"status": "SUCCESS"}"#).unwrap();
        started.flush().unwrap();
        success.flush().unwrap();
        drop(started);
        drop(success);

        assert_eq!(
            read_string(&backend, "celery-task-meta-1"),
            r#"{"status": "SUCCESS"}"#
        );
    }

    #[test]
    fn readers_never_see_partial_values() {
        let backend = MemoryBackend::new();
        backend.writer("key").unwrap().write_all(b"old").unwrap();

        let mut writer = backend.writer("key").unwrap();
        writer.write_all(b"new ").unwrap();
        assert_eq!(read_string(&backend, "key"), "old");
        writer.write_all(b"value").unwrap();
        drop(writer);

        assert_eq!(read_string(&backend, "key"), "new value");
    }

    #[test]
    fn poisoned_lock_is_reported() {
        let backend = MemoryBackend::new();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = backend.entries.lock().unwrap();
            panic!("poison");
        }));
        assert_eq!(
            backend.entry_count().unwrap_err().kind(),
            io::ErrorKind::Other
        );
    }

    #[test]
    fn missing_entries_are_not_found() {
        let backend = MemoryBackend::new();
        assert_eq!(
            backend.reader("nope").err().unwrap().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            backend.delete("nope").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(
            backend.modified_time("nope").unwrap_err().kind(),
            io::ErrorKind::NotFound
        );
        assert_eq!(backend.entry_count().unwrap(), 0);
    }

    #[test]
    fn listdir_groups_nested_names() {
        let backend = MemoryBackend::new();
        for name in ["b", "a", "dir/x", "dir/y", "other/z"] {
            backend.writer(name).unwrap().write_all(b"").unwrap();
        }

        let (dirs, files) = backend.listdir(".").unwrap();
        assert_eq!(dirs, vec!["dir".to_string(), "other".to_string()]);
        assert_eq!(files, vec!["a".to_string(), "b".to_string()]);

        let (dirs, files) = backend.listdir("dir").unwrap();
        assert!(dirs.is_empty());
        assert_eq!(files, vec!["x".to_string(), "y".to_string()]);
    }

    #[test]
    fn modified_time_can_be_aged() {
        let backend = MemoryBackend::new();
        backend.writer("key").unwrap().write_all(b"v").unwrap();
        let old = Utc::now() - Duration::days(3);
        backend.set_modified_time("key", old).unwrap();
        assert_eq!(backend.modified_time("key").unwrap(), old);
    }
}
