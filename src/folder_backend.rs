use chrono::{DateTime, Utc};
use log::trace;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::storage_backend::{StorageBackend, validate_name};

/// Stores every entry as a file directly under `base_path`.
pub struct FolderBackend {
    base_path: PathBuf,
}

impl FolderBackend {
    /// Create the backend, creating `base_path` if it does not exist yet.
    pub fn new(base_path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = base_path.into();
        trace!("Creating storage directory {:?}", base_path);
        std::fs::create_dir_all(&base_path)?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn entry_path(&self, name: &str) -> io::Result<PathBuf> {
        validate_name(name)?;
        Ok(self.base_path.join(name))
    }

    fn dir_path(&self, path: &str) -> io::Result<PathBuf> {
        if path.is_empty() || path == "." {
            return Ok(self.base_path.clone());
        }
        self.entry_path(path)
    }
}

impl StorageBackend for FolderBackend {
    fn kind(&self) -> &'static str {
        "filesystem"
    }

    fn reader(&self, name: &str) -> io::Result<Box<dyn Read + '_>> {
        let path = self.entry_path(name)?;
        let file = File::open(path)?;
        file.lock_shared()?;
        Ok(Box::new(file))
    }

    fn writer(&self, name: &str) -> io::Result<Box<dyn Write + '_>> {
        let path = self.entry_path(name)?;
        trace!("Writing to path {:?}", path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        // Truncate only once no reader holds the file
        file.lock()?;
        file.set_len(0)?;

        Ok(Box::new(file))
    }

    fn delete(&self, name: &str) -> io::Result<()> {
        let path = self.entry_path(name)?;
        trace!("Removing {:?}", path);
        std::fs::remove_file(path)
    }

    fn listdir(&self, path: &str) -> io::Result<(Vec<String>, Vec<String>)> {
        let dir = self.dir_path(path)?;
        let mut dirs = Vec::new();
        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type()?.is_dir() {
                dirs.push(name);
            } else {
                files.push(name);
            }
        }
        dirs.sort();
        files.sort();
        Ok((dirs, files))
    }

    fn modified_time(&self, name: &str) -> io::Result<DateTime<Utc>> {
        let path = self.entry_path(name)?;
        let modified = std::fs::metadata(path)?.modified()?;
        Ok(DateTime::<Utc>::from(modified))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_all(backend: &FolderBackend, name: &str) -> String {
        let mut content = String::new();
        backend
            .reader(name)
            .unwrap()
            .read_to_string(&mut content)
            .unwrap();
        content
    }

    #[test]
    fn creates_root_on_construction() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path().join("celery-results");
        let backend = FolderBackend::new(&root).unwrap();
        assert!(root.is_dir());
        assert_eq!(backend.base_path(), root.as_path());
    }

    #[test]
    fn write_truncates_previous_content() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path()).unwrap();

        backend
            .writer("entry")
            .unwrap()
            .write_all(b"a much longer first value")
            .unwrap();
        backend.writer("entry").unwrap().write_all(b"short").unwrap();

        assert_eq!(read_all(&backend, "entry"), "short");
        assert!(temp_dir.path().join("entry").is_file());
    }

    #[test]
    fn missing_entry_reports_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path()).unwrap();

        let err = backend.reader("nothing").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        let err = backend.delete("nothing").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(!temp_dir.path().join("nothing").exists());
    }

    #[test]
    fn listdir_splits_dirs_and_files() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path()).unwrap();
        backend.writer("b").unwrap().write_all(b"1").unwrap();
        backend.writer("a").unwrap().write_all(b"2").unwrap();
        backend.writer("sub/c").unwrap().write_all(b"3").unwrap();

        let (dirs, files) = backend.listdir(".").unwrap();
        assert_eq!(dirs, vec!["sub".to_string()]);
        assert_eq!(files, vec!["a".to_string(), "b".to_string()]);

        let (_, nested) = backend.listdir("sub").unwrap();
        assert_eq!(nested, vec!["c".to_string()]);
    }

    #[test]
    fn modified_time_is_recent() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path()).unwrap();
        backend.writer("entry").unwrap().write_all(b"x").unwrap();

        let age = Utc::now() - backend.modified_time("entry").unwrap();
        assert!(age.num_seconds() < 60);
    }

    #[test]
    fn rejects_names_outside_root() {
        let temp_dir = TempDir::new().unwrap();
        let backend = FolderBackend::new(temp_dir.path().join("root")).unwrap();
        let err = backend.writer("../escape").err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
