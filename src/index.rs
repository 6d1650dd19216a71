//! Persisted snapshot of a pushed tree
//!
//! The index maps relative paths to size+mtime snapshots and is the memory
//! between pushes: a path is "modified" when it has no entry or its stored
//! snapshot differs. Keys are relative to the index file's own directory,
//! which may sit inside the tree it describes.
//!
//! Change detection is size+mtime only, never content hashing; same-size
//! edits inside the filesystem timestamp resolution are invisible. That is
//! inherited behavior, kept on purpose.

use crate::fileset::{clean_path, relative_to, FileSet};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, Metadata};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// The comparable unit stored per path. Equality is exact on both fields;
/// the serde form of `SystemTime` round-trips bit-identically, which the
/// diff depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSnapshot {
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "ModTime")]
    pub mod_time: SystemTime,
}

impl FileSnapshot {
    pub fn of(meta: &Metadata) -> Result<Self> {
        Ok(FileSnapshot {
            size: meta.len(),
            mod_time: meta.modified().context("filesystem lacks modification times")?,
        })
    }
}

/// Path to snapshot map backed by a JSON file.
#[derive(Debug)]
pub struct Index {
    entries: HashMap<PathBuf, FileSnapshot>,
    file_path: PathBuf,
    directory: PathBuf,
}

impl Index {
    pub fn new<P: AsRef<Path>>(file_path: P) -> Self {
        let file_path = clean_path(file_path.as_ref());
        let directory = file_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Index {
            entries: HashMap::new(),
            file_path,
            directory,
        }
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    pub fn entries(&self) -> &HashMap<PathBuf, FileSnapshot> {
        &self.entries
    }

    /// Entry key for `path`: relative to the index directory, not to any
    /// walk root.
    fn key(&self, path: &Path) -> Result<PathBuf> {
        relative_to(&self.directory, path)
            .with_context(|| format!("relativizing {} for the index", path.display()))
    }

    /// Absolute form of a stored key.
    pub fn absolute(&self, key: &Path) -> PathBuf {
        clean_path(&self.directory.join(key))
    }

    pub fn put(&mut self, path: &Path, snapshot: FileSnapshot) -> Result<()> {
        let key = self.key(path)?;
        self.entries.insert(key, snapshot);
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<&FileSnapshot> {
        let key = self.key(path).ok()?;
        self.entries.get(&key)
    }

    /// Whether `path` changed since this index was recorded: no entry, or
    /// an entry whose snapshot differs.
    pub fn modified(&self, path: &Path, snapshot: &FileSnapshot) -> bool {
        match self.get(path) {
            Some(stored) => stored != snapshot,
            None => true,
        }
    }

    /// Rebuild the entry map from a walk of `file_set`.
    pub fn update(&mut self, file_set: &FileSet) -> Result<()> {
        self.entries.clear();
        file_set.walk(|path, meta| self.put(path, FileSnapshot::of(meta)?))
    }

    /// Load entries from the backing file. On ANY failure the backing file
    /// is deleted so a corrupt index can never wedge every future push;
    /// callers fall back to a full resync.
    pub fn load(&mut self) -> Result<()> {
        self.entries.clear();
        let result = (|| -> Result<HashMap<PathBuf, FileSnapshot>> {
            let file = File::open(&self.file_path)
                .with_context(|| format!("opening index {}", self.file_path.display()))?;
            serde_json::from_reader(file)
                .with_context(|| format!("decoding index {}", self.file_path.display()))
        })();
        match result {
            Ok(entries) => {
                self.entries = entries;
                Ok(())
            }
            Err(err) => {
                let _ = fs::remove_file(&self.file_path);
                Err(err)
            }
        }
    }

    /// Write entries to the backing file. A partially-written file is
    /// deleted rather than left behind as a corrupt index.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(&self.file_path)
            .with_context(|| format!("creating index {}", self.file_path.display()))?;
        if let Err(err) = serde_json::to_writer(file, &self.entries) {
            let _ = fs::remove_file(&self.file_path);
            return Err(err)
                .with_context(|| format!("encoding index {}", self.file_path.display()));
        }
        Ok(())
    }
}
