use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Sink for push lifecycle events. All hooks default to no-ops so callers
/// implement only what they observe.
pub trait SyncLogger: Send + Sync {
    fn push_start(&self, _root: &Path, _remote_dir: &str) {}
    fn copied(&self, _path: &Path, _bytes: u64) {}
    fn removed(&self, _path: &Path) {}
    fn removed_all(&self, _remote_dir: &str) {}
    fn error(&self, _context: &str, _msg: &str) {}
    fn done(&self, _actions: u64, _changed: bool) {}
}

pub struct NoopLogger;
impl SyncLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {}", parent.display()))?;
            }
            _ => {}
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening log {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn line(&self, s: &str) {
        // a panic mid-write poisons the lock but leaves the file usable
        let mut file = match self.file.lock() {
            Ok(file) => file,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(file, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl SyncLogger for TextLogger {
    fn push_start(&self, root: &Path, remote_dir: &str) {
        self.line(&format!("START root={} remote={}", root.display(), remote_dir));
    }
    fn copied(&self, path: &Path, bytes: u64) {
        self.line(&format!("COPY path={} bytes={}", path.display(), bytes));
    }
    fn removed(&self, path: &Path) {
        self.line(&format!("REMOVE path={}", path.display()));
    }
    fn removed_all(&self, remote_dir: &str) {
        self.line(&format!("REMOVE_ALL remote={remote_dir}"));
    }
    fn error(&self, context: &str, msg: &str) {
        self.line(&format!("ERROR ctx={context} msg={msg}"));
    }
    fn done(&self, actions: u64, changed: bool) {
        self.line(&format!("DONE actions={actions} changed={changed}"));
    }
}
