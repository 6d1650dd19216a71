//! Producer side of the push pipeline
//!
//! A `Pusher` scans the local tree on its own thread, started eagerly at
//! construction so scanning overlaps with remote command start-up, and
//! feeds a bounded action queue. `push` wires that queue into a `Remote`
//! consumer and reports whether anything was sent.
//!
//! Three strategies produce actions: exact (caller-computed change sets),
//! force (remove everything, copy everything), and indexed (diff against
//! the persisted index from the previous push).

use crate::fileset::FileSet;
use crate::index::{FileSnapshot, Index};
use crate::remote::Remote;
use anyhow::{anyhow, Context, Result};
use std::fs::{self, Metadata};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Queue depth decoupling the scanner from transmission; a slow remote
/// blocks the scanner once this fills, bounding memory for any tree size.
const QUEUE_CAPACITY: usize = 1024;

/// One unit of work flowing from producer to consumer. Copy carries the
/// metadata captured at scan time so the consumer builds tar headers
/// without re-statting.
#[derive(Debug, Clone)]
pub enum Action {
    Copy(PathBuf, Metadata),
    Remove(PathBuf),
    RemoveAll,
}

/// The distinct error used to unwind both sides of the pipeline; callers
/// can `downcast_ref::<Cancelled>()` it out of an `anyhow::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("push cancelled")]
pub struct Cancelled;

/// One-shot, idempotent cancellation flag shared by both sides of the
/// pipeline. Cloning hands out another reference to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Producer-side handle to the action queue.
struct ActionSender {
    tx: mpsc::SyncSender<Action>,
    sent: Arc<AtomicU64>,
    cancel: CancelHandle,
}

impl ActionSender {
    /// Enqueue an action. Cancellation is observed here, at the enqueue
    /// attempt, so a producer blocked on a full queue still unwinds; a
    /// consumer that dropped its receiver unblocks us the same way.
    fn send(&self, action: Action) -> Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        let mut action = action;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            match self.tx.try_send(action) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Full(back)) => {
                    action = back;
                    thread::sleep(Duration::from_millis(1));
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(anyhow!("action queue closed by consumer"));
                }
            }
        }
    }
}

/// A push in flight: a producer thread filling a bounded queue, waiting to
/// be wired to a consumer.
pub struct Pusher {
    rx: mpsc::Receiver<Action>,
    producer: thread::JoinHandle<Result<Option<Index>>>,
    sent: Arc<AtomicU64>,
    cancel: CancelHandle,
}

impl Pusher {
    /// Exact strategy: realize a caller-computed change set, ignoring any
    /// index. Copy paths that vanished before the scan are skipped; remove
    /// paths are emitted as-is (`rm -rf` tolerates absence).
    pub fn exact(copy_list: Vec<PathBuf>, remove_list: Vec<PathBuf>) -> Self {
        Self::spawn(move |tx| {
            for path in copy_list {
                let meta = match fs::symlink_metadata(&path) {
                    Ok(meta) => meta,
                    Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        return Err(err).with_context(|| format!("stat {}", path.display()))
                    }
                };
                tx.send(Action::Copy(path, meta))?;
            }
            for path in remove_list {
                tx.send(Action::Remove(path))?;
            }
            Ok(None)
        })
    }

    /// Force strategy: one RemoveAll, then copy every non-ignored file. No
    /// diffing, no index.
    pub fn force(file_set: FileSet) -> Self {
        Self::spawn(move |tx| {
            force_producer(&file_set, tx)?;
            Ok(None)
        })
    }

    /// Index strategy: diff the tree against the index persisted by the
    /// previous push. An unreadable index degrades to force behavior. The
    /// on-disk index is removed up front either way, so a failed push
    /// forces a full resync next time; only `push` writes the new one, and
    /// only after the transfer succeeds.
    pub fn indexed(file_set: FileSet, index_path: PathBuf) -> Self {
        Self::spawn(move |tx| {
            let mut old = Index::new(&index_path);
            let force = old.load().is_err();
            let _ = fs::remove_file(&index_path);

            if force {
                tx.send(Action::RemoveAll)?;
            }

            let mut new = Index::new(&index_path);
            file_set.walk(|path, meta| {
                let snapshot = FileSnapshot::of(meta)?;
                new.put(path, snapshot.clone())?;
                if old.modified(path, &snapshot) {
                    tx.send(Action::Copy(path.to_path_buf(), meta.clone()))?;
                }
                Ok(())
            })?;

            for key in old.entries().keys() {
                if !new.entries().contains_key(key) {
                    tx.send(Action::Remove(old.absolute(key)))?;
                }
            }
            Ok(Some(new))
        })
    }

    fn spawn<F>(producer: F) -> Self
    where
        F: FnOnce(&ActionSender) -> Result<Option<Index>> + Send + 'static,
    {
        let (tx, rx) = mpsc::sync_channel(QUEUE_CAPACITY);
        let sent = Arc::new(AtomicU64::new(0));
        let cancel = CancelHandle::default();
        let sender = ActionSender {
            tx,
            sent: Arc::clone(&sent),
            cancel: cancel.clone(),
        };
        let producer = thread::spawn(move || producer(&sender));
        Pusher {
            rx,
            producer,
            sent,
            cancel,
        }
    }

    /// Shared cancellation token; usable from any thread, before or during
    /// `push`.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drive the pipeline to completion: start the consumer, wait for the
    /// producer, let the queue close, wait for the consumer. A consumer
    /// error takes precedence over a producer error. Returns whether any
    /// action was sent.
    pub fn push(self, remote: Remote) -> Result<bool> {
        let Pusher {
            rx,
            producer,
            sent,
            ..
        } = self;
        let logger = remote.logger();

        let consumer = thread::spawn(move || remote.run(rx));

        // Producer exit drops the last sender: the queue closes exactly
        // once no matter how the producer ended, so the consumer always
        // drains to EOF instead of blocking forever.
        let producer_result = producer
            .join()
            .map_err(|_| anyhow!("producer thread panicked"))
            .and_then(|result| result);
        let consumer_result = consumer
            .join()
            .map_err(|_| anyhow!("consumer thread panicked"))
            .and_then(|result| result);

        if let Err(err) = consumer_result {
            logger.error("remote", &format!("{err:#}"));
            return Err(err);
        }
        let new_index = match producer_result {
            Ok(index) => index,
            Err(err) => {
                logger.error("scan", &format!("{err:#}"));
                return Err(err);
            }
        };

        // The on-disk index advances here and nowhere else.
        if let Some(index) = new_index {
            index.save()?;
        }

        let sent = sent.load(Ordering::SeqCst);
        let changed = sent > 0;
        logger.done(sent, changed);
        Ok(changed)
    }
}

fn force_producer(file_set: &FileSet, tx: &ActionSender) -> Result<()> {
    tx.send(Action::RemoveAll)?;
    file_set.walk(|path, meta| tx.send(Action::Copy(path.to_path_buf(), meta.clone())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileset::slashed;
    use std::collections::BTreeSet;
    use std::fs;
    use std::path::Path;

    /// Drain a pusher without a remote: collect its actions, join its
    /// producer, and hand back the new index (if the strategy built one).
    fn drain(pusher: Pusher) -> (Vec<Action>, Result<Option<Index>>) {
        let actions: Vec<Action> = pusher.rx.iter().collect();
        let produced = pusher
            .producer
            .join()
            .map_err(|_| anyhow!("producer thread panicked"))
            .and_then(|result| result);
        (actions, produced)
    }

    fn copies(actions: &[Action], root: &Path) -> BTreeSet<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Copy(path, _) => {
                    Some(slashed(path.strip_prefix(root).unwrap_or(path)))
                }
                _ => None,
            })
            .collect()
    }

    fn removes(actions: &[Action], root: &Path) -> BTreeSet<String> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Remove(path) => {
                    Some(slashed(path.strip_prefix(root).unwrap_or(path)))
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn force_emits_remove_all_then_every_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"aaaa").unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/b.txt"), b"bbbb").unwrap();

        let set = FileSet::new(tmp.path(), Vec::<String>::new()).unwrap();
        let (actions, _) = drain(Pusher::force(set));

        assert!(matches!(actions[0], Action::RemoveAll));
        assert_eq!(
            copies(&actions, tmp.path()),
            ["a.txt", "sub", "sub/b.txt"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
        assert_eq!(actions.len(), 4);
    }

    #[test]
    fn exact_skips_vanished_copies() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("here.txt"), b"x").unwrap();

        let pusher = Pusher::exact(
            vec![tmp.path().join("here.txt"), tmp.path().join("gone.txt")],
            vec![tmp.path().join("old.txt")],
        );
        let (actions, produced) = drain(pusher);
        produced.unwrap();

        assert_eq!(copies(&actions, tmp.path()), ["here.txt".to_string()].into());
        assert_eq!(removes(&actions, tmp.path()), ["old.txt".to_string()].into());
    }

    #[test]
    fn indexed_first_push_is_forced() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("a.txt"), b"0123456789").unwrap();

        let set = FileSet::new(tmp.path(), Vec::<String>::new()).unwrap();
        let index_path = tmp.path().join(".push-index.json");
        let (actions, produced) = drain(Pusher::indexed(set, index_path));

        assert!(matches!(actions[0], Action::RemoveAll));
        assert!(copies(&actions, tmp.path()).contains("a.txt"));
        assert!(produced.unwrap().is_some());
    }

    #[test]
    fn indexed_diff_scenario() {
        // a.txt (10 bytes) and b.txt (20 bytes), ignoring b.txt.
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), vec![b'a'; 10]).unwrap();
        fs::write(root.join("b.txt"), vec![b'b'; 20]).unwrap();
        let index_path = tmp.path().join("index.json");

        let set = FileSet::new(&root, ["b.txt"]).unwrap();

        // First push: only a.txt is copied.
        let (actions, produced) = drain(Pusher::indexed(set.clone(), index_path.clone()));
        assert_eq!(copies(&actions, &root), ["a.txt".to_string()].into());
        produced.unwrap().unwrap().save().unwrap();

        // Second push, nothing changed: no actions at all.
        let (actions, produced) = drain(Pusher::indexed(set.clone(), index_path.clone()));
        assert!(actions.is_empty(), "expected no actions, got {actions:?}");
        produced.unwrap().unwrap().save().unwrap();

        // Delete a.txt, add c.txt: one remove, one copy.
        fs::remove_file(root.join("a.txt")).unwrap();
        fs::write(root.join("c.txt"), b"c").unwrap();
        let (actions, _) = drain(Pusher::indexed(set, index_path));
        assert_eq!(copies(&actions, &root), ["c.txt".to_string()].into());
        assert_eq!(removes(&actions, &root), ["a.txt".to_string()].into());
    }

    #[test]
    fn indexed_detects_mtime_change() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("tree");
        fs::create_dir(&root).unwrap();
        fs::write(root.join("a.txt"), b"same size").unwrap();
        let index_path = tmp.path().join("index.json");

        let set = FileSet::new(&root, Vec::<String>::new()).unwrap();
        let (_, produced) = drain(Pusher::indexed(set.clone(), index_path.clone()));
        produced.unwrap().unwrap().save().unwrap();

        filetime::set_file_mtime(
            root.join("a.txt"),
            filetime::FileTime::from_unix_time(1_600_000_000, 0),
        )
        .unwrap();

        let (actions, _) = drain(Pusher::indexed(set, index_path));
        assert_eq!(copies(&actions, &root), ["a.txt".to_string()].into());
    }

    #[test]
    fn ignored_paths_never_produce_actions() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir_all(tmp.path().join("skip/deep")).unwrap();
        fs::write(tmp.path().join("skip/deep/x.bin"), b"x").unwrap();
        fs::write(tmp.path().join("a.txt"), b"a").unwrap();

        let set = FileSet::new(tmp.path(), ["skip"]).unwrap();
        let (actions, _) = drain(Pusher::force(set));
        for action in &actions {
            if let Action::Copy(path, _) = action {
                assert!(!path.to_string_lossy().contains("skip"), "{path:?}");
            }
        }
        assert_eq!(copies(&actions, tmp.path()), ["a.txt".to_string()].into());
    }

    #[test]
    fn cancellation_unwinds_a_blocked_producer() {
        // More files than the queue holds and no consumer: the producer
        // must be blocked on a full queue when cancel arrives.
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..(QUEUE_CAPACITY + 64) {
            fs::write(tmp.path().join(format!("f{i}.txt")), b"x").unwrap();
        }

        let set = FileSet::new(tmp.path(), Vec::<String>::new()).unwrap();
        let pusher = Pusher::force(set);
        std::thread::sleep(Duration::from_millis(50));
        pusher.cancel();
        pusher.cancel(); // idempotent

        let err = pusher
            .producer
            .join()
            .unwrap()
            .expect_err("cancelled producer must error");
        assert!(err.downcast_ref::<Cancelled>().is_some(), "{err:#}");
    }

    #[test]
    fn dropped_consumer_unblocks_producer() {
        let tmp = tempfile::tempdir().unwrap();
        for i in 0..(QUEUE_CAPACITY + 64) {
            fs::write(tmp.path().join(format!("f{i}.txt")), b"x").unwrap();
        }

        let set = FileSet::new(tmp.path(), Vec::<String>::new()).unwrap();
        let pusher = Pusher::force(set);
        drop(pusher.rx);
        assert!(pusher.producer.join().unwrap().is_err());
    }
}
