//! Consumer side of the push pipeline
//!
//! A `Remote` realizes the action stream against a remote filesystem over
//! two byte streams: a POSIX tar archive piped into `tar xf - -C <dir>`
//! and a NUL-delimited path list piped into `xargs -0 rm -rf`. Actual
//! command execution is delegated to a caller-supplied primitive; the two
//! commands run on background threads fed through in-process pipes.

use crate::fileset::{slashed, FileSet};
use crate::logger::SyncLogger;
use crate::pipe::{pipe, PipeReader, PipeWriter};
use crate::pusher::Action;
use anyhow::{anyhow, Context, Result};
use std::fs::{self, File, Metadata};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// The execution primitive: run `cmd` to completion inside the target
/// environment with the given standard streams. Called exactly twice per
/// `Remote`, once for the tar extractor and once for the path remover.
pub trait Execute: Send + Sync {
    fn execute(
        &self,
        cmd: &[String],
        stdin: Box<dyn io::Read + Send>,
        stdout: Box<dyn io::Write + Send>,
        stderr: Box<dyn io::Write + Send>,
    ) -> Result<()>;
}

/// Glob triple matching every top-level entry, dotfiles included, but
/// never `.` or `..`.
const REMOVE_ALL_GLOBS: [&str; 3] = ["*", ".[!.]*", "..?*"];

/// Consumer that realizes actions against the remote filesystem.
pub struct Remote {
    file_set: FileSet,
    remote_dir: String,
    mirrors: Vec<String>,
    tar: tar::Builder<PipeWriter>,
    rm: PipeWriter,
    extract: JoinHandle<Result<()>>,
    remove: JoinHandle<Result<()>>,
    logger: Arc<dyn SyncLogger>,
}

impl Remote {
    /// Open both outbound streams and start the two remote commands. The
    /// mirror directories receive the same deletes as the primary one
    /// (cascading deletes for trees mounted in more than one place).
    pub fn new(
        executor: Arc<dyn Execute>,
        file_set: FileSet,
        remote_dir: &str,
        mirrors: &[String],
        logger: Arc<dyn SyncLogger>,
    ) -> Self {
        let remote_dir = remote_dir.trim_end_matches('/').to_string();
        let mirrors: Vec<String> = mirrors
            .iter()
            .map(|m| m.trim_end_matches('/').to_string())
            .collect();

        let (tar_writer, tar_reader) = pipe();
        let (rm_writer, rm_reader) = pipe();

        let extract = spawn_command(
            Arc::clone(&executor),
            vec![
                "tar".to_string(),
                "xf".to_string(),
                "-".to_string(),
                "-C".to_string(),
                remote_dir.clone(),
            ],
            tar_reader,
        );
        let remove = spawn_command(
            executor,
            vec![
                "xargs".to_string(),
                "-0".to_string(),
                "rm".to_string(),
                "-rf".to_string(),
            ],
            rm_reader,
        );

        logger.push_start(file_set.root(), &remote_dir);

        Remote {
            file_set,
            remote_dir,
            mirrors,
            tar: tar::Builder::new(tar_writer),
            rm: rm_writer,
            extract,
            remove,
            logger,
        }
    }

    pub fn logger(&self) -> Arc<dyn SyncLogger> {
        Arc::clone(&self.logger)
    }

    /// Consume the queue until it closes, then shut the streams down in
    /// dependency order and collect the remote command results. An error
    /// from either remote command outranks a local stream error, since it
    /// is the root cause of the broken pipe the loop would report.
    pub fn run(mut self, actions: Receiver<Action>) -> Result<()> {
        let mut loop_result = Ok(());
        for action in actions.iter() {
            let result = match action {
                Action::Copy(path, meta) => self.add(&path, &meta),
                Action::Remove(path) => self.rm(&[path]),
                Action::RemoveAll => self.remove_all(),
            };
            if let Err(err) = result {
                loop_result = Err(err);
                break;
            }
        }
        drop(actions);

        let Remote {
            tar,
            rm,
            extract,
            remove,
            ..
        } = self;

        // Archive trailer before the transport closes, then EOF both pipes.
        let finish_result = tar
            .into_inner()
            .map(drop)
            .context("finishing tar stream");
        drop(rm);

        let extract_result = join_command(extract, "tar extraction");
        let remove_result = join_command(remove, "path removal");

        extract_result
            .and(remove_result)
            .and(finish_result)
            .and(loop_result)
    }

    /// Realize a copy action as a tar entry. Directories get a header only
    /// when they have no children; non-empty directories are implied by
    /// the paths of their descendants, and giving them a header changes
    /// what the remote `tar` materializes. Protocol invariant, not an
    /// optimization.
    fn add(&mut self, path: &Path, meta: &Metadata) -> Result<()> {
        let rel = self.file_set.relative(path)?;
        let name = slashed(&rel);

        if meta.file_type().is_symlink() {
            let target = fs::read_link(path)
                .with_context(|| format!("reading link target of {}", path.display()))?;
            let target = target.to_string_lossy().replace('\\', "/");
            let mut header = tar::Header::new_gnu();
            header.set_metadata(meta);
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            self.tar
                .append_link(&mut header, Path::new(&name), Path::new(&target))
                .with_context(|| format!("archiving symlink {name}"))?;
        } else if meta.is_dir() {
            match fs::read_dir(path) {
                Ok(mut children) => {
                    if children.next().is_some() {
                        return Ok(());
                    }
                }
                // vanished since the scan; nothing to archive
                Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(err) => {
                    return Err(err).with_context(|| format!("listing {}", path.display()))
                }
            }
            let mut header = tar::Header::new_gnu();
            header.set_metadata(meta);
            self.tar
                .append_data(&mut header, Path::new(&name), io::empty())
                .with_context(|| format!("archiving directory {name}"))?;
        } else {
            let file = File::open(path)
                .with_context(|| format!("opening {}", path.display()))?;
            let mut header = tar::Header::new_gnu();
            header.set_metadata(meta);
            self.tar
                .append_data(&mut header, Path::new(&name), file)
                .with_context(|| format!("archiving {name}"))?;
        }

        self.logger.copied(path, meta.len());
        Ok(())
    }

    /// Realize a remove action: one NUL-terminated absolute path per
    /// target directory (primary plus mirrors) for `xargs -0` to consume.
    fn rm(&mut self, paths: &[PathBuf]) -> Result<()> {
        for path in paths {
            let rel = self.file_set.relative(path)?;
            let name = slashed(&rel);
            self.write_removal(&name)
                .with_context(|| format!("queueing removal of {name}"))?;
            self.logger.removed(path);
        }
        Ok(())
    }

    /// Clear the remote directory: remove every top-level entry, dotfiles
    /// included, via the glob triple.
    fn remove_all(&mut self) -> Result<()> {
        for glob in REMOVE_ALL_GLOBS {
            self.write_removal(glob)
                .context("queueing remove-all globs")?;
        }
        self.logger.removed_all(&self.remote_dir);
        Ok(())
    }

    fn write_removal(&mut self, name: &str) -> Result<()> {
        for dir in std::iter::once(&self.remote_dir).chain(self.mirrors.iter()) {
            self.rm.write_all(format!("{dir}/{name}").as_bytes())?;
            self.rm.write_all(b"\0")?;
        }
        // the removal stream is tiny; hand it to xargs without delay
        self.rm.flush()?;
        Ok(())
    }
}

fn spawn_command(
    executor: Arc<dyn Execute>,
    cmd: Vec<String>,
    stdin: PipeReader,
) -> JoinHandle<Result<()>> {
    thread::spawn(move || {
        executor.execute(
            &cmd,
            Box::new(stdin),
            Box::new(io::sink()),
            Box::new(io::sink()),
        )
    })
}

fn join_command(handle: JoinHandle<Result<()>>, what: &str) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("{what} thread panicked"))
        .and_then(|result| result.with_context(|| format!("{what} command failed")))
}
