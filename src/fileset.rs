//! File enumeration with ignore rules
//!
//! A `FileSet` is a root directory plus shell-glob ignore patterns. Walking
//! it visits every non-ignored descendant (never the root itself); ignored
//! directories are pruned without descending into them.

use anyhow::{bail, Context, Result};
use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use std::fs::Metadata;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

/// Root directory plus compiled ignore rules.
#[derive(Debug, Clone)]
pub struct FileSet {
    root: PathBuf,
    ignores: GlobSet,
}

impl FileSet {
    /// Build a file set. Patterns are shell globs relative to `root`; both
    /// `/` and `\` are accepted as separators. Malformed patterns fail here,
    /// not at walk time.
    pub fn new<P, I, S>(root: P, ignore_patterns: I) -> Result<Self>
    where
        P: AsRef<Path>,
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let root = clean_path(root.as_ref());
        let mut builder = GlobSetBuilder::new();
        for pattern in ignore_patterns {
            let normalized = pattern.as_ref().replace('\\', "/");
            let glob = GlobBuilder::new(&normalized)
                .literal_separator(true)
                .build()
                .with_context(|| format!("invalid ignore pattern {:?}", pattern.as_ref()))?;
            builder.add(glob);
        }
        let ignores = builder.build().context("compiling ignore patterns")?;
        Ok(FileSet { root, ignores })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path relative to the walk root.
    pub fn relative(&self, path: &Path) -> Result<PathBuf> {
        relative_to(&self.root, path)
    }

    fn ignored(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        if rel.as_os_str().is_empty() {
            return false;
        }
        self.ignores.is_match(slashed(rel))
    }

    /// Recursively visit every non-ignored entry under the root. The root
    /// itself is never visited. A path that vanishes between listing and
    /// stat is skipped, not an error; any other filesystem error aborts the
    /// walk.
    pub fn walk<F>(&self, mut visit: F) -> Result<()>
    where
        F: FnMut(&Path, &Metadata) -> Result<()>,
    {
        let walker = WalkDir::new(&self.root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| !self.ignored(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) if vanished(&err) => continue,
                Err(err) => {
                    return Err(err).with_context(|| {
                        format!("walking {}", self.root.display())
                    })
                }
            };
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) if vanished(&err) => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("stat {}", entry.path().display()))
                }
            };
            visit(entry.path(), &meta)?;
        }
        Ok(())
    }
}

fn vanished(err: &walkdir::Error) -> bool {
    err.io_error()
        .map(|io| io.kind() == io::ErrorKind::NotFound)
        .unwrap_or(false)
}

/// Lexically clean a path: resolve `.` and `..` components without touching
/// the filesystem.
pub fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // the parent of the root is the root
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// Compute `path` relative to `base`, allowing `..` steps (the index file's
/// directory is not necessarily an ancestor of the walked tree).
pub fn relative_to(base: &Path, path: &Path) -> Result<PathBuf> {
    let base = clean_path(base);
    let path = clean_path(path);
    if base.is_absolute() != path.is_absolute() {
        bail!(
            "cannot relativize {} against {}: mixed absolute and relative",
            path.display(),
            base.display()
        );
    }

    // a cleaned path can still be a lone ".", which must count as zero steps
    let mut base_parts = base
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .peekable();
    let mut path_parts = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .peekable();
    while let (Some(b), Some(p)) = (base_parts.peek(), path_parts.peek()) {
        if b != p {
            break;
        }
        base_parts.next();
        path_parts.next();
    }

    let mut out = PathBuf::new();
    for component in base_parts {
        if matches!(component, Component::ParentDir) {
            bail!(
                "cannot relativize {} against {}: base escapes upward",
                path.display(),
                base.display()
            );
        }
        out.push("..");
    }
    for component in path_parts {
        out.push(component.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    Ok(out)
}

/// Forward-slash form of a relative path, for the wire.
pub fn slashed(path: &Path) -> String {
    let parts: Vec<String> = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    parts.join("/")
}
