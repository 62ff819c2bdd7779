//! # mergecerts-shard
//!
//! Merges directories of certificate files into one prefix-sharded tree,
//! deduplicating by name through hard links.
//!
//! ## Directory Layout
//!
//! ```text
//! <dest>/
//! └── ab/
//!     └── cd/
//!         └── abcd1234.0   # hard link shared with every source copy
//! ```
//!
//! A file is filed under the first two bytes of its name, then the next two.
//! No file content is ever read; every operation is a metadata operation
//! (`mkdir`, `link`, `rename`, `unlink`).

pub mod logging;
pub mod merge;
pub mod ops;
pub mod scan;
pub mod shard;

pub use merge::{merge, FileAction, MergeOptions, MergePlan, MergeReport, PlannedFile};
pub use ops::{get_ops, DryRunOps, FsOp, FsOps, HardLinkOps};
pub use scan::{scan_source, CertFile, SourceScan};
pub use shard::{InvalidReason, ShardKey, SHARD_PREFIX_LEN};

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

/// Which step of the dedup sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupStep {
    Backup,
    Link,
    RemoveBackup,
}

impl std::fmt::Display for DedupStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            DedupStep::Backup => "rename to backup",
            DedupStep::Link => "link",
            DedupStep::RemoveBackup => "remove backup",
        })
    }
}

/// Errors that abort a merge run
#[derive(Error, Debug)]
pub enum MergeError {
    #[error("{} is not a valid cert name in {}: {reason}", .name.to_string_lossy(), .dir.display())]
    InvalidName {
        name: OsString,
        dir: PathBuf,
        reason: InvalidReason,
    },

    #[error("cannot read directory {}: {source}", .path.display())]
    ReadDir { path: PathBuf, source: io::Error },

    #[error("cannot create directory {}: {source}", .path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("cannot stat {}: {source}", .path.display())]
    Probe { path: PathBuf, source: io::Error },

    #[error("error while linking {} to {}: {source}", .dst.display(), .src.display())]
    Link {
        src: PathBuf,
        dst: PathBuf,
        source: io::Error,
    },

    #[error("error while replacing {} with a link to {} ({step}): {source}", .src.display(), .dst.display())]
    Dedup {
        src: PathBuf,
        dst: PathBuf,
        step: DedupStep,
        source: io::Error,
    },

    #[error("cannot dedup {}: backup name {} is already taken", .src.display(), .backup.display())]
    BackupExists { src: PathBuf, backup: PathBuf },
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// The sharded destination tree.
#[derive(Debug, Clone)]
pub struct ShardTree {
    root: PathBuf,
}

/// Counts gathered by walking a destination tree.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeStats {
    /// Second-level shard directories.
    pub shard_dirs: u64,
    /// Regular files at shard depth.
    pub files: u64,
    /// Files that still have at least one alias outside the tree.
    pub shared_files: u64,
}

impl ShardTree {
    /// Wrap a destination root. Nothing is created until [`ShardTree::ensure_root`].
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it is missing.
    pub fn ensure_root(&self, ops: &dyn FsOps) -> Result<()> {
        ops.create_dir(&self.root).map_err(|source| MergeError::CreateDir {
            path: self.root.clone(),
            source,
        })
    }

    /// Create both shard levels for `key`; existing directories are fine.
    pub fn ensure_shard(&self, key: &ShardKey, ops: &dyn FsOps) -> Result<()> {
        for dir in [key.level1_dir(&self.root), key.shard_dir(&self.root)] {
            ops.create_dir(&dir)
                .map_err(|source| MergeError::CreateDir { path: dir, source })?;
        }
        Ok(())
    }

    /// Where a file named `name` lives in this tree.
    pub fn path_for(&self, key: &ShardKey, name: &OsStr) -> PathBuf {
        key.file_path(&self.root, name)
    }

    /// Walk `<root>/<l1>/<l2>/<file>` and count what is there.
    ///
    /// A missing root yields empty stats.
    pub fn stats(&self) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        if !self.root.exists() {
            return Ok(stats);
        }

        let walker = WalkDir::new(&self.root)
            .min_depth(2)
            .max_depth(3)
            .follow_links(false);

        for entry in walker {
            let entry = entry.map_err(|e| MergeError::ReadDir {
                path: e.path().unwrap_or(&self.root).to_path_buf(),
                source: io::Error::from(e),
            })?;

            let file_type = entry.file_type();
            if entry.depth() == 2 {
                if file_type.is_dir() {
                    stats.shard_dirs += 1;
                }
                continue;
            }
            if !file_type.is_file() {
                continue;
            }

            let metadata = entry.metadata().map_err(|e| MergeError::Probe {
                path: entry.path().to_path_buf(),
                source: io::Error::from(e),
            })?;
            stats.files += 1;
            if metadata.nlink() > 1 {
                stats.shared_files += 1;
            }
        }

        Ok(stats)
    }
}
