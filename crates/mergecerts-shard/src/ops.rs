//! Filesystem operations used by the merger.
//!
//! Every mutation a merge performs goes through [`FsOps`]:
//!
//! - **HardLinkOps**: the real syscalls, no copy fallback
//! - **DryRunOps**: logs and records, touches nothing
//!
//! # Usage
//!
//! ```ignore
//! use mergecerts_shard::ops::get_ops;
//!
//! let ops = get_ops(false);
//! ops.hard_link(source, target)?;
//! ```

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat::Mode;

use crate::log_merge_info;

/// Mode for every directory the merger creates (before umask).
pub const SHARD_DIR_MODE: u32 = 0o755;

// ============================================================================
// FsOps Trait
// ============================================================================

/// The metadata operations a merge is built from
pub trait FsOps {
    /// Create a single directory with [`SHARD_DIR_MODE`].
    ///
    /// An existing entry at `path` counts as success.
    fn create_dir(&self, path: &Path) -> io::Result<()>;

    /// Create `link` as a new name for `original`.
    ///
    /// Must fail if `link` already exists.
    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    /// Name of this implementation (for logging/debugging)
    fn name(&self) -> &'static str;
}

// ============================================================================
// Real Implementation
// ============================================================================

/// Direct syscalls: `mkdir(2)`, `link(2)`, `rename(2)`, `unlink(2)`
pub struct HardLinkOps;

impl FsOps for HardLinkOps {
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        match nix::unistd::mkdir(path, Mode::from_bits_truncate(SHARD_DIR_MODE)) {
            Ok(()) | Err(Errno::EEXIST) => Ok(()),
            Err(errno) => Err(io::Error::from(errno)),
        }
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        fs::hard_link(original, link)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn name(&self) -> &'static str {
        "hardlink"
    }
}

// ============================================================================
// Dry Run Implementation
// ============================================================================

/// A recorded operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsOp {
    CreateDir(PathBuf),
    HardLink { original: PathBuf, link: PathBuf },
    Rename { from: PathBuf, to: PathBuf },
    RemoveFile(PathBuf),
}

impl std::fmt::Display for FsOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FsOp::CreateDir(path) => write!(f, "mkdir {}", path.display()),
            FsOp::HardLink { original, link } => {
                write!(f, "link {} {}", original.display(), link.display())
            }
            FsOp::Rename { from, to } => write!(f, "rename {} {}", from.display(), to.display()),
            FsOp::RemoveFile(path) => write!(f, "unlink {}", path.display()),
        }
    }
}

/// Records operations instead of performing them.
#[derive(Debug, Default)]
pub struct DryRunOps {
    log: RefCell<Vec<FsOp>>,
}

impl DryRunOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything that would have been done, in order.
    pub fn operations(&self) -> Vec<FsOp> {
        self.log.borrow().clone()
    }

    fn record(&self, op: FsOp) {
        self.log.borrow_mut().push(op);
    }
}

impl FsOps for DryRunOps {
    fn create_dir(&self, path: &Path) -> io::Result<()> {
        log_merge_info!("dry-run mkdir", path = tracing::field::display(path.display()));
        self.record(FsOp::CreateDir(path.to_path_buf()));
        Ok(())
    }

    fn hard_link(&self, original: &Path, link: &Path) -> io::Result<()> {
        log_merge_info!(
            "dry-run link",
            original = tracing::field::display(original.display()),
            link = tracing::field::display(link.display()),
        );
        self.record(FsOp::HardLink {
            original: original.to_path_buf(),
            link: link.to_path_buf(),
        });
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        log_merge_info!(
            "dry-run rename",
            from = tracing::field::display(from.display()),
            to = tracing::field::display(to.display()),
        );
        self.record(FsOp::Rename {
            from: from.to_path_buf(),
            to: to.to_path_buf(),
        });
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        log_merge_info!("dry-run unlink", path = tracing::field::display(path.display()));
        self.record(FsOp::RemoveFile(path.to_path_buf()));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

// ============================================================================
// Factory Function
// ============================================================================

/// Pick the operations backend for a run.
pub fn get_ops(dry_run: bool) -> Box<dyn FsOps> {
    if dry_run {
        Box::new(DryRunOps::new())
    } else {
        Box::new(HardLinkOps)
    }
}

// ============================================================================
// Tests
// ============================================================================
