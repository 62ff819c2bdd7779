//! Source directory enumeration.
//!
//! Only the top level of a source directory is read. Regular files become
//! [`CertFile`]s; symlinks, subdirectories and special files are skipped.

use std::ffi::OsString;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::shard::ShardKey;
use crate::{log_scan_debug, log_scan_trace, MergeError, Result};

/// A regular file found in a source directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertFile {
    pub path: PathBuf,
    pub name: OsString,
    pub key: ShardKey,
    /// `(st_dev, st_ino)` at scan time.
    pub identity: (u64, u64),
}

/// What one source directory contained.
#[derive(Debug, Default)]
pub struct SourceScan {
    pub files: Vec<CertFile>,
    pub skipped: u64,
}

/// Enumerate `dir` and validate every regular file name.
///
/// Entries come back sorted by name. The directory handle is closed before
/// this returns.
pub fn scan_source(dir: &Path) -> Result<SourceScan> {
    let mut scan = SourceScan::default();

    let walker = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = entry.map_err(|e| MergeError::ReadDir {
            path: dir.to_path_buf(),
            source: io::Error::from(e),
        })?;

        if !entry.file_type().is_file() {
            log_scan_trace!(
                "Skipping non-regular entry",
                path = tracing::field::display(entry.path().display()),
            );
            scan.skipped += 1;
            continue;
        }

        let name = entry.file_name().to_os_string();
        let key = ShardKey::from_name(&name).map_err(|reason| MergeError::InvalidName {
            name: name.clone(),
            dir: dir.to_path_buf(),
            reason,
        })?;

        let metadata = entry.metadata().map_err(|e| MergeError::Probe {
            path: entry.path().to_path_buf(),
            source: io::Error::from(e),
        })?;

        scan.files.push(CertFile {
            path: entry.into_path(),
            name,
            key,
            identity: (metadata.dev(), metadata.ino()),
        });
    }

    log_scan_debug!(
        "Scanned source",
        dir = tracing::field::display(dir.display()),
        files = scan.files.len(),
        skipped = scan.skipped,
    );

    Ok(scan)
}
