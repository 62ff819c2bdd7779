//! Merge planning and execution.
//!
//! A merge runs in two phases. [`MergePlan::build`] scans every source and
//! validates every name before anything is linked, so one bad name aborts
//! the run with the destination untouched. [`MergePlan::apply`] then walks
//! the files in source order and commits them one at a time. Nothing is
//! rolled back if a later file fails.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::instrument;

use crate::ops::{get_ops, FsOps};
use crate::scan::{scan_source, CertFile};
use crate::{log_merge_debug, log_merge_info, log_merge_warn, DedupStep, MergeError, Result, ShardTree};

/// Suffix of the temporary sibling a duplicate is moved to while it is relinked.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Knobs for a merge run.
#[derive(Debug, Clone, Default)]
pub struct MergeOptions {
    /// Plan and report, but leave the filesystem alone.
    pub dry_run: bool,
}

/// What happens to one source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// Destination is free: link the source into the tree.
    Link,
    /// Destination is taken: replace the source with a link to it.
    Dedup,
    /// Source is already the destination inode.
    AlreadyLinked,
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FileAction::Link => "link",
            FileAction::Dedup => "dedup",
            FileAction::AlreadyLinked => "already-linked",
        })
    }
}

#[derive(Debug, Clone)]
pub struct PlannedFile {
    pub file: CertFile,
    pub dest: PathBuf,
    pub action: FileAction,
}

impl PlannedFile {
    /// `<source>.bak`, next to the source.
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.file.name.clone();
        name.push(BACKUP_SUFFIX);
        self.file.path.with_file_name(name)
    }
}

/// Totals for a finished (or planned) run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    pub sources: u64,
    pub linked: u64,
    pub deduplicated: u64,
    pub already_linked: u64,
    /// Non-regular entries passed over during the scan.
    pub skipped: u64,
}

impl MergeReport {
    fn count(&mut self, action: FileAction) {
        match action {
            FileAction::Link => self.linked += 1,
            FileAction::Dedup => self.deduplicated += 1,
            FileAction::AlreadyLinked => self.already_linked += 1,
        }
    }
}

/// Every source file with its destination and action, in processing order.
#[derive(Debug)]
pub struct MergePlan {
    tree: ShardTree,
    files: Vec<PlannedFile>,
    sources: u64,
    skipped: u64,
}

impl MergePlan {
    /// Scan `sources` in order and decide what each file needs.
    ///
    /// Destinations claimed by an earlier file in the plan count as existing,
    /// so the plan matches what a file-by-file run would do.
    #[instrument(skip_all, level = "debug")]
    pub fn build<P: AsRef<Path>>(dest: &Path, sources: &[P]) -> Result<Self> {
        let tree = ShardTree::new(dest);
        let mut files = Vec::new();
        let mut skipped = 0;
        let mut claimed: HashMap<PathBuf, (u64, u64)> = HashMap::new();

        for source in sources {
            let scan = scan_source(source.as_ref())?;
            skipped += scan.skipped;

            for file in scan.files {
                let dest_path = tree.path_for(&file.key, &file.name);

                let existing = match claimed.get(&dest_path) {
                    Some(identity) => Some(*identity),
                    None => probe(&dest_path)?,
                };

                let action = match existing {
                    None => {
                        claimed.insert(dest_path.clone(), file.identity);
                        FileAction::Link
                    }
                    Some(identity) if identity == file.identity => FileAction::AlreadyLinked,
                    Some(_) => FileAction::Dedup,
                };

                log_merge_debug!(
                    "Planned",
                    source = tracing::field::display(file.path.display()),
                    action = tracing::field::display(action),
                );

                let planned = PlannedFile {
                    file,
                    dest: dest_path,
                    action,
                };
                if action == FileAction::Dedup {
                    check_backup_free(&planned)?;
                }
                files.push(planned);
            }
        }

        Ok(Self {
            tree,
            files,
            sources: sources.len() as u64,
            skipped,
        })
    }

    pub fn files(&self) -> &[PlannedFile] {
        &self.files
    }

    pub fn tree(&self) -> &ShardTree {
        &self.tree
    }

    /// The report this plan would produce if applied successfully.
    pub fn report(&self) -> MergeReport {
        let mut report = MergeReport {
            sources: self.sources,
            skipped: self.skipped,
            ..MergeReport::default()
        };
        for planned in &self.files {
            report.count(planned.action);
        }
        report
    }

    /// Execute the plan through `ops`, stopping at the first failure.
    #[instrument(skip_all, fields(ops = ops.name()), level = "debug")]
    pub fn apply(&self, ops: &dyn FsOps) -> Result<MergeReport> {
        self.tree.ensure_root(ops)?;

        let mut report = MergeReport {
            sources: self.sources,
            skipped: self.skipped,
            ..MergeReport::default()
        };

        for planned in &self.files {
            match planned.action {
                FileAction::Link => self.link_new(planned, ops)?,
                FileAction::Dedup => replace_with_link(planned, ops)?,
                FileAction::AlreadyLinked => {
                    log_merge_debug!(
                        "Already linked",
                        source = tracing::field::display(planned.file.path.display()),
                    );
                }
            }
            report.count(planned.action);
        }

        Ok(report)
    }

    fn link_new(&self, planned: &PlannedFile, ops: &dyn FsOps) -> Result<()> {
        self.tree.ensure_shard(&planned.file.key, ops)?;
        ops.hard_link(&planned.file.path, &planned.dest)
            .map_err(|source| MergeError::Link {
                src: planned.file.path.clone(),
                dst: planned.dest.clone(),
                source,
            })?;
        log_merge_debug!(
            "Linked into shard",
            dest = tracing::field::display(planned.dest.display()),
        );
        Ok(())
    }
}

/// Swap a duplicate source for a link to the destination copy.
///
/// The source inode stays reachable throughout: it sits under the backup
/// name until the link is in place, and only then is the backup removed.
/// A failure after the rename leaves the backup.
fn replace_with_link(planned: &PlannedFile, ops: &dyn FsOps) -> Result<()> {
    let src = &planned.file.path;
    let backup = planned.backup_path();
    let fail = |step: DedupStep| {
        move |source: io::Error| MergeError::Dedup {
            src: src.clone(),
            dst: planned.dest.clone(),
            step,
            source,
        }
    };

    ops.rename(src, &backup).map_err(fail(DedupStep::Backup))?;
    if let Err(e) = ops.hard_link(&planned.dest, src) {
        log_merge_warn!(
            "Backup left in place",
            backup = tracing::field::display(backup.display()),
        );
        return Err(fail(DedupStep::Link)(e));
    }
    ops.remove_file(&backup).map_err(fail(DedupStep::RemoveBackup))?;

    log_merge_debug!(
        "Replaced duplicate",
        source = tracing::field::display(src.display()),
        dest = tracing::field::display(planned.dest.display()),
    );
    Ok(())
}

/// The dedup rename must not clobber an existing `<name>.bak`.
///
/// Any entry counts, including symlinks and directories the scan skipped.
fn check_backup_free(planned: &PlannedFile) -> Result<()> {
    let backup = planned.backup_path();
    match backup.symlink_metadata() {
        Ok(_) => Err(MergeError::BackupExists {
            src: planned.file.path.clone(),
            backup,
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(MergeError::Probe {
            path: backup,
            source,
        }),
    }
}

/// `(dev, ino)` of whatever is at `path`, or `None` if nothing is.
fn probe(path: &Path) -> Result<Option<(u64, u64)>> {
    match path.metadata() {
        Ok(meta) => Ok(Some((meta.dev(), meta.ino()))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        // A shard level that exists as a plain file: nothing can live below it.
        Err(e) if e.raw_os_error() == Some(Errno::ENOTDIR as i32) => Ok(None),
        Err(source) => Err(MergeError::Probe {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Merge `sources` into the sharded tree at `dest`.
///
/// Returns the totals on success. Any error aborts the run; work already
/// committed stays on disk.
pub fn merge<P: AsRef<Path>>(dest: &Path, sources: &[P], options: &MergeOptions) -> Result<MergeReport> {
    let plan = MergePlan::build(dest, sources)?;
    let ops = get_ops(options.dry_run);
    let report = plan.apply(ops.as_ref())?;

    log_merge_info!(
        "Merge complete",
        dest = tracing::field::display(dest.display()),
        sources = report.sources,
        linked = report.linked,
        deduplicated = report.deduplicated,
        already_linked = report.already_linked,
        skipped = report.skipped,
        dry_run = options.dry_run,
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::{DryRunOps, FsOp, HardLinkOps};
    use std::ffi::OsString;
    use std::fs;
    use tempfile::TempDir;

    fn ino(path: &Path) -> u64 {
        fs::metadata(path).unwrap().ino()
    }

    /// Fails every `hard_link`; everything else is real.
    struct FailingLink;

    impl FsOps for FailingLink {
        fn create_dir(&self, path: &Path) -> io::Result<()> {
            HardLinkOps.create_dir(path)
        }
        fn hard_link(&self, _original: &Path, _link: &Path) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        }
        fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
            HardLinkOps.rename(from, to)
        }
        fn remove_file(&self, path: &Path) -> io::Result<()> {
            HardLinkOps.remove_file(path)
        }
        fn name(&self) -> &'static str {
            "failing-link"
        }
    }

    #[test]
    fn test_plan_actions_across_sources() {
        let temp = TempDir::new().unwrap();
        let src1 = temp.path().join("src1");
        let src2 = temp.path().join("src2");
        fs::create_dir_all(&src1).unwrap();
        fs::create_dir_all(&src2).unwrap();
        fs::write(src1.join("xyz12"), "one").unwrap();
        fs::write(src2.join("xyz12"), "two").unwrap();
        fs::write(src2.join("abcd1"), "three").unwrap();

        let dest = temp.path().join("out");
        let plan = MergePlan::build(&dest, &[&src1, &src2]).unwrap();
        let actions: Vec<_> = plan.files().iter().map(|p| p.action).collect();
        assert_eq!(
            actions,
            vec![FileAction::Link, FileAction::Link, FileAction::Dedup]
        );
        let names: Vec<_> = plan.files().iter().map(|p| p.file.name.clone()).collect();
        assert_eq!(
            names,
            vec![
                OsString::from("xyz12"),
                OsString::from("abcd1"),
                OsString::from("xyz12")
            ]
        );
        assert_eq!(plan.files()[2].dest, dest.join("xy").join("z1").join("xyz12"));
        assert!(!dest.exists(), "planning must not touch the destination");
    }

    #[test]
    fn test_same_source_twice_is_already_linked() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("abcd1"), "x").unwrap();

        let dest = temp.path().join("out");
        let plan = MergePlan::build(&dest, &[&src, &src]).unwrap();
        let report = plan.apply(&HardLinkOps).unwrap();

        assert_eq!(report.linked, 1);
        assert_eq!(report.already_linked, 1);
        assert_eq!(ino(&src.join("abcd1")), ino(&dest.join("ab/cd/abcd1")));
    }

    #[test]
    fn test_dry_run_plan_operations() {
        let temp = TempDir::new().unwrap();
        let src1 = temp.path().join("src1");
        let src2 = temp.path().join("src2");
        fs::create_dir_all(&src1).unwrap();
        fs::create_dir_all(&src2).unwrap();
        fs::write(src1.join("abcd1"), "one").unwrap();
        fs::write(src2.join("abcd1"), "two").unwrap();

        let dest = temp.path().join("out");
        let plan = MergePlan::build(&dest, &[&src1, &src2]).unwrap();
        let ops = DryRunOps::new();
        let report = plan.apply(&ops).unwrap();

        assert_eq!(report, plan.report());
        assert!(!dest.exists());
        let shard = dest.join("ab").join("cd");
        assert_eq!(
            ops.operations(),
            vec![
                FsOp::CreateDir(dest.clone()),
                FsOp::CreateDir(dest.join("ab")),
                FsOp::CreateDir(shard.clone()),
                FsOp::HardLink {
                    original: src1.join("abcd1"),
                    link: shard.join("abcd1"),
                },
                FsOp::Rename {
                    from: src2.join("abcd1"),
                    to: src2.join("abcd1.bak"),
                },
                FsOp::HardLink {
                    original: shard.join("abcd1"),
                    link: src2.join("abcd1"),
                },
                FsOp::RemoveFile(src2.join("abcd1.bak")),
            ]
        );
    }

    #[test]
    fn test_failed_relink_leaves_backup() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        let shard = dest.join("ab").join("cd");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join("abcd1"), "canonical").unwrap();
        fs::write(src.join("abcd1"), "duplicate").unwrap();

        let plan = MergePlan::build(&dest, &[&src]).unwrap();
        let err = plan.apply(&FailingLink).unwrap_err();

        match err {
            MergeError::Dedup { step, .. } => assert_eq!(step, DedupStep::Link),
            other => panic!("unexpected error: {other}"),
        }
        assert!(!src.join("abcd1").exists());
        assert_eq!(fs::read_to_string(src.join("abcd1.bak")).unwrap(), "duplicate");
    }

    #[test]
    fn test_existing_backup_name_aborts_plan() {
        let temp = TempDir::new().unwrap();
        let src1 = temp.path().join("src1");
        let src2 = temp.path().join("src2");
        fs::create_dir_all(&src1).unwrap();
        fs::create_dir_all(&src2).unwrap();
        fs::write(src1.join("abcd1"), "first").unwrap();
        fs::write(src2.join("abcd1"), "second").unwrap();
        fs::write(src2.join("abcd1.bak"), "distinct cert").unwrap();

        let dest = temp.path().join("out");
        let err = MergePlan::build(&dest, &[&src1, &src2]).unwrap_err();

        match err {
            MergeError::BackupExists { src, backup } => {
                assert_eq!(src, src2.join("abcd1"));
                assert_eq!(backup, src2.join("abcd1.bak"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!dest.exists());
        assert_eq!(
            fs::read_to_string(src2.join("abcd1.bak")).unwrap(),
            "distinct cert"
        );
        assert_eq!(fs::read_to_string(src2.join("abcd1")).unwrap(), "second");
    }

    #[test]
    fn test_backup_name_taken_by_symlink_aborts_plan() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        let dest = temp.path().join("out");
        let shard = dest.join("ab").join("cd");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&shard).unwrap();
        fs::write(shard.join("abcd1"), "canonical").unwrap();
        fs::write(src.join("abcd1"), "duplicate").unwrap();
        std::os::unix::fs::symlink("/nonexistent", src.join("abcd1.bak")).unwrap();

        let err = MergePlan::build(&dest, &[&src]).unwrap_err();
        assert!(matches!(err, MergeError::BackupExists { .. }));
        assert!(src.join("abcd1.bak").symlink_metadata().is_ok());
    }

    #[test]
    fn test_failed_new_link_is_fatal() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("abcd1"), "x").unwrap();
        fs::write(src.join("efgh1"), "y").unwrap();

        let dest = temp.path().join("out");
        let plan = MergePlan::build(&dest, &[&src]).unwrap();
        let err = plan.apply(&FailingLink).unwrap_err();

        assert!(matches!(err, MergeError::Link { .. }));
        // Shard directories for the first file were already created.
        assert!(dest.join("ab").join("cd").is_dir());
        assert!(!dest.join("ef").exists());
    }

    #[test]
    fn test_backup_path_is_sibling() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("abcd1.pem"), "x").unwrap();

        let plan = MergePlan::build(&temp.path().join("out"), &[&src]).unwrap();
        assert_eq!(plan.files()[0].backup_path(), src.join("abcd1.pem.bak"));
    }

    #[test]
    fn test_merge_dry_run_leaves_no_trace() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a1b2c3"), "x").unwrap();

        let dest = temp.path().join("out");
        let report = merge(&dest, &[&src], &MergeOptions { dry_run: true }).unwrap();
        assert_eq!(report.linked, 1);
        assert!(!dest.exists());
    }
}
