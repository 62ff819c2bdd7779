//! Shard key derivation.
//!
//! A certificate name maps onto a two-level directory by its leading bytes:
//!
//! ```text
//! a1b2c3  ->  a1/b2/a1b2c3
//! ```
//!
//! Names are opaque byte strings; nothing past the fourth byte is inspected.

use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

/// Bytes consumed from the front of a name to pick its shard.
pub const SHARD_PREFIX_LEN: usize = 4;

/// Width of each shard level in bytes.
const LEVEL_WIDTH: usize = 2;

/// Why a name cannot be sharded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    TooShort,
    /// A shard level would be `..` and climb out of the destination.
    ParentComponent,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::TooShort => {
                write!(f, "shorter than {} bytes", SHARD_PREFIX_LEN)
            }
            InvalidReason::ParentComponent => write!(f, "shard level would be '..'"),
        }
    }
}

/// The two directory levels a name is filed under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ShardKey {
    level1: OsString,
    level2: OsString,
}

impl ShardKey {
    /// Derive the shard key from the first [`SHARD_PREFIX_LEN`] bytes of `name`.
    pub fn from_name(name: &OsStr) -> Result<Self, InvalidReason> {
        let bytes = name.as_bytes();
        if bytes.len() < SHARD_PREFIX_LEN {
            return Err(InvalidReason::TooShort);
        }

        let level1 = &bytes[..LEVEL_WIDTH];
        let level2 = &bytes[LEVEL_WIDTH..SHARD_PREFIX_LEN];
        if level1 == b".." || level2 == b".." {
            return Err(InvalidReason::ParentComponent);
        }

        Ok(Self {
            level1: OsStr::from_bytes(level1).to_os_string(),
            level2: OsStr::from_bytes(level2).to_os_string(),
        })
    }

    pub fn level1(&self) -> &OsStr {
        &self.level1
    }

    pub fn level2(&self) -> &OsStr {
        &self.level2
    }

    /// `<root>/<l1>`
    pub fn level1_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.level1)
    }

    /// `<root>/<l1>/<l2>`
    pub fn shard_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.level1).join(&self.level2)
    }

    /// `<root>/<l1>/<l2>/<name>`, with `name` kept verbatim.
    pub fn file_path(&self, root: &Path, name: &OsStr) -> PathBuf {
        self.shard_dir(root).join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_from_prefix() {
        let key = ShardKey::from_name(OsStr::new("a1b2c3")).unwrap();
        assert_eq!(key.level1(), "a1");
        assert_eq!(key.level2(), "b2");
    }

    #[test]
    fn test_exact_prefix_length_accepted() {
        let key = ShardKey::from_name(OsStr::new("abcd")).unwrap();
        assert_eq!(
            key.file_path(Path::new("/out"), OsStr::new("abcd")),
            PathBuf::from("/out/ab/cd/abcd")
        );
    }

    #[test]
    fn test_short_names_rejected() {
        for name in ["", "a", "ab", "abc"] {
            assert_eq!(
                ShardKey::from_name(OsStr::new(name)),
                Err(InvalidReason::TooShort),
                "{name:?} should be too short"
            );
        }
    }

    #[test]
    fn test_only_first_four_bytes_matter() {
        let a = ShardKey::from_name(OsStr::new("abcd1")).unwrap();
        let b = ShardKey::from_name(OsStr::new("abcdzzzzzzzz.pem")).unwrap();
        assert_eq!(a, b);

        let c = ShardKey::from_name(OsStr::new("abce1")).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_parent_component_rejected() {
        assert_eq!(
            ShardKey::from_name(OsStr::new("..ab")),
            Err(InvalidReason::ParentComponent)
        );
        assert_eq!(
            ShardKey::from_name(OsStr::new("ab..c")),
            Err(InvalidReason::ParentComponent)
        );
        assert!(ShardKey::from_name(OsStr::new(".a.b")).is_ok());
    }

    #[test]
    fn test_non_utf8_bytes_split_verbatim() {
        let name = OsStr::from_bytes(&[0xff, 0xfe, b'x', b'y', b'z']);
        let key = ShardKey::from_name(name).unwrap();
        assert_eq!(key.level1().as_bytes(), &[0xff, 0xfe]);
        assert_eq!(key.level2().as_bytes(), b"xy");
    }

    #[test]
    fn test_path_shape() {
        let root = Path::new("/dest");
        let name = OsStr::new("xyz12");
        let key = ShardKey::from_name(name).unwrap();
        assert_eq!(key.level1_dir(root), PathBuf::from("/dest/xy"));
        assert_eq!(key.shard_dir(root), PathBuf::from("/dest/xy/z1"));
        assert_eq!(key.file_path(root, name), PathBuf::from("/dest/xy/z1/xyz12"));
    }
}
