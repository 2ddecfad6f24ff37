//! one staging-area record: path, mode, id, conflict stage, and the
//! cached lstat snapshot used to cheaply answer "is the working-tree
//! file unchanged?"

use std::cmp::Ordering;

use bstr::{BStr, BString, ByteSlice};

use crate::config::{CheckStat, CoreConfig};
use crate::error::{Error, Result};
use crate::hash::Id;
use crate::types::Mode;

/// entry flag bits; the low 16 bits mirror the on-disk flags word
pub mod flags {
    /// on-disk: assume-valid / CE_VALID
    pub const ASSUME_VALID: u32 = 1 << 15;
    /// on-disk: an extended flags word follows (v3+)
    pub const EXTENDED: u32 = 1 << 14;

    // in-memory transients, never written
    pub const UPDATE: u32 = 1 << 16;
    pub const REMOVE: u32 = 1 << 17;
    pub const UPTODATE: u32 = 1 << 18;
    pub const ADDED: u32 = 1 << 19;
    pub const FSMONITOR_VALID: u32 = 1 << 21;
    pub const WT_REMOVE: u32 = 1 << 22;
    pub const CONFLICTED: u32 = 1 << 23;
    pub const MATCHED: u32 = 1 << 26;
    pub const UPDATE_IN_BASE: u32 = 1 << 27;
    pub const STRIP_NAME: u32 = 1 << 28;

    // extended on-disk flags
    pub const INTENT_TO_ADD: u32 = 1 << 29;
    pub const SKIP_WORKTREE: u32 = 1 << 30;

    /// everything that survives a write
    pub const ON_DISK: u32 = ASSUME_VALID | INTENT_TO_ADD | SKIP_WORKTREE;
}

/// name length is capped in the on-disk flags word at 12 bits
pub const NAME_LENGTH_MAX: usize = 0xFFF;

/// cached lstat snapshot; times keep only their low 32 bits
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatData {
    pub ctime_sec: u32,
    pub ctime_nsec: u32,
    pub mtime_sec: u32,
    pub mtime_nsec: u32,
    pub dev: u32,
    pub ino: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
}

impl StatData {
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            ctime_sec: meta.ctime() as u32,
            ctime_nsec: meta.ctime_nsec() as u32,
            mtime_sec: meta.mtime() as u32,
            mtime_nsec: meta.mtime_nsec() as u32,
            dev: meta.dev() as u32,
            ino: meta.ino() as u32,
            uid: meta.uid() as u32,
            gid: meta.gid() as u32,
            size: munge_size(meta.len()),
        }
    }

    /// does the file look unchanged since this snapshot was taken?
    pub fn matches(&self, other: &StatData, core: &CoreConfig) -> bool {
        if self.mtime_sec != other.mtime_sec || self.size != other.size {
            return false;
        }
        if core.check_stat == CheckStat::Minimal {
            return true;
        }
        if self.mtime_nsec != other.mtime_nsec {
            return false;
        }
        if core.trust_ctime
            && (self.ctime_sec != other.ctime_sec || self.ctime_nsec != other.ctime_nsec)
        {
            return false;
        }
        self.dev == other.dev
            && self.ino == other.ino
            && self.uid == other.uid
            && self.gid == other.gid
    }
}

/// truncate a file size to 32 bits, steering exact 4-GiB multiples
/// away from the zero "unset" encoding so they cannot look racily clean
pub fn munge_size(size: u64) -> u32 {
    let truncated = size as u32;
    if truncated == 0 && size != 0 {
        0x8000_0000
    } else {
        truncated
    }
}

/// a record for one path in the staging area
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexEntry {
    pub path: BString,
    pub mode: Mode,
    pub id: Id,
    pub stage: u8,
    pub stat: StatData,
    pub flags: u32,
}

impl IndexEntry {
    pub fn new(mode: Mode, id: Id, path: impl Into<BString>, stage: u8) -> Self {
        debug_assert!(stage <= 3);
        Self {
            path: path.into(),
            mode,
            id,
            stage,
            stat: StatData::default(),
            flags: 0,
        }
    }

    /// a single entry of mode 040000 standing in for a whole subtree
    /// whose files are not checked out; its path carries a trailing
    /// slash and its id is the subtree's tree id
    pub fn sparse_dir(id: Id, dir: impl Into<BString>) -> Self {
        let mut path = dir.into();
        if !path.ends_with(b"/") {
            path.push(b'/');
        }
        let mut entry = Self::new(Mode::Tree, id, path, 0);
        entry.flags |= flags::SKIP_WORKTREE;
        entry
    }

    pub fn is_sparse_dir(&self) -> bool {
        self.mode.is_tree() && self.path.ends_with(b"/")
    }

    pub fn skip_worktree(&self) -> bool {
        self.flags & flags::SKIP_WORKTREE != 0
    }

    pub fn intent_to_add(&self) -> bool {
        self.flags & flags::INTENT_TO_ADD != 0
    }

    pub fn uptodate(&self) -> bool {
        self.flags & flags::UPTODATE != 0
    }

    /// ordering key: path bytes, then stage
    pub fn cmp_key(&self, path: &BStr, stage: u8) -> Ordering {
        self.path
            .as_bstr()
            .cmp(path)
            .then(self.stage.cmp(&stage))
    }
}

/// validate an index path: no NUL, no empty components, no `.`/`..`,
/// and a trailing slash only on a sparse-directory entry
pub fn verify_path(path: &BStr, mode: Mode) -> Result<()> {
    if path.is_empty() {
        return Err(Error::PathInvalid("empty path".to_string()));
    }
    if path.contains(&0) {
        return Err(Error::PathInvalid(format!("NUL in path: {:?}", path)));
    }
    if path.starts_with(b"/") {
        return Err(Error::PathInvalid(format!("absolute path: {}", path)));
    }

    let trimmed = if path.ends_with(b"/") {
        if !mode.is_tree() {
            return Err(Error::PathInvalid(format!(
                "trailing slash on non-directory: {}",
                path
            )));
        }
        &path[..path.len() - 1]
    } else {
        &path[..]
    };

    for component in trimmed.split_str("/") {
        if component.is_empty() {
            return Err(Error::PathInvalid(format!("empty component: {}", path)));
        }
        if component == b"." || component == b".." {
            return Err(Error::PathInvalid(format!(
                "'.' or '..' component: {}",
                path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;

    fn some_id(n: u8) -> Id {
        Id::from_bytes(HashAlgo::Sha256, &[n; 32]).unwrap()
    }

    #[test]
    fn test_munge_size() {
        assert_eq!(munge_size(0), 0);
        assert_eq!(munge_size(100), 100);
        // exact 4-GiB multiple: special non-zero sentinel
        assert_eq!(munge_size(1u64 << 32), 0x8000_0000);
        assert_eq!(munge_size(3 * (1u64 << 32)), 0x8000_0000);
        // 4 GiB + 1 truncates normally
        assert_eq!(munge_size((1u64 << 32) + 1), 1);
    }

    #[test]
    fn test_stat_matches_default() {
        let core = CoreConfig::default();
        let a = StatData {
            mtime_sec: 10,
            size: 5,
            ..Default::default()
        };
        assert!(a.matches(&a, &core));

        let mut b = a;
        b.size = 6;
        assert!(!a.matches(&b, &core));

        let mut c = a;
        c.ino = 99;
        assert!(!a.matches(&c, &core));
    }

    #[test]
    fn test_stat_matches_minimal() {
        let core = CoreConfig {
            check_stat: CheckStat::Minimal,
            ..Default::default()
        };
        let a = StatData {
            mtime_sec: 10,
            size: 5,
            ..Default::default()
        };
        let mut b = a;
        b.ino = 99;
        b.mtime_nsec = 7;
        // minimal comparison ignores everything but size and mtime seconds
        assert!(a.matches(&b, &core));
    }

    #[test]
    fn test_stat_ctime_trust() {
        let mut core = CoreConfig::default();
        let a = StatData {
            ctime_sec: 1,
            ..Default::default()
        };
        let mut b = a;
        b.ctime_sec = 2;
        assert!(!a.matches(&b, &core));
        core.trust_ctime = false;
        assert!(a.matches(&b, &core));
    }

    #[test]
    fn test_sparse_dir_entry() {
        let entry = IndexEntry::sparse_dir(some_id(1), "docs");
        assert_eq!(entry.path, "docs/");
        assert!(entry.is_sparse_dir());
        assert!(entry.skip_worktree());
        assert_eq!(entry.mode, Mode::Tree);
    }

    #[test]
    fn test_verify_path() {
        use bstr::ByteSlice;
        assert!(verify_path(b"a/b/c".as_bstr(), Mode::Regular).is_ok());
        assert!(verify_path(b"".as_bstr(), Mode::Regular).is_err());
        assert!(verify_path(b"/abs".as_bstr(), Mode::Regular).is_err());
        assert!(verify_path(b"a//b".as_bstr(), Mode::Regular).is_err());
        assert!(verify_path(b"a/./b".as_bstr(), Mode::Regular).is_err());
        assert!(verify_path(b"a/../b".as_bstr(), Mode::Regular).is_err());
        assert!(verify_path(b"file/".as_bstr(), Mode::Regular).is_err());
        assert!(verify_path(b"dir/".as_bstr(), Mode::Tree).is_ok());
        assert!(verify_path(b"a\0b".as_bstr(), Mode::Regular).is_err());
    }

    #[test]
    fn test_cmp_key_orders_by_path_then_stage() {
        use bstr::ByteSlice;
        let e = IndexEntry::new(Mode::Regular, some_id(1), "b", 1);
        assert_eq!(e.cmp_key(b"b".as_bstr(), 1), Ordering::Equal);
        assert_eq!(e.cmp_key(b"b".as_bstr(), 2), Ordering::Less);
        assert_eq!(e.cmp_key(b"b".as_bstr(), 0), Ordering::Greater);
        assert_eq!(e.cmp_key(b"c".as_bstr(), 0), Ordering::Less);
        // "a/" sorts between "a-" and "a0" under byte comparison
        let sparse = IndexEntry::sparse_dir(some_id(2), "a");
        assert_eq!(sparse.cmp_key(b"a-x".as_bstr(), 0), Ordering::Greater);
        assert_eq!(sparse.cmp_key(b"a0".as_bstr(), 0), Ordering::Less);
    }
}
