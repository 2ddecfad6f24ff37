//! sparse index: subtrees entirely outside the sparse-checkout cone
//! collapse to single sparse-directory entries carrying the tree id

use bstr::{BStr, BString, ByteSlice};

use crate::error::{Error, IoResultExt, Result};
use crate::index::cache_tree::CacheTree;
use crate::index::entry::{flags, IndexEntry};
use crate::object::Odb;
use crate::repo::Repo;
use crate::types::{Kind, Tree};

/// how much of the index is currently collapsed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SparseMode {
    /// no sparse-directory entries; any operation permitted
    #[default]
    Expanded,
    /// sparse-directory entries present; cheap bulk operations only
    Collapsed,
    /// expanded along one pathspec only
    PartiallySparse,
}

/// the cone-mode pattern set: a list of directories whose contents are
/// checked out; everything else may collapse
#[derive(Clone, Debug, Default)]
pub struct SparsePatterns {
    dirs: Vec<BString>,
}

impl SparsePatterns {
    pub fn from_dirs(dirs: impl IntoIterator<Item = impl Into<BString>>) -> Self {
        let mut dirs: Vec<BString> = dirs
            .into_iter()
            .map(|d| {
                let mut d = d.into();
                while d.last() == Some(&b'/') {
                    d.pop();
                }
                d
            })
            .collect();
        dirs.sort();
        dirs.dedup();
        Self { dirs }
    }

    /// load `info/sparse-checkout`; one directory per line, `#` comments
    pub fn load(repo: &Repo) -> Result<Self> {
        let path = repo.sparse_patterns_path();
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(Error::Io { path, source: e }),
        };
        Ok(Self::from_dirs(
            content
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with('#'))
                .map(BString::from),
        ))
    }

    pub fn save(&self, repo: &Repo) -> Result<()> {
        let path = repo.sparse_patterns_path();
        let mut out = String::new();
        for dir in &self.dirs {
            out.push_str(&dir.to_string());
            out.push('\n');
        }
        std::fs::write(&path, out).with_path(&path)?;
        Ok(())
    }

    /// is a file path inside the checkout cone?
    ///
    /// a file is in the cone when its directory is one of the pattern
    /// directories, lies inside one, or is an ancestor of one (the
    /// immediate files of ancestors stay checked out)
    pub fn in_cone(&self, path: &BStr) -> bool {
        let dir = match path.rfind_byte(b'/') {
            Some(slash) => &path[..slash],
            None => return true,
        };
        self.dirs.iter().any(|p| {
            dir == &p[..]
                || is_under(dir.as_bstr(), p.as_bstr())
                || is_under(p.as_bstr(), dir.as_bstr())
        })
    }

    /// may the whole directory collapse? only if no pattern names it,
    /// sits inside it, or contains it
    pub fn dir_fully_outside(&self, dir: &BStr) -> bool {
        !self.dirs.iter().any(|p| {
            dir == &p[..]
                || is_under(dir, p.as_bstr())
                || is_under(p.as_bstr(), dir)
        })
    }
}

/// is `inner` strictly under directory `outer`?
fn is_under(inner: &BStr, outer: &BStr) -> bool {
    inner.len() > outer.len()
        && inner.starts_with(outer.as_bytes())
        && inner[outer.len()] == b'/'
}

/// collapse every eligible subtree to a sparse-directory entry;
/// `cache_tree` must be fully valid over the collapsed directories
pub fn collapse(
    entries: &[IndexEntry],
    patterns: &SparsePatterns,
    cache_tree: &CacheTree,
) -> Vec<IndexEntry> {
    let mut out = Vec::with_capacity(entries.len());
    collapse_range(entries, b"".as_bstr(), patterns, cache_tree, &mut out);
    out
}

fn collapse_range(
    entries: &[IndexEntry],
    base: &BStr,
    patterns: &SparsePatterns,
    cache_tree: &CacheTree,
    out: &mut Vec<IndexEntry>,
) {
    let mut i = 0usize;
    while i < entries.len() {
        let entry = &entries[i];
        let rel = entry.path[base.len()..].as_bstr();

        let subdir = match rel.find_byte(b'/') {
            Some(slash) if slash + 1 < rel.len() => Some(slash),
            _ => None,
        };
        let Some(slash) = subdir else {
            out.push(entry.clone());
            i += 1;
            continue;
        };

        let dir_full = entry.path[..base.len() + slash].as_bstr();
        let mut prefix = BString::from(dir_full.as_bytes());
        prefix.push(b'/');
        let span = entries[i..]
            .iter()
            .take_while(|e| e.path.starts_with(&prefix))
            .count();

        let node = cache_tree.node_at(dir_full);
        let collapsible = patterns.dir_fully_outside(dir_full)
            && entries[i..i + span].iter().all(|e| {
                e.stage == 0 && e.skip_worktree() && !e.mode.is_gitlink()
            })
            && node.is_some_and(|n| n.is_valid() && n.entry_count as usize == span);

        if collapsible {
            let node = node.expect("checked above");
            out.push(IndexEntry::sparse_dir(
                node.id.expect("valid node has an id"),
                dir_full,
            ));
        } else {
            collapse_range(&entries[i..i + span], prefix.as_bstr(), patterns, cache_tree, out);
        }
        i += span;
    }
}

/// fully expand one sparse-directory entry into the file entries of
/// the tree it stands for; expanded entries keep skip-worktree set
pub fn expand_full(entry: &IndexEntry, odb: &Odb) -> Result<Vec<IndexEntry>> {
    debug_assert!(entry.is_sparse_dir());
    let mut out = Vec::new();
    expand_tree(&entry.id, entry.path.as_bstr(), odb, true, &mut out)?;
    Ok(out)
}

/// expand one sparse-directory entry a single level: files become
/// entries, subtrees stay collapsed as sparse-directory entries
pub fn expand_one_level(entry: &IndexEntry, odb: &Odb) -> Result<Vec<IndexEntry>> {
    debug_assert!(entry.is_sparse_dir());
    let mut out = Vec::new();
    expand_tree(&entry.id, entry.path.as_bstr(), odb, false, &mut out)?;
    Ok(out)
}

fn expand_tree(
    tree_id: &crate::hash::Id,
    prefix: &BStr,
    odb: &Odb,
    recursive: bool,
    out: &mut Vec<IndexEntry>,
) -> Result<()> {
    let data = odb.read_kind(tree_id, Kind::Tree)?;
    let tree = Tree::decode(odb.algo(), &data.bytes)?;
    for te in tree.entries() {
        let mut path = BString::from(prefix.as_bytes());
        path.extend_from_slice(&te.name);
        if te.mode.is_tree() {
            if recursive {
                path.push(b'/');
                expand_tree(&te.id, path.as_bstr(), odb, true, out)?;
            } else {
                out.push(IndexEntry::sparse_dir(te.id, path));
            }
        } else {
            let mut entry = IndexEntry::new(te.mode, te.id, path, 0);
            entry.flags |= flags::SKIP_WORKTREE;
            out.push(entry);
        }
    }
    Ok(())
}
