//! tree / index reconciliation: walk up to N trees in lockstep with
//! the index, in tree-entry order, delegating per-path decisions to a
//! caller-supplied merge policy; then apply the recorded working-tree
//! actions

use std::path::Path;

use bstr::{BStr, BString, ByteSlice};
use log::info;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::Id;
use crate::index::{add_opts, flags, Index, IndexEntry, StatData};
use crate::repo::Repo;
use crate::types::{entry_name_cmp, Kind, Mode, TreeEntry};

/// what one source contributes at a reached path
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Candidate {
    /// the source has an entry here
    Entry(IndexEntry),
    /// the source has a directory here while another source has a
    /// file: the directory side participates through this sentinel
    DirConflict,
}

/// what a merge policy returns for one reached path
#[derive(Debug, Default)]
pub struct MergeResult {
    /// entries appended to the new index, in order; entries carrying
    /// the UPDATE flag are checked out by `check_updates`
    pub entries: Vec<IndexEntry>,
    /// working-tree paths to remove
    pub removals: Vec<BString>,
}

/// walker options
#[derive(Clone, Debug)]
pub struct UnpackOptions {
    /// 1-based tree position that is "ours" for stage numbering
    pub head_idx: usize,
    /// apply working-tree actions after the walk
    pub update: bool,
    /// mutate only the index, never the working tree
    pub index_only: bool,
    /// tolerate trees referencing objects missing from the store
    pub missing_ok: bool,
    pub verbose: bool,
    /// graft the trees at this subdirectory instead of the root
    pub prefix: BString,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            head_idx: 1,
            update: false,
            index_only: false,
            missing_ok: false,
            verbose: false,
            prefix: BString::from(""),
        }
    }
}

/// one tree source at the current recursion level
enum Source {
    /// remaining entries of a tree, front first
    List(Vec<TreeEntry>, usize),
    /// a file in this source shadows the directory being walked;
    /// every path below sees the conflict sentinel
    DfConflict,
    /// nothing left at this level
    Exhausted,
}

impl Source {
    fn current(&self) -> Option<&TreeEntry> {
        match self {
            Source::List(entries, cursor) => entries.get(*cursor),
            _ => None,
        }
    }

    fn advance(&mut self) {
        if let Source::List(_, cursor) = self {
            *cursor += 1;
        }
    }
}

/// walk the trees against the index and build the new index under the
/// merge policy; neither the index nor the working tree is touched.
/// apply the result with `check_updates` and persist it via the lock
pub fn unpack_trees<F>(
    repo: &Repo,
    index: &Index,
    trees: &[Id],
    opts: &UnpackOptions,
    merge_fn: &mut F,
) -> Result<(Index, Vec<BString>)>
where
    F: FnMut(&[Option<Candidate>]) -> Result<MergeResult>,
{
    let mut result = MergeResult::default();

    // entries outside the graft prefix pass through untouched
    let prefix = opts.prefix.clone();
    let (before, involved, after) = partition_by_prefix(index.entries(), prefix.as_bstr());

    let mut sources = Vec::with_capacity(trees.len());
    for id in trees {
        sources.push(Source::List(read_tree_entries(repo, id, opts)?, 0));
    }

    let mut cursor = 0usize;
    walk(
        repo,
        &mut sources,
        prefix.as_bstr(),
        involved,
        &mut cursor,
        opts,
        merge_fn,
        &mut result,
    )?;

    let mut new_index = Index::new(index.version());
    for entry in before.iter().chain(result.entries.iter()).chain(after) {
        new_index.add(
            entry.clone(),
            add_opts::JUST_APPEND | add_opts::KEEP_CACHE_TREE,
        )?;
    }
    Ok((new_index, result.removals))
}

fn partition_by_prefix<'a>(
    entries: &'a [IndexEntry],
    prefix: &BStr,
) -> (&'a [IndexEntry], &'a [IndexEntry], &'a [IndexEntry]) {
    if prefix.is_empty() {
        return (&[], entries, &[]);
    }
    let start = entries.partition_point(|e| e.path.as_bstr() < prefix);
    let span = entries[start..]
        .iter()
        .take_while(|e| e.path.starts_with(prefix.as_bytes()))
        .count();
    (
        &entries[..start],
        &entries[start..start + span],
        &entries[start + span..],
    )
}

fn read_tree_entries(repo: &Repo, id: &Id, opts: &UnpackOptions) -> Result<Vec<TreeEntry>> {
    let mut graph = repo.graph();
    let handle = graph.lookup(repo.odb(), Kind::Tree, *id);
    match graph.parse_tree(repo.odb(), handle) {
        Ok(tree) => Ok(tree.entries().to_vec()),
        Err(Error::ObjectMissing(missing)) if opts.missing_ok => {
            info!("tree {} is missing, treated as empty", missing);
            Ok(Vec::new())
        }
        Err(e) => Err(e),
    }
}

#[allow(clippy::too_many_arguments)]
fn walk<F>(
    repo: &Repo,
    sources: &mut [Source],
    base: &BStr,
    index_entries: &[IndexEntry],
    index_pos: &mut usize,
    opts: &UnpackOptions,
    merge_fn: &mut F,
    out: &mut MergeResult,
) -> Result<()>
where
    F: FnMut(&[Option<Candidate>]) -> Result<MergeResult>,
{
    loop {
        // the lowest name among all sources under the tree-entry order
        let mut first: Option<(BString, bool)> = None;

        let cache_rest = index_entries.get(*index_pos).and_then(|entry| {
            entry
                .path
                .strip_prefix(base.as_bytes())
                .map(|rest| rest.as_bstr())
        });
        if let Some(rest) = cache_rest {
            first = Some((BString::from(rest), false));
        }
        for source in sources.iter() {
            if let Some(entry) = source.current() {
                let dir = entry.mode.is_tree();
                let better = match &first {
                    None => true,
                    Some((name, name_dir)) => {
                        entry_name_cmp(name, *name_dir, &entry.name, dir)
                            == std::cmp::Ordering::Greater
                    }
                };
                if better {
                    first = Some((entry.name.clone(), dir));
                }
            }
        }
        let Some((first, _first_dir)) = first else {
            return Ok(());
        };

        let mut src: Vec<Option<Candidate>> = vec![None; sources.len() + 1];
        let mut sub_sources: Vec<Source> = Vec::with_capacity(sources.len());
        let mut any_files = false;
        let mut any_dirs = false;

        if cache_rest.is_some_and(|rest| rest == first.as_bstr()) {
            src[0] = Some(Candidate::Entry(index_entries[*index_pos].clone()));
            *index_pos += 1;
            any_files = true;
        }

        for (i, source) in sources.iter_mut().enumerate() {
            match source {
                Source::DfConflict => {
                    // the shadowing file side shows the sentinel at
                    // every path in this directory
                    src[i + 1] = Some(Candidate::DirConflict);
                    sub_sources.push(Source::DfConflict);
                    continue;
                }
                Source::Exhausted => {
                    sub_sources.push(Source::Exhausted);
                    continue;
                }
                Source::List(..) => {}
            }
            let Some(entry) = source.current().filter(|e| e.name == first) else {
                sub_sources.push(Source::Exhausted);
                continue;
            };
            let entry = entry.clone();
            source.advance();

            if entry.mode.is_tree() {
                any_dirs = true;
                src[i + 1] = Some(Candidate::DirConflict);
                sub_sources.push(Source::List(read_tree_entries(repo, &entry.id, opts)?, 0));
            } else {
                any_files = true;
                let stage = if i + 1 < opts.head_idx {
                    1
                } else if i + 1 > opts.head_idx {
                    3
                } else {
                    2
                };
                let mut path = BString::from(base.as_bytes());
                path.extend_from_slice(&entry.name);
                src[i + 1] = Some(Candidate::Entry(IndexEntry::new(
                    entry.mode, entry.id, path, stage,
                )));
                // while others descend, this file shadows the directory
                sub_sources.push(Source::DfConflict);
            }
        }

        if any_files {
            // exactly one policy call per reached path
            let merged = merge_fn(&src)?;
            out.entries.extend(merged.entries);
            out.removals.extend(merged.removals);
        }
        if any_dirs {
            let mut newbase = BString::from(base.as_bytes());
            newbase.extend_from_slice(&first);
            newbase.push(b'/');
            walk(
                repo,
                &mut sub_sources,
                newbase.as_bstr(),
                index_entries,
                index_pos,
                opts,
                merge_fn,
                out,
            )?;
        }
    }
}

/// apply the recorded working-tree actions: removals first (leaf-up,
/// pruning emptied ancestor directories), then creations through the
/// object store; refreshes the stat cache of written entries
pub fn check_updates(
    repo: &Repo,
    workdir: &Path,
    index: &mut Index,
    removals: &[BString],
    opts: &UnpackOptions,
) -> Result<()> {
    if !opts.update || opts.index_only {
        return Ok(());
    }

    let mut ordered: Vec<&BString> = removals.iter().collect();
    ordered.sort();
    for path in ordered.into_iter().rev() {
        if opts.verbose {
            info!("removing {}", path);
        }
        unlink_entry(workdir, path.as_bstr());
    }

    for pos in 0..index.len() {
        if index.entry(pos).flags & flags::UPDATE == 0 {
            continue;
        }
        let entry = index.entry(pos).clone();
        if opts.verbose {
            info!("updating {}", entry.path);
        }
        let stat = checkout_entry(repo, workdir, &entry)?;
        let mut updated = entry;
        updated.flags &= !flags::UPDATE;
        updated.flags |= flags::UPTODATE;
        if let Some(stat) = stat {
            updated.stat = stat;
        }
        index.add(
            updated,
            add_opts::OK_TO_ADD | add_opts::SKIP_DFCHECK | add_opts::KEEP_CACHE_TREE,
        )?;
    }
    Ok(())
}

/// unlink a file and then best-effort remove emptied parents
fn unlink_entry(workdir: &Path, path: &BStr) {
    let full = workdir.join(bytes_to_path(path));
    if std::fs::remove_file(&full).is_err() {
        return;
    }
    let mut dir = full.parent();
    while let Some(current) = dir {
        if current == workdir || std::fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

/// materialize one blob into the working tree; the content passes
/// through the working-tree conversion pipeline of the caller, which
/// here is the identity
fn checkout_entry(repo: &Repo, workdir: &Path, entry: &IndexEntry) -> Result<Option<StatData>> {
    let full = workdir.join(bytes_to_path(entry.path.as_bstr()));
    if let Some(parent) = full.parent() {
        std::fs::create_dir_all(parent).with_path(parent)?;
    }

    match entry.mode {
        Mode::Gitlink => {
            // submodules are opaque: just make room for them
            std::fs::create_dir_all(&full).with_path(&full)?;
            return Ok(None);
        }
        Mode::Symlink => {
            let data = repo.odb().read_kind(&entry.id, Kind::Blob)?;
            let target = bytes_to_path(data.bytes.as_bstr()).to_path_buf();
            let _ = std::fs::remove_file(&full);
            #[cfg(unix)]
            std::os::unix::fs::symlink(&target, &full).with_path(&full)?;
        }
        Mode::Regular | Mode::Executable => {
            let data = repo.odb().read_kind(&entry.id, Kind::Blob)?;
            std::fs::write(&full, &data.bytes).with_path(&full)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mode = if entry.mode == Mode::Executable {
                    0o755
                } else {
                    0o644
                };
                std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode))
                    .with_path(&full)?;
            }
        }
        Mode::Tree => {
            return Err(Error::PathInvalid(format!(
                "cannot check out a tree entry: {}",
                entry.path
            )))
        }
    }

    let meta = std::fs::symlink_metadata(&full).with_path(&full)?;
    Ok(Some(StatData::from_metadata(&meta)))
}

#[cfg(unix)]
fn bytes_to_path(bytes: &BStr) -> &Path {
    use std::os::unix::ffi::OsStrExt;
    Path::new(std::ffi::OsStr::from_bytes(bytes))
}

/// the "take the tree" policy for a one-tree walk: the new index
/// mirrors the tree, reusing the old stat cache where nothing changed
pub fn oneway_policy(src: &[Option<Candidate>]) -> Result<MergeResult> {
    debug_assert_eq!(src.len(), 2);
    let old = match &src[0] {
        Some(Candidate::Entry(entry)) => Some(entry),
        _ => None,
    };
    let new = match &src[1] {
        Some(Candidate::Entry(entry)) => Some(entry),
        _ => None,
    };

    let mut result = MergeResult::default();
    match (old, new) {
        (Some(old), Some(new)) => {
            let mut entry = IndexEntry::new(new.mode, new.id, new.path.clone(), 0);
            if old.id == new.id && old.mode == new.mode && !old.is_sparse_dir() {
                entry.stat = old.stat;
                entry.flags = old.flags & flags::ON_DISK;
            } else {
                entry.flags |= flags::UPDATE;
            }
            result.entries.push(entry);
        }
        (None, Some(new)) => {
            let mut entry = IndexEntry::new(new.mode, new.id, new.path.clone(), 0);
            entry.flags |= flags::UPDATE;
            result.entries.push(entry);
        }
        (Some(old), None) => {
            // also reached when the tree has a directory here
            result.removals.push(old.path.clone());
        }
        (None, None) => {}
    }
    Ok(result)
}

/// the fast-forward policy for a two-tree walk (old tree, new tree)
pub fn twoway_policy(src: &[Option<Candidate>]) -> Result<MergeResult> {
    debug_assert_eq!(src.len(), 3);
    let entry_of = |candidate: &Option<Candidate>| match candidate {
        Some(Candidate::Entry(entry)) => Some(entry.clone()),
        _ => None,
    };
    if src
        .iter()
        .any(|c| matches!(c, Some(Candidate::DirConflict)))
    {
        return Err(Error::MergeConflict(describe_tuple(src)));
    }
    let index = entry_of(&src[0]);
    let old = entry_of(&src[1]);
    let new = entry_of(&src[2]);

    let same = |a: &IndexEntry, b: &IndexEntry| a.id == b.id && a.mode == b.mode;
    let mut result = MergeResult::default();
    match (&index, &old, &new) {
        // both trees agree: whatever the index has stands
        (Some(index), Some(old), Some(new)) if same(old, new) => {
            let mut kept = index.clone();
            kept.stage = 0;
            result.entries.push(kept);
        }
        // the index is at the old tree: fast-forward to the new one
        (Some(index), Some(old), Some(new)) if same(index, old) => {
            let mut entry = IndexEntry::new(new.mode, new.id, new.path.clone(), 0);
            entry.flags |= flags::UPDATE;
            result.entries.push(entry);
        }
        (None, None, Some(new)) => {
            let mut entry = IndexEntry::new(new.mode, new.id, new.path.clone(), 0);
            entry.flags |= flags::UPDATE;
            result.entries.push(entry);
        }
        (Some(index), Some(old), None) if same(index, old) => {
            result.removals.push(index.path.clone());
        }
        (None, Some(_), None) => {}
        (Some(index), None, None) => {
            let mut kept = index.clone();
            kept.stage = 0;
            result.entries.push(kept);
        }
        _ => return Err(Error::MergeConflict(describe_tuple(src))),
    }
    Ok(result)
}

fn describe_tuple(src: &[Option<Candidate>]) -> String {
    for candidate in src {
        if let Some(Candidate::Entry(entry)) = candidate {
            return entry.path.to_string();
        }
    }
    "<unknown path>".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgo;
    use crate::index::cache_tree::WRITE_TREE_DRY_RUN;
    use crate::types::Tree;
    use tempfile::tempdir;

    fn test_repo() -> (tempfile::TempDir, Repo) {
        let dir = tempdir().unwrap();
        let repo = Repo::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    fn blob(repo: &Repo, content: &[u8]) -> Id {
        repo.odb().write(Kind::Blob, content).unwrap()
    }

    fn tree(repo: &Repo, entries: Vec<TreeEntry>) -> Id {
        let tree = Tree::new(entries).unwrap();
        repo.odb().write(Kind::Tree, &tree.encode()).unwrap()
    }

    fn index_with(entries: Vec<IndexEntry>) -> Index {
        let mut index = Index::new(2);
        for entry in entries {
            index
                .add(entry, add_opts::OK_TO_ADD | add_opts::SKIP_DFCHECK)
                .unwrap();
        }
        index
    }

    #[test]
    fn test_oneway_take_tree() {
        let (_dir, repo) = test_repo();
        let kept = blob(&repo, b"kept");
        let changed_old = blob(&repo, b"old");
        let changed_new = blob(&repo, b"new");
        let added = blob(&repo, b"added");

        let mut kept_entry = IndexEntry::new(Mode::Regular, kept, "kept.txt", 0);
        kept_entry.stat.mtime_sec = 12345;
        let index = index_with(vec![
            IndexEntry::new(Mode::Regular, changed_old, "changed.txt", 0),
            IndexEntry::new(Mode::Regular, blob(&repo, b"gone"), "doomed.txt", 0),
            kept_entry,
        ]);

        let target = tree(
            &repo,
            vec![
                TreeEntry::new(Mode::Regular, "added.txt", added),
                TreeEntry::new(Mode::Regular, "changed.txt", changed_new),
                TreeEntry::new(Mode::Regular, "kept.txt", kept),
            ],
        );

        let opts = UnpackOptions::default();
        let (new_index, removals) =
            unpack_trees(&repo, &index, &[target], &opts, &mut oneway_policy).unwrap();

        let paths: Vec<String> = new_index
            .entries()
            .iter()
            .map(|e| e.path.to_string())
            .collect();
        assert_eq!(paths, vec!["added.txt", "changed.txt", "kept.txt"]);
        assert_eq!(removals, vec![BString::from("doomed.txt")]);

        // unchanged entries carried their stat cache
        let kept_after = new_index.entry_at(b"kept.txt".as_bstr(), 0).unwrap();
        assert_eq!(kept_after.stat.mtime_sec, 12345);
        assert_eq!(kept_after.flags & flags::UPDATE, 0);
        let changed_after = new_index.entry_at(b"changed.txt".as_bstr(), 0).unwrap();
        assert_ne!(changed_after.flags & flags::UPDATE, 0);
        new_index.verify().unwrap();
    }

    #[test]
    fn test_reconcile_reproduces_tree_id() {
        // reconciling with "take the tree" yields an index whose
        // cache-tree root id equals the tree's id
        let (_dir, repo) = test_repo();
        let target = tree(
            &repo,
            vec![
                TreeEntry::new(Mode::Regular, "a", blob(&repo, b"a")),
                TreeEntry::new(
                    Mode::Tree,
                    "dir",
                    tree(
                        &repo,
                        vec![TreeEntry::new(Mode::Regular, "inner", blob(&repo, b"i"))],
                    ),
                ),
            ],
        );

        let index = index_with(vec![IndexEntry::new(
            Mode::Regular,
            blob(&repo, b"stale"),
            "stale.txt",
            0,
        )]);
        let opts = UnpackOptions::default();
        let (mut new_index, _removals) =
            unpack_trees(&repo, &index, &[target], &opts, &mut oneway_policy).unwrap();

        let root = new_index
            .write_tree(repo.odb(), WRITE_TREE_DRY_RUN)
            .unwrap();
        assert_eq!(root, target);
    }

    #[test]
    fn test_df_conflict_callback_order() {
        // index holds file "a"; the tree has subtree "a" containing
        // "a/b". the callback sees (index=file, tree=dir-sentinel) at
        // "a", then (index=absent, tree=entry) at "a/b", in that order
        let (_dir, repo) = test_repo();
        let x = blob(&repo, b"x");
        let y = blob(&repo, b"y");
        let sub = tree(&repo, vec![TreeEntry::new(Mode::Regular, "b", y)]);
        let target = tree(&repo, vec![TreeEntry::new(Mode::Tree, "a", sub)]);

        let index = index_with(vec![IndexEntry::new(Mode::Regular, x, "a", 0)]);

        let mut calls: Vec<Vec<Option<Candidate>>> = Vec::new();
        let mut recorder = |src: &[Option<Candidate>]| {
            calls.push(src.to_vec());
            Ok(MergeResult::default())
        };
        let opts = UnpackOptions::default();
        unpack_trees(&repo, &index, &[target], &opts, &mut recorder).unwrap();

        assert_eq!(calls.len(), 2);
        // first call: path "a" with the index file and the dir sentinel
        match (&calls[0][0], &calls[0][1]) {
            (Some(Candidate::Entry(entry)), Some(Candidate::DirConflict)) => {
                assert_eq!(entry.path, "a");
                assert_eq!(entry.id, x);
            }
            other => panic!("unexpected first tuple: {:?}", other),
        }
        // second call: path "a/b" from the tree only
        match (&calls[1][0], &calls[1][1]) {
            (None, Some(Candidate::Entry(entry))) => {
                assert_eq!(entry.path, "a/b");
                assert_eq!(entry.id, y);
            }
            other => panic!("unexpected second tuple: {:?}", other),
        }
    }

    #[test]
    fn test_file_in_tree_directory_in_index() {
        // the tree has file "a" while the index holds "a/b": the file
        // sorts first (as "a"), then the index entry is reached with
        // nothing left on the tree side
        let (_dir, repo) = test_repo();
        let f = blob(&repo, b"f");
        let target = tree(&repo, vec![TreeEntry::new(Mode::Regular, "a", f)]);
        let index = index_with(vec![IndexEntry::new(
            Mode::Regular,
            blob(&repo, b"inner"),
            "a/b",
            0,
        )]);

        let mut calls: Vec<Vec<Option<Candidate>>> = Vec::new();
        let mut recorder = |src: &[Option<Candidate>]| {
            calls.push(src.to_vec());
            Ok(MergeResult::default())
        };
        let opts = UnpackOptions::default();
        unpack_trees(&repo, &index, &[target], &opts, &mut recorder).unwrap();

        assert_eq!(calls.len(), 2);
        assert!(matches!(&calls[0][1], Some(Candidate::Entry(e)) if e.path == "a"));
        assert!(matches!(&calls[0][0], None));
        assert!(matches!(&calls[1][0], Some(Candidate::Entry(e)) if e.path == "a/b"));
        assert!(matches!(&calls[1][1], None));
    }

    #[test]
    fn test_gitlink_is_an_opaque_leaf() {
        let (_dir, repo) = test_repo();
        let submodule_commit = HashAlgo::Sha256.digest(b"some commit elsewhere");
        let target = tree(
            &repo,
            vec![TreeEntry::new(Mode::Gitlink, "vendored", submodule_commit)],
        );
        let index = index_with(vec![]);

        let mut seen = Vec::new();
        let mut recorder = |src: &[Option<Candidate>]| {
            if let Some(Candidate::Entry(entry)) = &src[1] {
                seen.push((entry.path.clone(), entry.mode));
            }
            Ok(MergeResult::default())
        };
        let opts = UnpackOptions::default();
        // the gitlink target is not in the store, and is never read
        unpack_trees(&repo, &index, &[target], &opts, &mut recorder).unwrap();
        assert_eq!(seen, vec![(BString::from("vendored"), Mode::Gitlink)]);
    }

    #[test]
    fn test_twoway_fast_forward() {
        let (_dir, repo) = test_repo();
        let same = blob(&repo, b"same");
        let v1 = blob(&repo, b"v1");
        let v2 = blob(&repo, b"v2");
        let added = blob(&repo, b"added");

        let old_tree = tree(
            &repo,
            vec![
                TreeEntry::new(Mode::Regular, "changed", v1),
                TreeEntry::new(Mode::Regular, "dropped", same),
                TreeEntry::new(Mode::Regular, "stable", same),
            ],
        );
        let new_tree = tree(
            &repo,
            vec![
                TreeEntry::new(Mode::Regular, "added", added),
                TreeEntry::new(Mode::Regular, "changed", v2),
                TreeEntry::new(Mode::Regular, "stable", same),
            ],
        );

        let mut stable_entry = IndexEntry::new(Mode::Regular, same, "stable", 0);
        stable_entry.stat.mtime_sec = 777;
        let index = index_with(vec![
            IndexEntry::new(Mode::Regular, v1, "changed", 0),
            IndexEntry::new(Mode::Regular, same, "dropped", 0),
            stable_entry,
        ]);

        let opts = UnpackOptions {
            head_idx: 2,
            ..Default::default()
        };
        let (new_index, removals) = unpack_trees(
            &repo,
            &index,
            &[old_tree, new_tree],
            &opts,
            &mut twoway_policy,
        )
        .unwrap();

        let paths: Vec<String> = new_index
            .entries()
            .iter()
            .map(|e| e.path.to_string())
            .collect();
        assert_eq!(paths, vec!["added", "changed", "stable"]);
        assert_eq!(removals, vec![BString::from("dropped")]);

        assert_eq!(new_index.entry_at(b"changed".as_bstr(), 0).unwrap().id, v2);
        // both trees agreed on "stable": the index entry (and its stat
        // cache) stands untouched
        let stable = new_index.entry_at(b"stable".as_bstr(), 0).unwrap();
        assert_eq!(stable.stat.mtime_sec, 777);
        assert_eq!(stable.flags & flags::UPDATE, 0);
    }

    #[test]
    fn test_twoway_conflict_aborts_cleanly() {
        let (_dir, repo) = test_repo();
        let v1 = blob(&repo, b"v1");
        let v2 = blob(&repo, b"v2");
        let local = blob(&repo, b"local edit");

        let old_tree = tree(&repo, vec![TreeEntry::new(Mode::Regular, "f", v1)]);
        let new_tree = tree(&repo, vec![TreeEntry::new(Mode::Regular, "f", v2)]);
        // the index diverged from the old tree
        let index = index_with(vec![IndexEntry::new(Mode::Regular, local, "f", 0)]);

        let opts = UnpackOptions {
            head_idx: 2,
            ..Default::default()
        };
        let result = unpack_trees(&repo, &index, &[old_tree, new_tree], &opts, &mut twoway_policy);
        assert!(matches!(result, Err(Error::MergeConflict(_))));
        // the input index is untouched
        assert_eq!(index.entry_at(b"f".as_bstr(), 0).unwrap().id, local);
    }

    #[test]
    fn test_threeway_stage_numbering() {
        let (_dir, repo) = test_repo();
        let base = blob(&repo, b"base");
        let ours = blob(&repo, b"ours");
        let theirs = blob(&repo, b"theirs");

        let t1 = tree(&repo, vec![TreeEntry::new(Mode::Regular, "f", base)]);
        let t2 = tree(&repo, vec![TreeEntry::new(Mode::Regular, "f", ours)]);
        let t3 = tree(&repo, vec![TreeEntry::new(Mode::Regular, "f", theirs)]);
        let index = index_with(vec![]);

        let mut stages = Vec::new();
        let mut recorder = |src: &[Option<Candidate>]| {
            for candidate in &src[1..] {
                if let Some(Candidate::Entry(entry)) = candidate {
                    stages.push((entry.stage, entry.id));
                }
            }
            Ok(MergeResult::default())
        };
        let opts = UnpackOptions {
            head_idx: 2,
            ..Default::default()
        };
        unpack_trees(&repo, &index, &[t1, t2, t3], &opts, &mut recorder).unwrap();

        assert_eq!(stages, vec![(1, base), (2, ours), (3, theirs)]);
    }

    #[test]
    fn test_check_updates_applies_actions() {
        let (dir, repo) = test_repo();
        let workdir = dir.path().join("worktree");
        std::fs::create_dir_all(workdir.join("sub")).unwrap();
        std::fs::write(workdir.join("sub/doomed"), b"bye").unwrap();

        let content = blob(&repo, b"fresh content");
        let target = tree(
            &repo,
            vec![TreeEntry::new(Mode::Regular, "new.txt", content)],
        );
        let index = index_with(vec![IndexEntry::new(
            Mode::Regular,
            blob(&repo, b"bye"),
            "sub/doomed",
            0,
        )]);

        let opts = UnpackOptions {
            update: true,
            ..Default::default()
        };
        let (mut new_index, removals) =
            unpack_trees(&repo, &index, &[target], &opts, &mut oneway_policy).unwrap();
        check_updates(&repo, &workdir, &mut new_index, &removals, &opts).unwrap();

        assert_eq!(
            std::fs::read(workdir.join("new.txt")).unwrap(),
            b"fresh content"
        );
        // the removal pruned the emptied directory
        assert!(!workdir.join("sub").exists());

        // written entries had their stat cache refreshed
        let written = new_index.entry_at(b"new.txt".as_bstr(), 0).unwrap();
        assert_eq!(written.flags & flags::UPDATE, 0);
        assert_ne!(written.stat, StatData::default());
    }

    #[test]
    fn test_index_only_leaves_worktree_alone() {
        let (dir, repo) = test_repo();
        let workdir = dir.path().join("worktree");
        std::fs::create_dir_all(&workdir).unwrap();
        std::fs::write(workdir.join("keep"), b"untouched").unwrap();

        let target = tree(
            &repo,
            vec![TreeEntry::new(Mode::Regular, "new", blob(&repo, b"n"))],
        );
        let index = index_with(vec![IndexEntry::new(
            Mode::Regular,
            blob(&repo, b"untouched"),
            "keep",
            0,
        )]);

        let opts = UnpackOptions {
            update: true,
            index_only: true,
            ..Default::default()
        };
        let (mut new_index, removals) =
            unpack_trees(&repo, &index, &[target], &opts, &mut oneway_policy).unwrap();
        check_updates(&repo, &workdir, &mut new_index, &removals, &opts).unwrap();

        assert!(workdir.join("keep").exists());
        assert!(!workdir.join("new").exists());
    }

    #[test]
    fn test_prefix_grafts_tree() {
        let (_dir, repo) = test_repo();
        let outside = IndexEntry::new(Mode::Regular, blob(&repo, b"o"), "outside.txt", 0);
        let index = index_with(vec![outside.clone()]);

        let target = tree(
            &repo,
            vec![TreeEntry::new(Mode::Regular, "inner", blob(&repo, b"i"))],
        );
        let opts = UnpackOptions {
            prefix: BString::from("vendor/"),
            ..Default::default()
        };
        let (new_index, _removals) =
            unpack_trees(&repo, &index, &[target], &opts, &mut oneway_policy).unwrap();

        let paths: Vec<String> = new_index
            .entries()
            .iter()
            .map(|e| e.path.to_string())
            .collect();
        assert_eq!(paths, vec!["outside.txt", "vendor/inner"]);
    }

    #[test]
    fn test_missing_tree_is_hard_error_unless_allowed() {
        let (_dir, repo) = test_repo();
        let ghost = HashAlgo::Sha256.digest(b"no such tree");
        let index = index_with(vec![]);

        let opts = UnpackOptions::default();
        assert!(unpack_trees(&repo, &index, &[ghost], &opts, &mut oneway_policy).is_err());

        let opts = UnpackOptions {
            missing_ok: true,
            ..Default::default()
        };
        let (new_index, _) =
            unpack_trees(&repo, &index, &[ghost], &opts, &mut oneway_policy).unwrap();
        assert!(new_index.is_empty());
    }
}
