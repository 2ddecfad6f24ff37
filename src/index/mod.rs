//! the staging area: an ordered, persisted mapping from path to
//! (mode, id, stat-cache, stage), with cache-tree, sparse-directory,
//! split-index and resolve-undo support

pub mod cache_tree;
pub mod entry;
pub mod format;
pub mod lock;
pub mod resolve_undo;
pub mod sparse;
pub mod split;

pub use cache_tree::{CacheTree, WRITE_TREE_DRY_RUN, WRITE_TREE_MISSING_OK};
pub use entry::{flags, IndexEntry, StatData};
pub use format::{RawExtension, RawIndex};
pub use lock::IndexLock;
pub use resolve_undo::ResolveUndo;
pub use sparse::{SparseMode, SparsePatterns};

use std::collections::HashMap;
use std::path::Path;

use bstr::{BStr, BString, ByteSlice};

use crate::config::CoreConfig;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashAlgo, Id};
use crate::object::{hash_record, Odb};
use crate::repo::Repo;
use crate::types::Kind;

/// options for `Index::add`
pub mod add_opts {
    /// inserting a path not currently present is allowed
    pub const OK_TO_ADD: u32 = 1 << 0;
    /// replacing entries that clash (file/directory) is allowed
    pub const OK_TO_REPLACE: u32 = 1 << 1;
    /// skip the file/directory clash check
    pub const SKIP_DFCHECK: u32 = 1 << 2;
    /// caller asserts the entry sorts after everything present
    pub const JUST_APPEND: u32 = 1 << 3;
    /// never replace an existing entry
    pub const NEW_ONLY: u32 = 1 << 4;
    /// do not invalidate the enclosing cache-tree chain
    pub const KEEP_CACHE_TREE: u32 = 1 << 5;
}

/// options for `Index::refresh`
pub mod refresh_opts {
    /// tolerate unmerged entries instead of failing
    pub const ALLOW_UNMERGED: u32 = 1 << 0;
    /// absent working-tree files are not an error
    pub const IGNORE_MISSING: u32 = 1 << 1;
}

/// the in-memory index
pub struct Index {
    version: u32,
    entries: Vec<IndexEntry>,
    cache_tree: Option<CacheTree>,
    resolve_undo: Vec<ResolveUndo>,
    unknown_extensions: Vec<RawExtension>,
    sparse_mode: SparseMode,
    ignore_case: bool,
    /// entry count per exact path bytes, any stage
    name_hash: HashMap<BString, usize>,
    /// entry count per case-folded path, kept when ignore_case is set
    folded_hash: HashMap<String, usize>,
    /// entry count per enclosing directory
    dir_hash: HashMap<BString, usize>,
}

impl Index {
    pub fn new(version: u32) -> Self {
        Self {
            version,
            entries: Vec::new(),
            cache_tree: None,
            resolve_undo: Vec::new(),
            unknown_extensions: Vec::new(),
            sparse_mode: SparseMode::Expanded,
            ignore_case: false,
            name_hash: HashMap::new(),
            folded_hash: HashMap::new(),
            dir_hash: HashMap::new(),
        }
    }

    /// read-only load; takes no lock. a missing file is an empty index
    pub fn load(repo: &Repo) -> Result<Self> {
        let path = repo.index_file();
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut index = Self::new(repo.config().index.version);
                index.ignore_case = repo.config().core.ignore_case;
                return Ok(index);
            }
            Err(e) => {
                return Err(Error::Io {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        let raw = format::parse(&data, repo.algo())?;
        let raw = split::materialize(raw, repo)?;

        let mut index = Self::new(raw.version);
        index.ignore_case = repo.config().core.ignore_case;
        index.entries = raw.entries;
        index.cache_tree = raw.cache_tree;
        index.resolve_undo = raw.resolve_undo;
        index.unknown_extensions = raw.unknown;
        index.sparse_mode = if index.entries.iter().any(|e| e.is_sparse_dir()) {
            SparseMode::Collapsed
        } else {
            SparseMode::Expanded
        };
        index.rebuild_hashes();

        if repo.force_full_index() {
            index.ensure_full(repo.odb())?;
        }
        Ok(index)
    }

    /// take the write lock, then load; the lock is held for the whole
    /// intended mutation and resolved by `write` or rollback
    pub fn load_locked(repo: &Repo) -> Result<(Self, IndexLock)> {
        let lock = IndexLock::acquire(repo.index_file())?;
        let index = Self::load(repo)?;
        Ok((index, lock))
    }

    /// serialize into the held lock and commit it over the index file
    pub fn write(&mut self, repo: &Repo, mut lock: IndexLock) -> Result<()> {
        if repo.force_sparse_index() || repo.config().index.sparse {
            self.convert_to_sparse(repo)?;
        }

        let raw_entries;
        let link;
        if repo.config().index.split {
            let plan = split::plan_write(repo, &self.entries, self.version)?;
            raw_entries = plan.overlay;
            link = Some(plan.link);
        } else {
            raw_entries = self.entries.clone();
            link = None;
        }

        let raw = RawIndex {
            version: self.version,
            entries: raw_entries,
            cache_tree: self.cache_tree.clone(),
            resolve_undo: self.resolve_undo.clone(),
            link,
            unknown: self.unknown_extensions.clone(),
        };
        let (bytes, _digest) =
            format::serialize(&raw, repo.algo(), repo.config().index.skip_hash);
        lock.write(&bytes)?;
        lock.commit()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn set_version(&mut self, version: u32) {
        self.version = version.clamp(format::VERSION_MIN, format::VERSION_MAX);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    pub fn entry(&self, pos: usize) -> &IndexEntry {
        &self.entries[pos]
    }

    pub fn sparse_mode(&self) -> SparseMode {
        self.sparse_mode
    }

    pub fn cache_tree(&self) -> Option<&CacheTree> {
        self.cache_tree.as_ref()
    }

    pub fn resolve_undo(&self) -> &[ResolveUndo] {
        &self.resolve_undo
    }

    /// position of (path, stage), or the insertion slot
    pub fn pos(&self, path: &BStr, stage: u8) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|e| e.cmp_key(path, stage))
    }

    pub fn entry_at(&self, path: &BStr, stage: u8) -> Option<&IndexEntry> {
        self.pos(path, stage).ok().map(|i| &self.entries[i])
    }

    /// O(1) existence check by exact path bytes, any stage
    pub fn has_path(&self, path: &BStr) -> bool {
        self.name_hash.contains_key(path.as_bytes())
    }

    /// case-insensitive existence check; falls back to exact matching
    /// when the repository is case-sensitive
    pub fn has_path_folded(&self, path: &BStr) -> bool {
        if !self.ignore_case {
            return self.has_path(path);
        }
        self.folded_hash.contains_key(&fold_case(path))
    }

    /// does any entry live inside this directory?
    pub fn dir_has_entries(&self, dir: &BStr) -> bool {
        self.dir_hash.contains_key(dir.as_bytes())
    }

    pub fn has_unmerged(&self) -> bool {
        self.entries.iter().any(|e| e.stage != 0)
    }

    /// insert or replace an entry, preserving order, the stage
    /// invariants, and the file/directory exclusion
    pub fn add(&mut self, entry: IndexEntry, opts: u32) -> Result<()> {
        entry::verify_path(entry.path.as_bstr(), entry.mode)?;

        if opts & add_opts::JUST_APPEND != 0 {
            if let Some(last) = self.entries.last() {
                if last.cmp_key(entry.path.as_bstr(), entry.stage) != std::cmp::Ordering::Less {
                    return Err(Error::IndexCorrupt(format!(
                        "append out of order: {}",
                        entry.path
                    )));
                }
            }
            if opts & add_opts::KEEP_CACHE_TREE == 0 {
                self.invalidate_path(entry.path.as_bstr());
            }
            self.hash_insert(&entry);
            self.entries.push(entry);
            return Ok(());
        }

        if opts & add_opts::SKIP_DFCHECK == 0 {
            self.check_file_dir_clash(&entry, opts)?;
        }

        // a resolved path replaces its conflict stages; a conflict
        // stage evicts the resolved entry
        if entry.stage == 0 {
            self.record_resolve_undo(&entry.path);
            self.remove_stages(&entry.path, 1..=3);
        } else {
            self.remove_stages(&entry.path, 0..=0);
        }

        match self.pos(entry.path.as_bstr(), entry.stage) {
            Ok(pos) => {
                if opts & add_opts::NEW_ONLY != 0 {
                    return Err(Error::TreeEntryConflict(format!(
                        "entry already exists: {}",
                        entry.path
                    )));
                }
                if opts & add_opts::KEEP_CACHE_TREE == 0 {
                    self.invalidate_path(entry.path.as_bstr());
                }
                self.hash_remove_at(pos);
                self.hash_insert(&entry);
                self.entries[pos] = entry;
            }
            Err(pos) => {
                if opts & add_opts::OK_TO_ADD == 0 {
                    return Err(Error::TreeEntryConflict(format!(
                        "refusing to add new entry: {}",
                        entry.path
                    )));
                }
                if opts & add_opts::KEEP_CACHE_TREE == 0 {
                    self.invalidate_path(entry.path.as_bstr());
                }
                self.hash_insert(&entry);
                self.entries.insert(pos, entry);
            }
        }
        Ok(())
    }

    /// no two stage-0 entries may be a file and a directory of the
    /// same name; with OK_TO_REPLACE the losing side is evicted
    fn check_file_dir_clash(&mut self, entry: &IndexEntry, opts: u32) -> Result<()> {
        // adding "a" clashes with entries under "a/"
        let as_dir = {
            let mut d = entry.path.clone();
            if !d.ends_with(b"/") {
                d.push(b'/');
            }
            d
        };
        let dir_key = &as_dir[..as_dir.len() - 1];
        let clashes_below = self.dir_hash.contains_key(dir_key)
            || self.name_hash.contains_key(&as_dir[..]);
        if clashes_below && !entry.is_sparse_dir() {
            if opts & add_opts::OK_TO_REPLACE == 0 {
                return Err(Error::TreeEntryConflict(format!(
                    "'{}' clashes with a directory",
                    entry.path
                )));
            }
            self.remove_prefix(as_dir.as_bstr());
        }

        // adding "a/b" clashes with a file entry "a" (or sparse "a/")
        let mut cursor = 0usize;
        while let Some(slash) = entry.path[cursor..].find_byte(b'/') {
            let ancestor = entry.path[..cursor + slash].as_bstr();
            let mut sparse_form = BString::from(ancestor.as_bytes());
            sparse_form.push(b'/');
            let clashing = if ancestor.as_bytes() != dir_key
                && self.name_hash.contains_key(ancestor.as_bytes())
            {
                Some(ancestor.to_owned())
            } else if sparse_form != entry.path && self.name_hash.contains_key(&sparse_form[..]) {
                // a sparse-directory entry covers this subtree
                Some(sparse_form)
            } else {
                None
            };
            if let Some(clash) = clashing {
                if opts & add_opts::OK_TO_REPLACE == 0 {
                    return Err(Error::TreeEntryConflict(format!(
                        "'{}' clashes with entry '{}'",
                        entry.path, clash
                    )));
                }
                self.remove_path(clash.as_bstr());
            }
            cursor += slash + 1;
        }
        Ok(())
    }

    /// remove every entry at path (all stages); returns whether any
    /// entry was removed
    pub fn remove_path(&mut self, path: &BStr) -> bool {
        let start = match self.pos(path, 0) {
            Ok(pos) => pos,
            Err(pos) => pos,
        };
        let mut end = start;
        while end < self.entries.len() && self.entries[end].path == path {
            end += 1;
        }
        if start == end {
            return false;
        }
        self.invalidate_path(path);
        for pos in start..end {
            self.hash_remove_at(pos);
        }
        self.entries.drain(start..end);
        true
    }

    /// remove the entry at a known position
    pub fn remove_at(&mut self, pos: usize) -> IndexEntry {
        let path = self.entries[pos].path.clone();
        self.invalidate_path(path.as_bstr());
        self.hash_remove_at(pos);
        self.entries.remove(pos)
    }

    /// remove every entry under a directory prefix ("a/")
    fn remove_prefix(&mut self, prefix: &BStr) {
        let start = match self.pos(prefix, 0) {
            Ok(pos) => pos,
            Err(pos) => pos,
        };
        let mut end = start;
        while end < self.entries.len() && self.entries[end].path.starts_with(prefix.as_bytes()) {
            end += 1;
        }
        // the sparse entry "a/" itself sits at `start` when present
        for pos in start..end {
            self.hash_remove_at(pos);
        }
        if start < end {
            self.invalidate_path(prefix);
            self.entries.drain(start..end);
        }
    }

    fn remove_stages(&mut self, path: &BString, stages: std::ops::RangeInclusive<u8>) {
        let mut pos = match self.pos(path.as_bstr(), 0) {
            Ok(pos) => pos,
            Err(pos) => pos,
        };
        while pos < self.entries.len() && self.entries[pos].path == *path {
            if stages.contains(&self.entries[pos].stage) {
                self.hash_remove_at(pos);
                self.entries.remove(pos);
            } else {
                pos += 1;
            }
        }
    }

    /// capture stage {1,2,3} entries about to be replaced by a
    /// resolution, for the resolve-undo extension
    fn record_resolve_undo(&mut self, path: &BString) {
        let stages: Vec<&IndexEntry> = self
            .entries_at_path(path.as_bstr())
            .iter()
            .filter(|e| e.stage != 0)
            .copied()
            .collect();
        if stages.is_empty() {
            return;
        }
        let record = ResolveUndo::capture(path, &stages);
        self.resolve_undo.retain(|r| r.path != *path);
        self.resolve_undo.push(record);
    }

    /// every entry at a path, in stage order
    pub fn entries_at_path(&self, path: &BStr) -> Vec<&IndexEntry> {
        let start = match self.pos(path, 0) {
            Ok(pos) => pos,
            Err(pos) => pos,
        };
        self.entries[start..]
            .iter()
            .take_while(|e| e.path == path)
            .collect()
    }

    /// restore the recorded conflict stages for a resolved path
    pub fn unresolve(&mut self, path: &BStr) -> Result<()> {
        let Some(pos) = self.resolve_undo.iter().position(|r| r.path == path) else {
            return Err(Error::PathNotFound(path.to_string()));
        };
        let record = self.resolve_undo.remove(pos);
        self.remove_path(path);
        for entry in record.to_entries()? {
            self.add(entry, add_opts::OK_TO_ADD)?;
        }
        Ok(())
    }

    /// remove at old path, add at new path
    pub fn rename(&mut self, old: &BStr, new: &BStr) -> Result<()> {
        let old_entries = self.entries_at_path(old);
        if old_entries.is_empty() {
            return Err(Error::PathNotFound(old.to_string()));
        }
        if old_entries.iter().any(|e| e.stage != 0) {
            return Err(Error::IndexUnmerged(old.to_string()));
        }
        let mut moved = old_entries[0].clone();
        moved.path = BString::from(new.as_bytes());
        self.remove_path(old);
        self.add(moved, add_opts::OK_TO_ADD | add_opts::OK_TO_REPLACE)
    }

    /// lstat every tracked file and refresh the stat cache; returns
    /// the paths whose content no longer matches the index
    pub fn refresh(
        &mut self,
        workdir: &Path,
        core: &CoreConfig,
        algo: HashAlgo,
        opts: u32,
    ) -> Result<Vec<BString>> {
        let mut stale = Vec::new();
        for i in 0..self.entries.len() {
            let entry = &self.entries[i];
            if entry.is_sparse_dir() || entry.skip_worktree() || entry.mode.is_gitlink() {
                continue;
            }
            if entry.stage != 0 {
                if opts & refresh_opts::ALLOW_UNMERGED == 0 {
                    return Err(Error::IndexUnmerged(entry.path.to_string()));
                }
                continue;
            }
            if entry.flags & flags::ASSUME_VALID != 0 {
                self.entries[i].flags |= flags::UPTODATE;
                continue;
            }

            let file_path = workdir.join(bytes_to_path(entry.path.as_bstr()));
            let meta = match std::fs::symlink_metadata(&file_path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    if opts & refresh_opts::IGNORE_MISSING != 0 {
                        self.entries[i].flags &= !flags::UPTODATE;
                        continue;
                    }
                    return Err(Error::Io {
                        path: file_path,
                        source: e,
                    });
                }
                Err(_) => {
                    // a transient lstat failure counts as changed
                    stale.push(entry.path.clone());
                    self.entries[i].flags &= !flags::UPTODATE;
                    continue;
                }
            };

            let current = StatData::from_metadata(&meta);
            let type_matches = (entry.mode.is_symlink() && meta.file_type().is_symlink())
                || (entry.mode.is_file() && meta.file_type().is_file());
            if !type_matches {
                stale.push(entry.path.clone());
                self.entries[i].flags &= !flags::UPTODATE;
                continue;
            }
            if entry.stat.matches(&current, core) {
                self.entries[i].flags |= flags::UPTODATE;
                continue;
            }

            // the stat cache went cold; the content decides
            let content = if meta.file_type().is_symlink() {
                std::fs::read_link(&file_path)
                    .map(|t| t.as_os_str().as_encoded_bytes().to_vec())
                    .with_path(&file_path)?
            } else {
                std::fs::read(&file_path).with_path(&file_path)?
            };
            if hash_record(algo, Kind::Blob, &content) == entry.id {
                self.entries[i].stat = current;
                self.entries[i].flags |= flags::UPTODATE;
            } else {
                self.entries[i].flags &= !flags::UPTODATE;
                stale.push(self.entries[i].path.clone());
            }
        }
        Ok(stale)
    }

    /// invalidate the cache-tree chain covering a path
    pub fn invalidate_path(&mut self, path: &BStr) {
        if let Some(cache_tree) = &mut self.cache_tree {
            cache_tree.invalidate_path(path);
        }
    }

    /// recompute the cache-tree and return the root tree id
    pub fn write_tree(&mut self, odb: &Odb, write_flags: u32) -> Result<Id> {
        let cache_tree = self.cache_tree.get_or_insert_with(CacheTree::invalid);
        cache_tree.update(&self.entries, odb, write_flags)
    }

    /// expand every sparse-directory entry (recursively)
    pub fn ensure_full(&mut self, odb: &Odb) -> Result<()> {
        if !matches!(
            self.sparse_mode,
            SparseMode::Collapsed | SparseMode::PartiallySparse
        ) {
            return Ok(());
        }
        let mut expanded = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            if entry.is_sparse_dir() {
                expanded.extend(sparse::expand_full(entry, odb)?);
            } else {
                expanded.push(entry.clone());
            }
        }
        self.entries = expanded;
        // sparse and full counts disagree, so the memo cannot survive
        self.cache_tree = None;
        self.sparse_mode = SparseMode::Expanded;
        self.rebuild_hashes();
        Ok(())
    }

    /// collapse eligible subtrees to sparse-directory entries; a no-op
    /// unless cone-mode sparse checkout is active and the index is clean
    pub fn convert_to_sparse(&mut self, repo: &Repo) -> Result<()> {
        let core = &repo.config().core;
        if !(core.sparse_checkout && core.sparse_checkout_cone) {
            return Ok(());
        }
        if self.has_unmerged() {
            return Ok(());
        }

        // the collapsed entries carry tree ids, so those trees must
        // exist: compute (and store) the cache-tree first
        let root_valid = self
            .cache_tree
            .as_ref()
            .is_some_and(|ct| ct.fully_valid());
        if !root_valid {
            self.write_tree(repo.odb(), 0)?;
        }
        let cache_tree = self.cache_tree.take().expect("just computed");

        let patterns = SparsePatterns::load(repo)?;
        self.entries = sparse::collapse(&self.entries, &patterns, &cache_tree);
        self.sparse_mode = if self.entries.iter().any(|e| e.is_sparse_dir()) {
            SparseMode::Collapsed
        } else {
            SparseMode::Expanded
        };
        self.rebuild_hashes();
        Ok(())
    }

    /// expand just enough sparse-directory entries to make `path`
    /// addressable
    pub fn expand_to(&mut self, odb: &Odb, path: &BStr) -> Result<()> {
        loop {
            let covering = self.entries.iter().position(|e| {
                e.is_sparse_dir()
                    && path.len() > e.path.len()
                    && path.starts_with(&e.path)
            });
            let Some(pos) = covering else {
                return Ok(());
            };
            let entry = self.entries[pos].clone();
            let expansion = sparse::expand_one_level(&entry, odb)?;
            self.entries.splice(pos..pos + 1, expansion);
            self.cache_tree = None;
            self.sparse_mode = SparseMode::PartiallySparse;
            self.rebuild_hashes();
        }
    }

    /// validate the structural invariants; used by tests and fsck
    pub fn verify(&self) -> Result<()> {
        // strict ordering
        for window in self.entries.windows(2) {
            if window[1].cmp_key(window[0].path.as_bstr(), window[0].stage)
                != std::cmp::Ordering::Greater
            {
                return Err(Error::IndexCorrupt(format!(
                    "entries out of order: {} then {}",
                    window[0].path, window[1].path
                )));
            }
        }
        // stage multisets: {0}, {1,2,3}, {1,2}, {1,3}, {2,3}
        let mut i = 0;
        while i < self.entries.len() {
            let path = &self.entries[i].path;
            let mut stages = Vec::new();
            while i < self.entries.len() && self.entries[i].path == *path {
                stages.push(self.entries[i].stage);
                i += 1;
            }
            let ok = matches!(
                stages.as_slice(),
                [0] | [1, 2, 3] | [1, 2] | [1, 3] | [2, 3]
            );
            if !ok {
                return Err(Error::IndexCorrupt(format!(
                    "invalid stage set {:?} at {}",
                    stages, path
                )));
            }
        }
        // file/dir exclusion and sparse-entry shape
        for entry in &self.entries {
            if entry.stage != 0 {
                continue;
            }
            let mut as_dir = entry.path.clone();
            if !as_dir.ends_with(b"/") {
                as_dir.push(b'/');
                if self.dir_hash.contains_key(&as_dir[..as_dir.len() - 1])
                    || self.name_hash.contains_key(&as_dir[..])
                {
                    return Err(Error::IndexCorrupt(format!(
                        "file and directory both at {}",
                        entry.path
                    )));
                }
            }
            if entry.is_sparse_dir() {
                if !entry.skip_worktree() {
                    return Err(Error::IndexCorrupt(format!(
                        "sparse directory without skip-worktree: {}",
                        entry.path
                    )));
                }
                if self
                    .entries
                    .iter()
                    .any(|e| e.path != entry.path && e.path.starts_with(&entry.path[..]))
                {
                    return Err(Error::IndexCorrupt(format!(
                        "entries inside sparse directory {}",
                        entry.path
                    )));
                }
            }
        }
        Ok(())
    }

    fn rebuild_hashes(&mut self) {
        self.name_hash.clear();
        self.folded_hash.clear();
        self.dir_hash.clear();
        let entries = std::mem::take(&mut self.entries);
        for entry in &entries {
            self.hash_insert(entry);
        }
        self.entries = entries;
    }

    fn hash_insert(&mut self, entry: &IndexEntry) {
        *self.name_hash.entry(entry.path.clone()).or_insert(0) += 1;
        if self.ignore_case {
            *self
                .folded_hash
                .entry(fold_case(entry.path.as_bstr()))
                .or_insert(0) += 1;
        }
        for dir in ancestor_dirs(entry.path.as_bstr()) {
            *self.dir_hash.entry(BString::from(dir)).or_insert(0) += 1;
        }
    }

    fn hash_remove_at(&mut self, pos: usize) {
        let entry = &self.entries[pos];
        decrement(&mut self.name_hash, entry.path.as_bytes());
        if self.ignore_case {
            let key = fold_case(entry.path.as_bstr());
            if let Some(count) = self.folded_hash.get_mut(&key) {
                *count -= 1;
                if *count == 0 {
                    self.folded_hash.remove(&key);
                }
            }
        }
        for dir in ancestor_dirs(entry.path.as_bstr()) {
            decrement(&mut self.dir_hash, dir);
        }
    }
}

fn decrement(map: &mut HashMap<BString, usize>, key: &[u8]) {
    if let Some(count) = map.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            map.remove(key);
        }
    }
}

/// the proper ancestor directories of a path ("a/b/c" -> "a", "a/b")
fn ancestor_dirs(path: &BStr) -> Vec<&[u8]> {
    let mut dirs = Vec::new();
    let trimmed = if path.ends_with(b"/") {
        &path[..path.len() - 1]
    } else {
        &path[..]
    };
    let mut cursor = 0usize;
    while let Some(slash) = trimmed[cursor..].find_byte(b'/') {
        dirs.push(trimmed[..cursor + slash].as_bytes());
        cursor += slash + 1;
    }
    dirs
}

fn fold_case(path: &BStr) -> String {
    path.to_str_lossy().to_lowercase()
}

#[cfg(unix)]
fn bytes_to_path(bytes: &BStr) -> &Path {
    use std::os::unix::ffi::OsStrExt;
    Path::new(std::ffi::OsStr::from_bytes(bytes))
}
