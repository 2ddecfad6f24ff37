//! cache-tree: a recursive memo of "this directory's entries would
//! hash to this tree id", kept inside the index so tree writes can
//! skip unchanged subtrees

use bstr::{BStr, BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::{HashAlgo, Id};
use crate::index::entry::IndexEntry;
use crate::object::{hash_record, Odb};
use crate::types::{Kind, Mode, Tree, TreeEntry};

/// compute ids without writing tree records to the store
pub const WRITE_TREE_DRY_RUN: u32 = 1 << 0;
/// tolerate referenced objects missing from the store
pub const WRITE_TREE_MISSING_OK: u32 = 1 << 1;

/// one node of the memo; `entry_count` -1 means "invalid, recompute"
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheTree {
    pub entry_count: i32,
    pub id: Option<Id>,
    children: Vec<(BString, CacheTree)>,
}

impl Default for CacheTree {
    fn default() -> Self {
        Self::invalid()
    }
}

impl CacheTree {
    pub fn invalid() -> Self {
        Self {
            entry_count: -1,
            id: None,
            children: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.entry_count >= 0
    }

    pub fn children(&self) -> &[(BString, CacheTree)] {
        &self.children
    }

    /// the node covering a directory path ("" is the root)
    pub fn node_at(&self, dir: &BStr) -> Option<&CacheTree> {
        if dir.is_empty() {
            return Some(self);
        }
        let (component, rest) = match dir.find_byte(b'/') {
            Some(slash) => (&dir[..slash], &dir[slash + 1..]),
            None => (&dir[..], b"".as_bstr()),
        };
        let child = self
            .children
            .iter()
            .find(|(name, _)| name == component)
            .map(|(_, node)| node)?;
        child.node_at(rest.as_bstr())
    }

    /// is this node and every node below it valid?
    pub fn fully_valid(&self) -> bool {
        self.is_valid() && self.children.iter().all(|(_, c)| c.fully_valid())
    }

    /// invalidate the chain of nodes enclosing a changed path
    pub fn invalidate_path(&mut self, path: &BStr) {
        self.entry_count = -1;
        if let Some(slash) = path.find_byte(b'/') {
            let component = &path[..slash];
            if let Some((_, child)) = self
                .children
                .iter_mut()
                .find(|(name, _)| name == component)
            {
                child.invalidate_path(path[slash + 1..].as_bstr());
            }
        }
    }

    /// recompute invalid nodes leaves-up over sorted stage-0 entries,
    /// writing each directory's tree record unless dry-run; returns the
    /// root tree id
    pub fn update(&mut self, entries: &[IndexEntry], odb: &Odb, flags: u32) -> Result<Id> {
        let consumed = self.update_one(entries, b"".as_bstr(), odb, flags)?;
        if consumed != entries.len() {
            return Err(Error::IndexCorrupt(format!(
                "cache-tree consumed {} of {} entries",
                consumed,
                entries.len()
            )));
        }
        Ok(self.id.expect("update fills the id"))
    }

    fn update_one(
        &mut self,
        entries: &[IndexEntry],
        base: &BStr,
        odb: &Odb,
        flags: u32,
    ) -> Result<usize> {
        // a still-valid node is reused without rehashing
        if self.is_valid() && self.entry_count as usize == entries.len() {
            let id = self.id.expect("valid node has an id");
            if flags & (WRITE_TREE_MISSING_OK | WRITE_TREE_DRY_RUN) != 0 || odb.has(&id) {
                return Ok(self.entry_count as usize);
            }
            self.entry_count = -1;
        }

        let mut tree_entries = Vec::new();
        let mut new_children: Vec<(BString, CacheTree)> = Vec::new();
        let mut i = 0usize;

        while i < entries.len() {
            let entry = &entries[i];
            if entry.stage != 0 {
                return Err(Error::IndexUnmerged(entry.path.to_string()));
            }
            let rel = entry.path[base.len()..].as_bstr();

            let subdir = match rel.find_byte(b'/') {
                Some(slash) if slash + 1 < rel.len() => Some(slash),
                _ => None,
            };

            if let Some(slash) = subdir {
                let component = BString::from(&rel[..slash]);
                let mut sub_base = BString::from(base.as_bytes());
                sub_base.extend_from_slice(&component);
                sub_base.push(b'/');

                let span = entries[i..]
                    .iter()
                    .take_while(|e| e.path.starts_with(&sub_base))
                    .count();

                let mut child = self.take_child(component.as_bstr());
                let consumed = child.update_one(&entries[i..i + span], sub_base.as_bstr(), odb, flags)?;
                debug_assert_eq!(consumed, span);
                tree_entries.push(TreeEntry::new(
                    Mode::Tree,
                    component.clone(),
                    child.id.expect("child updated"),
                ));
                new_children.push((component, child));
                i += span;
            } else if entry.is_sparse_dir() {
                // the subtree id is carried by the entry itself
                let name = &rel[..rel.len() - 1];
                tree_entries.push(TreeEntry::new(Mode::Tree, name, entry.id));
                i += 1;
            } else {
                if flags & WRITE_TREE_MISSING_OK == 0
                    && !entry.mode.is_gitlink()
                    && !odb.has(&entry.id)
                {
                    return Err(Error::ObjectMissing(entry.id));
                }
                tree_entries.push(TreeEntry::new(entry.mode, rel, entry.id));
                i += 1;
            }
        }

        let tree = Tree::new(tree_entries)?;
        let payload = tree.encode();
        let id = if flags & WRITE_TREE_DRY_RUN != 0 {
            hash_record(odb.algo(), Kind::Tree, &payload)
        } else {
            odb.write(Kind::Tree, &payload)?
        };

        new_children.sort_by(|a, b| a.0.cmp(&b.0));
        self.children = new_children;
        self.entry_count = i as i32;
        self.id = Some(id);
        Ok(i)
    }

    fn take_child(&mut self, name: &BStr) -> CacheTree {
        if let Some(pos) = self.children.iter().position(|(n, _)| n == name) {
            self.children.remove(pos).1
        } else {
            CacheTree::invalid()
        }
    }

    /// serialize for the "TREE" index extension
    pub fn write_ext(&self, out: &mut Vec<u8>) {
        self.write_node(b"", out);
    }

    fn write_node(&self, name: &[u8], out: &mut Vec<u8>) {
        out.extend_from_slice(name);
        out.push(0);
        out.extend_from_slice(
            format!("{} {}\n", self.entry_count, self.children.len()).as_bytes(),
        );
        if let (true, Some(id)) = (self.is_valid(), self.id) {
            out.extend_from_slice(id.as_bytes());
        }
        for (child_name, child) in &self.children {
            child.write_node(child_name, out);
        }
    }

    /// parse the "TREE" extension payload
    pub fn parse_ext(payload: &[u8], algo: HashAlgo) -> Result<Self> {
        let mut cursor = 0usize;
        let (node, _name) = Self::parse_node(payload, &mut cursor, algo)?;
        if cursor != payload.len() {
            return Err(Error::IndexCorrupt("trailing cache-tree bytes".to_string()));
        }
        Ok(node)
    }

    fn parse_node(data: &[u8], cursor: &mut usize, algo: HashAlgo) -> Result<(Self, BString)> {
        let rest = &data[*cursor..];
        let nul = rest
            .find_byte(0)
            .ok_or_else(|| Error::IndexCorrupt("cache-tree: unterminated name".to_string()))?;
        let name = BString::from(&rest[..nul]);
        *cursor += nul + 1;

        let rest = &data[*cursor..];
        let eol = rest
            .find_byte(b'\n')
            .ok_or_else(|| Error::IndexCorrupt("cache-tree: missing newline".to_string()))?;
        let line = std::str::from_utf8(&rest[..eol])
            .map_err(|_| Error::IndexCorrupt("cache-tree: non-ascii counts".to_string()))?;
        *cursor += eol + 1;

        let (count, subtrees) = line
            .split_once(' ')
            .ok_or_else(|| Error::IndexCorrupt("cache-tree: malformed counts".to_string()))?;
        let entry_count: i32 = count
            .parse()
            .map_err(|_| Error::IndexCorrupt("cache-tree: bad entry count".to_string()))?;
        let subtrees: usize = subtrees
            .parse()
            .map_err(|_| Error::IndexCorrupt("cache-tree: bad subtree count".to_string()))?;

        let id = if entry_count >= 0 {
            let hsz = algo.raw_len();
            let raw = data
                .get(*cursor..*cursor + hsz)
                .ok_or_else(|| Error::IndexCorrupt("cache-tree: truncated id".to_string()))?;
            *cursor += hsz;
            Some(Id::from_bytes(algo, raw).expect("width checked"))
        } else {
            None
        };

        let mut children = Vec::with_capacity(subtrees);
        for _ in 0..subtrees {
            let (child, child_name) = Self::parse_node(data, cursor, algo)?;
            children.push((child_name, child));
        }

        Ok((
            Self {
                entry_count,
                id,
                children,
            },
            name,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_odb() -> (tempfile::TempDir, Odb) {
        let dir = tempdir().unwrap();
        let objects = dir.path().join("objects");
        let tmp = dir.path().join("tmp");
        std::fs::create_dir_all(objects.join("pack")).unwrap();
        std::fs::create_dir_all(&tmp).unwrap();
        let odb = Odb::new(HashAlgo::Sha256, objects, tmp, false, None);
        (dir, odb)
    }

    fn file_entry(odb: &Odb, path: &str, content: &[u8]) -> IndexEntry {
        let id = odb.write(Kind::Blob, content).unwrap();
        IndexEntry::new(Mode::Regular, id, path, 0)
    }

    #[test]
    fn test_update_flat() {
        let (_dir, odb) = test_odb();
        let entries = vec![
            file_entry(&odb, "a.txt", b"a"),
            file_entry(&odb, "b.txt", b"b"),
        ];
        let mut ct = CacheTree::invalid();
        let root = ct.update(&entries, &odb, 0).unwrap();

        assert_eq!(ct.entry_count, 2);
        assert_eq!(ct.id, Some(root));
        // the written tree exists and decodes to both entries
        let data = odb.read_kind(&root, Kind::Tree).unwrap();
        let tree = Tree::decode(HashAlgo::Sha256, &data.bytes).unwrap();
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_update_nested_counts() {
        let (_dir, odb) = test_odb();
        let entries = vec![
            file_entry(&odb, "a.txt", b"a"),
            file_entry(&odb, "dir/one", b"1"),
            file_entry(&odb, "dir/sub/two", b"2"),
            file_entry(&odb, "zz", b"z"),
        ];
        let mut ct = CacheTree::invalid();
        ct.update(&entries, &odb, 0).unwrap();

        assert_eq!(ct.entry_count, 4);
        let dir = ct.node_at(b"dir".as_bstr()).unwrap();
        assert_eq!(dir.entry_count, 2);
        let sub = ct.node_at(b"dir/sub".as_bstr()).unwrap();
        assert_eq!(sub.entry_count, 1);
    }

    #[test]
    fn test_dry_run_writes_nothing() {
        let (_dir, odb) = test_odb();
        let entries = vec![file_entry(&odb, "only", b"x")];
        let mut ct = CacheTree::invalid();
        let root = ct.update(&entries, &odb, WRITE_TREE_DRY_RUN).unwrap();
        assert!(!odb.has(&root));

        // a real run produces the same id and stores it
        let mut ct2 = CacheTree::invalid();
        let root2 = ct2.update(&entries, &odb, 0).unwrap();
        assert_eq!(root, root2);
        assert!(odb.has(&root2));
    }

    #[test]
    fn test_missing_object_rejected_unless_ok() {
        let (_dir, odb) = test_odb();
        let ghost = HashAlgo::Sha256.digest(b"ghost");
        let entries = vec![IndexEntry::new(Mode::Regular, ghost, "gone", 0)];

        let mut ct = CacheTree::invalid();
        assert!(matches!(
            ct.update(&entries, &odb, 0),
            Err(Error::ObjectMissing(_))
        ));

        let mut ct = CacheTree::invalid();
        assert!(ct.update(&entries, &odb, WRITE_TREE_MISSING_OK).is_ok());
    }

    #[test]
    fn test_unmerged_rejected() {
        let (_dir, odb) = test_odb();
        let blob = odb.write(Kind::Blob, b"x").unwrap();
        let entries = vec![IndexEntry::new(Mode::Regular, blob, "conflicted", 2)];
        let mut ct = CacheTree::invalid();
        assert!(matches!(
            ct.update(&entries, &odb, 0),
            Err(Error::IndexUnmerged(_))
        ));
    }

    #[test]
    fn test_invalidate_path_propagates_up() {
        let (_dir, odb) = test_odb();
        let entries = vec![
            file_entry(&odb, "dir/one", b"1"),
            file_entry(&odb, "dir/sub/two", b"2"),
            file_entry(&odb, "top", b"t"),
        ];
        let mut ct = CacheTree::invalid();
        ct.update(&entries, &odb, 0).unwrap();
        assert!(ct.fully_valid());

        ct.invalidate_path(b"dir/sub/two".as_bstr());
        assert!(!ct.is_valid());
        assert!(!ct.node_at(b"dir".as_bstr()).unwrap().is_valid());
        assert!(!ct.node_at(b"dir/sub".as_bstr()).unwrap().is_valid());

        // untouched siblings stay valid
        let entries2 = vec![
            file_entry(&odb, "dir/one", b"1"),
            file_entry(&odb, "dir/sub/two", b"2"),
            file_entry(&odb, "other/x", b"x"),
            file_entry(&odb, "top", b"t"),
        ];
        ct.update(&entries2, &odb, 0).unwrap();
        ct.invalidate_path(b"other/x".as_bstr());
        assert!(ct.node_at(b"dir".as_bstr()).unwrap().is_valid());
    }

    #[test]
    fn test_valid_node_reused_without_store() {
        let (_dir, odb) = test_odb();
        let entries = vec![file_entry(&odb, "dir/f", b"f"), file_entry(&odb, "g", b"g")];
        let mut ct = CacheTree::invalid();
        let first = ct.update(&entries, &odb, 0).unwrap();
        // updating again consumes the memo, producing the same root
        let second = ct.update(&entries, &odb, 0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_sparse_dir_entry_feeds_tree_directly() {
        let (_dir, odb) = test_odb();
        // build the subtree record the sparse entry stands for
        let blob = odb.write(Kind::Blob, b"inner").unwrap();
        let subtree = Tree::new(vec![TreeEntry::new(Mode::Regular, "inner.txt", blob)]).unwrap();
        let subtree_id = odb.write(Kind::Tree, &subtree.encode()).unwrap();

        let entries = vec![
            file_entry(&odb, "a", b"a"),
            IndexEntry::sparse_dir(subtree_id, "docs"),
        ];
        let mut ct = CacheTree::invalid();
        let root = ct.update(&entries, &odb, 0).unwrap();
        assert_eq!(ct.entry_count, 2);

        let data = odb.read_kind(&root, Kind::Tree).unwrap();
        let tree = Tree::decode(HashAlgo::Sha256, &data.bytes).unwrap();
        assert_eq!(tree.get(b"docs").unwrap().id, subtree_id);
    }

    #[test]
    fn test_ext_roundtrip() {
        let (_dir, odb) = test_odb();
        let entries = vec![
            file_entry(&odb, "dir/one", b"1"),
            file_entry(&odb, "dir/sub/two", b"2"),
            file_entry(&odb, "top", b"t"),
        ];
        let mut ct = CacheTree::invalid();
        ct.update(&entries, &odb, 0).unwrap();
        ct.invalidate_path(b"top".as_bstr());

        let mut payload = Vec::new();
        ct.write_ext(&mut payload);
        let parsed = CacheTree::parse_ext(&payload, HashAlgo::Sha256).unwrap();
        assert_eq!(parsed, ct);
    }
}
