use std::cmp::Ordering;

use bstr::{BStr, BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::{HashAlgo, Id};
use crate::types::Mode;

/// compare two entry names under the tree-entry ordering
///
/// byte-lexicographic, except a subtree entry orders as if its name ended
/// in '/'. this ordering is canonical: a tree's content-address depends on it.
pub fn entry_name_cmp(a: &[u8], a_is_dir: bool, b: &[u8], b_is_dir: bool) -> Ordering {
    let len = a.len().min(b.len());
    match a[..len].cmp(&b[..len]) {
        Ordering::Equal => {}
        other => return other,
    }
    let ca = match a.get(len) {
        Some(&c) => c,
        None if a_is_dir => b'/',
        None => 0,
    };
    let cb = match b.get(len) {
        Some(&c) => c,
        None if b_is_dir => b'/',
        None => 0,
    };
    ca.cmp(&cb).then(a.len().cmp(&b.len()))
}

/// a single entry in a tree record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: Mode,
    pub name: BString,
    pub id: Id,
}

impl TreeEntry {
    pub fn new(mode: Mode, name: impl Into<BString>, id: Id) -> Self {
        Self {
            mode,
            name: name.into(),
            id,
        }
    }

    fn cmp_entry(&self, other: &Self) -> Ordering {
        entry_name_cmp(
            &self.name,
            self.mode.is_tree(),
            &other.name,
            other.mode.is_tree(),
        )
    }
}

/// a decoded tree record: entries in canonical order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// create a tree, canonicalizing and validating the entries
    ///
    /// entries are sorted under the tree-entry comparison regardless of
    /// insertion order; two entries comparing equal are a conflict.
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        for entry in &entries {
            validate_entry_name(entry.name.as_bstr())?;
        }

        entries.sort_by(|a, b| a.cmp_entry(b));

        for window in entries.windows(2) {
            if window[0].cmp_entry(&window[1]) == Ordering::Equal {
                return Err(Error::TreeEntryConflict(format!(
                    "duplicate entry name: {}",
                    window[0].name
                )));
            }
        }

        Ok(Self { entries })
    }

    /// create an empty tree
    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<TreeEntry> {
        self.entries
    }

    /// look up an entry by name; a subtree and a file of the same name are
    /// distinct, the subtree probe wins
    pub fn get(&self, name: &[u8]) -> Option<&TreeEntry> {
        for is_dir in [true, false] {
            if let Ok(i) = self
                .entries
                .binary_search_by(|e| entry_name_cmp(&e.name, e.mode.is_tree(), name, is_dir))
            {
                return Some(&self.entries[i]);
            }
        }
        None
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// serialize to the canonical payload: `<octal-mode> <name>\0<raw-id>`
    /// per entry, in canonical order
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for entry in &self.entries {
            out.extend_from_slice(entry.mode.octal().as_bytes());
            out.push(b' ');
            out.extend_from_slice(&entry.name);
            out.push(0);
            out.extend_from_slice(entry.id.as_bytes());
        }
        out
    }

    /// decode a canonical payload, verifying entry order
    pub fn decode(algo: HashAlgo, payload: &[u8]) -> Result<Self> {
        let mut entries = Vec::new();
        for entry in TreeIter::new(algo, payload) {
            entries.push(entry?);
        }
        for window in entries.windows(2) {
            match window[0].cmp_entry(&window[1]) {
                Ordering::Less => {}
                _ => {
                    return Err(Error::TreeEntryConflict(format!(
                        "entries out of order: {} then {}",
                        window[0].name, window[1].name
                    )))
                }
            }
        }
        Ok(Self { entries })
    }
}

/// zero-copy iterator over a raw tree payload
pub struct TreeIter<'a> {
    algo: HashAlgo,
    rest: &'a [u8],
}

impl<'a> TreeIter<'a> {
    pub fn new(algo: HashAlgo, payload: &'a [u8]) -> Self {
        Self {
            algo,
            rest: payload,
        }
    }

    fn parse_one(&mut self) -> Result<TreeEntry> {
        let sp = self
            .rest
            .find_byte(b' ')
            .ok_or_else(|| Error::TreeEntryConflict("truncated mode".to_string()))?;
        let mode = Mode::from_octal(&self.rest[..sp])?;
        self.rest = &self.rest[sp + 1..];

        let nul = self
            .rest
            .find_byte(0)
            .ok_or_else(|| Error::TreeEntryConflict("unterminated name".to_string()))?;
        let name = BString::from(&self.rest[..nul]);
        self.rest = &self.rest[nul + 1..];

        let hsz = self.algo.raw_len();
        if self.rest.len() < hsz {
            return Err(Error::TreeEntryConflict("truncated id".to_string()));
        }
        let id = Id::from_bytes(self.algo, &self.rest[..hsz]).expect("width checked");
        self.rest = &self.rest[hsz..];

        validate_entry_name(name.as_bstr())?;
        Ok(TreeEntry { mode, name, id })
    }
}

impl<'a> Iterator for TreeIter<'a> {
    type Item = Result<TreeEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let entry = self.parse_one();
        if entry.is_err() {
            // stop after a malformed entry
            self.rest = &[];
        }
        Some(entry)
    }
}

/// validate a single path component
fn validate_entry_name(name: &BStr) -> Result<()> {
    if name.is_empty() {
        return Err(Error::PathInvalid("empty name".to_string()));
    }
    if name.contains(&b'/') {
        return Err(Error::PathInvalid(format!("name contains '/': {}", name)));
    }
    if name.contains(&0) {
        return Err(Error::PathInvalid(format!(
            "name contains null byte: {:?}",
            name
        )));
    }
    if name == "." || name == ".." {
        return Err(Error::PathInvalid(format!("reserved name: {}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blob_id(n: u8) -> Id {
        Id::from_bytes(HashAlgo::Sha256, &[n; 32]).unwrap()
    }

    #[test]
    fn test_tree_empty() {
        let t = Tree::empty();
        assert!(t.is_empty());
        assert!(t.encode().is_empty());
    }

    #[test]
    fn test_tree_sorting() {
        let entries = vec![
            TreeEntry::new(Mode::Regular, "zebra", blob_id(1)),
            TreeEntry::new(Mode::Regular, "alpha", blob_id(2)),
            TreeEntry::new(Mode::Regular, "beta", blob_id(3)),
        ];
        let tree = Tree::new(entries).unwrap();
        let names: Vec<_> = tree.entries().iter().map(|e| e.name.to_string()).collect();
        assert_eq!(names, vec!["alpha", "beta", "zebra"]);
    }

    #[test]
    fn test_subtree_orders_with_trailing_slash() {
        // "foo" as a file sorts before "foo.c" ('.' is greater than
        // end-of-name), and "foo" as a subtree sorts after "foo.c"
        // because it compares as "foo/"
        let entries = vec![
            TreeEntry::new(Mode::Tree, "foo", blob_id(1)),
            TreeEntry::new(Mode::Regular, "foo.c", blob_id(2)),
            TreeEntry::new(Mode::Regular, "foo", blob_id(3)),
        ];
        let tree = Tree::new(entries).unwrap();
        let order: Vec<_> = tree
            .entries()
            .iter()
            .map(|e| (e.name.to_string(), e.mode))
            .collect();
        assert_eq!(
            order,
            vec![
                ("foo".to_string(), Mode::Regular),
                ("foo.c".to_string(), Mode::Regular),
                ("foo".to_string(), Mode::Tree),
            ]
        );
    }

    #[test]
    fn test_tree_id_independent_of_insertion_order() {
        let forward = vec![
            TreeEntry::new(Mode::Regular, "foo", blob_id(1)),
            TreeEntry::new(Mode::Regular, "foo.c", blob_id(2)),
            TreeEntry::new(Mode::Tree, "foo", blob_id(3)),
        ];
        let mut reversed = forward.clone();
        reversed.reverse();

        let a = Tree::new(forward).unwrap();
        let b = Tree::new(reversed).unwrap();
        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let entries = vec![
            TreeEntry::new(Mode::Regular, "file.txt", blob_id(1)),
            TreeEntry::new(Mode::Symlink, "link", blob_id(2)),
            TreeEntry::new(Mode::Tree, "sub", blob_id(3)),
            TreeEntry::new(Mode::Gitlink, "vendored", blob_id(4)),
        ];
        let tree = Tree::new(entries).unwrap();
        let payload = tree.encode();
        let parsed = Tree::decode(HashAlgo::Sha256, &payload).unwrap();
        assert_eq!(tree, parsed);
    }

    #[test]
    fn test_decode_rejects_out_of_order() {
        let sorted = Tree::new(vec![
            TreeEntry::new(Mode::Regular, "a", blob_id(1)),
            TreeEntry::new(Mode::Regular, "b", blob_id(2)),
        ])
        .unwrap();
        let payload = sorted.encode();

        // swap the two serialized entries
        let half = payload.len() / 2;
        let mut swapped = payload[half..].to_vec();
        swapped.extend_from_slice(&payload[..half]);

        assert!(matches!(
            Tree::decode(HashAlgo::Sha256, &swapped),
            Err(Error::TreeEntryConflict(_))
        ));
    }

    #[test]
    fn test_duplicate_entries_rejected() {
        let entries = vec![
            TreeEntry::new(Mode::Regular, "same", blob_id(1)),
            TreeEntry::new(Mode::Regular, "same", blob_id(2)),
        ];
        assert!(matches!(
            Tree::new(entries),
            Err(Error::TreeEntryConflict(_))
        ));
    }

    #[test]
    fn test_invalid_names_rejected() {
        for name in ["", "a/b", ".", ".."] {
            let entries = vec![TreeEntry::new(Mode::Regular, name, blob_id(1))];
            assert!(Tree::new(entries).is_err(), "{:?} accepted", name);
        }
        let entries = vec![TreeEntry::new(Mode::Regular, &b"a\0b"[..], blob_id(1))];
        assert!(Tree::new(entries).is_err());
    }

    #[test]
    fn test_get_distinguishes_file_and_subtree() {
        let tree = Tree::new(vec![
            TreeEntry::new(Mode::Regular, "foo", blob_id(1)),
            TreeEntry::new(Mode::Tree, "foo", blob_id(2)),
            TreeEntry::new(Mode::Regular, "foo.c", blob_id(3)),
        ])
        .unwrap();

        assert_eq!(tree.get(b"foo").unwrap().mode, Mode::Tree);
        assert_eq!(tree.get(b"foo.c").unwrap().mode, Mode::Regular);
        assert!(tree.get(b"bar").is_none());
    }

    #[test]
    fn test_iter_zero_copy() {
        let tree = Tree::new(vec![
            TreeEntry::new(Mode::Regular, "a", blob_id(1)),
            TreeEntry::new(Mode::Tree, "b", blob_id(2)),
        ])
        .unwrap();
        let payload = tree.encode();

        let entries: Vec<_> = TreeIter::new(HashAlgo::Sha256, &payload)
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(entries, tree.entries());
    }

    #[test]
    fn test_iter_stops_on_garbage() {
        let results: Vec<_> = TreeIter::new(HashAlgo::Sha256, b"garbage").collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }
}
