//! split index: the index file carries a pointer to a shared base
//! index plus a deletions bitmap and an overlay of changed entries

use std::collections::HashSet;

use bstr::{BString, ByteSlice};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashAlgo, Id};
use crate::index::entry::{flags, IndexEntry};
use crate::index::format::{self, RawIndex};
use crate::repo::Repo;

/// parsed "link" extension payload
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkData {
    pub base_id: Id,
    /// one bit per base entry, set when the entry was deleted
    pub deleted: Vec<u8>,
}

impl LinkData {
    pub fn is_deleted(&self, pos: usize) -> bool {
        self.deleted
            .get(pos / 8)
            .is_some_and(|byte| byte & (1 << (pos % 8)) != 0)
    }
}

/// payload: base id raw, u32 base entry count, deletion bitmap
pub fn write_link(base_id: &Id, base_count: usize, deleted: &[bool]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(base_id.as_bytes());
    out.extend_from_slice(&(base_count as u32).to_be_bytes());
    let mut bitmap = vec![0u8; base_count.div_ceil(8)];
    for (pos, &dead) in deleted.iter().enumerate() {
        if dead {
            bitmap[pos / 8] |= 1 << (pos % 8);
        }
    }
    out.extend_from_slice(&bitmap);
    out
}

pub fn parse_link(payload: &[u8], algo: HashAlgo) -> Result<LinkData> {
    let hsz = algo.raw_len();
    if payload.len() < hsz + 4 {
        return Err(Error::IndexCorrupt("truncated link extension".to_string()));
    }
    let base_id = Id::from_bytes(algo, &payload[..hsz]).expect("width checked");
    let count = u32::from_be_bytes(payload[hsz..hsz + 4].try_into().unwrap()) as usize;
    let bitmap = &payload[hsz + 4..];
    if bitmap.len() != count.div_ceil(8) {
        return Err(Error::IndexCorrupt("link bitmap size mismatch".to_string()));
    }
    Ok(LinkData {
        base_id,
        deleted: bitmap.to_vec(),
    })
}

/// path of the shared base index for a given id
pub fn shared_index_path(repo: &Repo, base_id: &Id) -> std::path::PathBuf {
    repo.path().join(format!("sharedindex.{}", base_id.to_hex()))
}

/// merge a split index into a full entry list: base entries minus the
/// deletions, overlaid with the outer file's entries by (path, stage)
pub fn materialize(mut raw: RawIndex, repo: &Repo) -> Result<RawIndex> {
    let Some(link_payload) = raw.link.take() else {
        return Ok(raw);
    };
    let link = parse_link(&link_payload, repo.algo())?;

    let base_path = shared_index_path(repo, &link.base_id);
    let base_bytes = std::fs::read(&base_path).with_path(&base_path)?;
    let base = format::parse(&base_bytes, repo.algo())?;

    let mut merged: Vec<IndexEntry> = Vec::with_capacity(base.entries.len() + raw.entries.len());
    for (pos, mut entry) in base.entries.into_iter().enumerate() {
        if link.is_deleted(pos) {
            continue;
        }
        entry.flags &= !flags::UPDATE_IN_BASE;
        merged.push(entry);
    }
    for mut entry in raw.entries {
        entry.flags |= flags::UPDATE_IN_BASE;
        match merged.binary_search_by(|e| e.cmp_key(entry.path.as_bstr(), entry.stage)) {
            Ok(pos) => merged[pos] = entry,
            Err(pos) => merged.insert(pos, entry),
        }
    }

    raw.entries = merged;
    Ok(raw)
}

/// result of splitting a full entry list against a base for writing
pub struct SplitPlan {
    /// entries that go into the outer index file
    pub overlay: Vec<IndexEntry>,
    /// "link" extension payload
    pub link: Vec<u8>,
}

/// write (or reuse) the shared base and plan the outer file contents
///
/// when no base exists yet, the whole index becomes the new shared
/// base and the outer file carries only the link
pub fn plan_write(repo: &Repo, entries: &[IndexEntry], version: u32) -> Result<SplitPlan> {
    // find a reusable base: the newest sharedindex file
    let existing = newest_shared_base(repo)?;

    if let Some((base_id, base_entries)) = existing {
        let current: HashSet<(BString, u8)> = entries
            .iter()
            .map(|e| (e.path.clone(), e.stage))
            .collect();
        let deleted: Vec<bool> = base_entries
            .iter()
            .map(|e| !current.contains(&(e.path.clone(), e.stage)))
            .collect();

        // an entry whose update-in-base flag is clear resides in the base
        let overlay: Vec<IndexEntry> = entries
            .iter()
            .filter(|e| {
                base_entries
                    .binary_search_by(|b| b.cmp_key(e.path.as_bstr(), e.stage))
                    .map(|pos| {
                        let b = &base_entries[pos];
                        b.id != e.id
                            || b.mode != e.mode
                            || b.stat != e.stat
                            || (b.flags ^ e.flags) & flags::ON_DISK != 0
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        return Ok(SplitPlan {
            overlay,
            link: write_link(&base_id, base_entries.len(), &deleted),
        });
    }

    // no base yet: persist the current entries as the shared base
    let base_raw = RawIndex {
        version,
        entries: entries.to_vec(),
        ..Default::default()
    };
    let (bytes, base_id) = format::serialize(&base_raw, repo.algo(), false);
    let base_path = shared_index_path(repo, &base_id);
    std::fs::write(&base_path, &bytes).with_path(&base_path)?;

    Ok(SplitPlan {
        overlay: Vec::new(),
        link: write_link(&base_id, entries.len(), &vec![false; entries.len()]),
    })
}

fn newest_shared_base(repo: &Repo) -> Result<Option<(Id, Vec<IndexEntry>)>> {
    let mut best: Option<(std::time::SystemTime, Id)> = None;
    let dir = repo.path();
    for entry in std::fs::read_dir(dir).with_path(dir)? {
        let entry = entry.with_path(dir)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(hex) = name.strip_prefix("sharedindex.") else {
            continue;
        };
        let Ok(id) = Id::from_hex(hex) else { continue };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
        if best.as_ref().is_none_or(|(t, _)| modified > *t) {
            best = Some((modified, id));
        }
    }
    let Some((_, base_id)) = best else {
        return Ok(None);
    };
    let path = shared_index_path(repo, &base_id);
    let bytes = std::fs::read(&path).with_path(&path)?;
    let raw = format::parse(&bytes, repo.algo())?;
    Ok(Some((base_id, raw.entries)))
}
