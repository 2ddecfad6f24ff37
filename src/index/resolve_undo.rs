//! resolve-undo: when conflict stages are resolved to stage 0, the
//! stage {1,2,3} records are remembered so the conflict can be
//! recreated later

use bstr::{BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::{HashAlgo, Id};
use crate::index::entry::IndexEntry;
use crate::types::Mode;

/// the stage {1,2,3} snapshot for one resolved path; a missing stage
/// has mode zero
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolveUndo {
    pub path: BString,
    pub modes: [u32; 3],
    pub ids: [Option<Id>; 3],
}

impl ResolveUndo {
    /// capture the conflict stages being discarded for a path
    pub fn capture(path: &BString, stages: &[&IndexEntry]) -> Self {
        let mut record = Self {
            path: path.clone(),
            modes: [0; 3],
            ids: [None; 3],
        };
        for entry in stages {
            if (1..=3).contains(&entry.stage) {
                let slot = entry.stage as usize - 1;
                record.modes[slot] = entry.mode.as_u32();
                record.ids[slot] = Some(entry.id);
            }
        }
        record
    }

    /// rebuild the unmerged entries this record captured
    pub fn to_entries(&self) -> Result<Vec<IndexEntry>> {
        let mut entries = Vec::new();
        for slot in 0..3 {
            if self.modes[slot] == 0 {
                continue;
            }
            let mode = Mode::from_u32(self.modes[slot])?;
            let id = self.ids[slot]
                .ok_or_else(|| Error::IndexCorrupt("resolve-undo without id".to_string()))?;
            entries.push(IndexEntry::new(
                mode,
                id,
                self.path.clone(),
                slot as u8 + 1,
            ));
        }
        Ok(entries)
    }
}

/// serialize the "REUC" extension payload
pub fn write_ext(records: &[ResolveUndo], out: &mut Vec<u8>) {
    for record in records {
        out.extend_from_slice(&record.path);
        out.push(0);
        for mode in record.modes {
            out.extend_from_slice(format!("{:o}", mode).as_bytes());
            out.push(0);
        }
        for slot in 0..3 {
            if record.modes[slot] != 0 {
                if let Some(id) = record.ids[slot] {
                    out.extend_from_slice(id.as_bytes());
                }
            }
        }
    }
}

/// parse the "REUC" extension payload
pub fn parse_ext(payload: &[u8], algo: HashAlgo) -> Result<Vec<ResolveUndo>> {
    let hsz = algo.raw_len();
    let mut records = Vec::new();
    let mut cursor = 0usize;

    while cursor < payload.len() {
        let rest = &payload[cursor..];
        let nul = rest
            .find_byte(0)
            .ok_or_else(|| Error::IndexCorrupt("resolve-undo: unterminated path".to_string()))?;
        let path = BString::from(&rest[..nul]);
        cursor += nul + 1;

        let mut modes = [0u32; 3];
        for slot in modes.iter_mut() {
            let rest = &payload[cursor..];
            let nul = rest.find_byte(0).ok_or_else(|| {
                Error::IndexCorrupt("resolve-undo: unterminated mode".to_string())
            })?;
            let text = std::str::from_utf8(&rest[..nul])
                .map_err(|_| Error::IndexCorrupt("resolve-undo: bad mode".to_string()))?;
            *slot = u32::from_str_radix(text, 8)
                .map_err(|_| Error::IndexCorrupt("resolve-undo: bad mode".to_string()))?;
            cursor += nul + 1;
        }

        let mut ids = [None; 3];
        for slot in 0..3 {
            if modes[slot] == 0 {
                continue;
            }
            let raw = payload
                .get(cursor..cursor + hsz)
                .ok_or_else(|| Error::IndexCorrupt("resolve-undo: truncated id".to_string()))?;
            ids[slot] = Some(Id::from_bytes(algo, raw).expect("width checked"));
            cursor += hsz;
        }

        records.push(ResolveUndo { path, modes, ids });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_id(n: u8) -> Id {
        Id::from_bytes(HashAlgo::Sha256, &[n; 32]).unwrap()
    }

    #[test]
    fn test_capture_and_restore() {
        let base = IndexEntry::new(Mode::Regular, some_id(1), "f.txt", 1);
        let ours = IndexEntry::new(Mode::Regular, some_id(2), "f.txt", 2);
        let theirs = IndexEntry::new(Mode::Executable, some_id(3), "f.txt", 3);

        let record = ResolveUndo::capture(&BString::from("f.txt"), &[&base, &ours, &theirs]);
        assert_eq!(record.modes[0], 0o100644);
        assert_eq!(record.modes[2], 0o100755);

        let restored = record.to_entries().unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored[0], base);
        assert_eq!(restored[1], ours);
        assert_eq!(restored[2], theirs);
    }

    #[test]
    fn test_two_sided_conflict() {
        // delete/modify: no base stage
        let ours = IndexEntry::new(Mode::Regular, some_id(2), "f", 2);
        let record = ResolveUndo::capture(&BString::from("f"), &[&ours]);
        assert_eq!(record.modes, [0, 0o100644, 0]);
        assert_eq!(record.to_entries().unwrap().len(), 1);
    }

    #[test]
    fn test_ext_roundtrip() {
        let a = ResolveUndo {
            path: BString::from("dir/conflict"),
            modes: [0o100644, 0o100644, 0],
            ids: [Some(some_id(1)), Some(some_id(2)), None],
        };
        let b = ResolveUndo {
            path: BString::from("other"),
            modes: [0, 0o100755, 0o120000],
            ids: [None, Some(some_id(4)), Some(some_id(5))],
        };

        let mut payload = Vec::new();
        write_ext(&[a.clone(), b.clone()], &mut payload);
        let parsed = parse_ext(&payload, HashAlgo::Sha256).unwrap();
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn test_parse_rejects_truncation() {
        let record = ResolveUndo {
            path: BString::from("f"),
            modes: [0o100644, 0, 0],
            ids: [Some(some_id(1)), None, None],
        };
        let mut payload = Vec::new();
        write_ext(&[record], &mut payload);
        payload.truncate(payload.len() - 4);
        assert!(parse_ext(&payload, HashAlgo::Sha256).is_err());
    }
}
