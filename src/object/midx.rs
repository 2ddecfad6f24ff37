//! multi-pack index: one sorted id -> (pack, offset) map aggregating
//! every pack in the store, consulted before the per-pack indexes

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashAlgo, Id};
use crate::object::store::Odb;

const MIDX_MAGIC: &[u8; 4] = b"MIDX";
const MIDX_VERSION: u32 = 1;

/// a parsed multi-pack index
#[derive(Debug)]
pub struct Midx {
    pack_names: Vec<String>,
    /// (id, pack slot, offset), sorted by id
    entries: Vec<(Id, u32, u64)>,
}

impl Midx {
    pub fn file_path(pack_dir: &Path) -> PathBuf {
        pack_dir.join("multi-pack-index")
    }

    pub fn open(path: &Path, algo: HashAlgo) -> Result<Self> {
        let data = std::fs::read(path).with_path(path)?;
        Self::parse(&data, algo)
    }

    pub fn parse(data: &[u8], algo: HashAlgo) -> Result<Self> {
        let hsz = algo.raw_len();
        if data.len() < 12 + hsz || &data[..4] != MIDX_MAGIC {
            return Err(midx_error(algo, "bad magic"));
        }
        let mut cursor = 4usize;
        if read_u32(algo, data, &mut cursor)? != MIDX_VERSION {
            return Err(midx_error(algo, "unsupported version"));
        }

        let trailer_start = data.len() - hsz;
        if algo.digest(&data[..trailer_start]).as_bytes() != &data[trailer_start..] {
            return Err(midx_error(algo, "trailer digest mismatch"));
        }

        let pack_count = read_u32(algo, data, &mut cursor)? as usize;
        let mut pack_names = Vec::with_capacity(pack_count);
        for _ in 0..pack_count {
            let len = read_u32(algo, data, &mut cursor)? as usize;
            let end = cursor + len;
            if end > trailer_start {
                return Err(midx_error(algo, "truncated pack name"));
            }
            let name = std::str::from_utf8(&data[cursor..end])
                .map_err(|_| midx_error(algo, "pack name is not utf-8"))?;
            pack_names.push(name.to_string());
            cursor = end;
        }

        let object_count = read_u32(algo, data, &mut cursor)? as usize;
        let mut entries = Vec::with_capacity(object_count);
        for _ in 0..object_count {
            let end = cursor + hsz;
            if end > trailer_start {
                return Err(midx_error(algo, "truncated entry"));
            }
            let id = Id::from_bytes(algo, &data[cursor..end]).expect("width checked");
            cursor = end;
            let pack = read_u32(algo, data, &mut cursor)?;
            if pack as usize >= pack_count {
                return Err(midx_error(algo, "pack slot out of range"));
            }
            let offset = read_u64(algo, data, &mut cursor)?;
            entries.push((id, pack, offset));
        }
        for window in entries.windows(2) {
            if window[0].0 >= window[1].0 {
                return Err(midx_error(algo, "ids not sorted"));
            }
        }

        Ok(Self {
            pack_names,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// resolve an id to (pack file name, offset)
    pub fn lookup(&self, id: &Id) -> Option<(&str, u64)> {
        let pos = self.entries.binary_search_by_key(id, |e| e.0).ok()?;
        let (_, pack, offset) = self.entries[pos];
        Some((self.pack_names[pack as usize].as_str(), offset))
    }

    pub fn prefix_candidates(&self, prefix: &str) -> Vec<Id> {
        self.entries
            .iter()
            .map(|&(id, _, _)| id)
            .filter(|id| id.matches_prefix(prefix))
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = Id> + '_ {
        self.entries.iter().map(|&(id, _, _)| id)
    }
}

/// aggregate every prepared pack's index into a multi-pack index file
pub fn write_midx(odb: &Odb) -> Result<PathBuf> {
    let algo = odb.algo();
    let mut pack_names = Vec::new();
    let mut entries: Vec<(Id, u32, u64)> = Vec::new();

    odb.with_packs(|packs| {
        for (slot, pack) in packs.iter().enumerate() {
            let name = pack
                .path()
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();
            pack_names.push(name);
            for &id in pack.idx().ids() {
                let offset = pack.idx().offset_of(&id).expect("listed id");
                entries.push((id, slot as u32, offset));
            }
        }
    })?;

    entries.sort_by_key(|e| e.0);
    // an id packed twice keeps its first (oldest pack) copy
    entries.dedup_by_key(|e| e.0);

    let mut out = Vec::new();
    out.extend_from_slice(MIDX_MAGIC);
    out.extend_from_slice(&MIDX_VERSION.to_be_bytes());
    out.extend_from_slice(&(pack_names.len() as u32).to_be_bytes());
    for name in &pack_names {
        out.extend_from_slice(&(name.len() as u32).to_be_bytes());
        out.extend_from_slice(name.as_bytes());
    }
    out.extend_from_slice(&(entries.len() as u32).to_be_bytes());
    for (id, pack, offset) in &entries {
        out.extend_from_slice(id.as_bytes());
        out.extend_from_slice(&pack.to_be_bytes());
        out.extend_from_slice(&offset.to_be_bytes());
    }
    out.extend_from_slice(algo.digest(&out).as_bytes());

    let path = Midx::file_path(&odb.pack_dir());
    let tmp = odb.tmp_dir().join(uuid::Uuid::new_v4().to_string());
    {
        let mut file = File::create(&tmp).with_path(&tmp)?;
        file.write_all(&out).with_path(&tmp)?;
        file.sync_all().with_path(&tmp)?;
    }
    std::fs::rename(&tmp, &path).with_path(&path)?;
    Ok(path)
}

fn read_u32(algo: HashAlgo, data: &[u8], cursor: &mut usize) -> Result<u32> {
    let end = *cursor + 4;
    if end > data.len() {
        return Err(midx_error(algo, "truncated"));
    }
    let value = u32::from_be_bytes(data[*cursor..end].try_into().unwrap());
    *cursor = end;
    Ok(value)
}

fn read_u64(algo: HashAlgo, data: &[u8], cursor: &mut usize) -> Result<u64> {
    let end = *cursor + 8;
    if end > data.len() {
        return Err(midx_error(algo, "truncated"));
    }
    let value = u64::from_be_bytes(data[*cursor..end].try_into().unwrap());
    *cursor = end;
    Ok(value)
}

fn midx_error(algo: HashAlgo, reason: &str) -> Error {
    Error::ObjectCorrupt {
        id: algo.zero(),
        reason: format!("multi-pack index: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Kind;
    use tempfile::tempdir;

    fn test_odb(use_midx: bool, dir: &Path) -> Odb {
        let objects = dir.join("objects");
        let tmp = dir.join("tmp");
        std::fs::create_dir_all(objects.join("pack")).unwrap();
        std::fs::create_dir_all(&tmp).unwrap();
        Odb::new(HashAlgo::Sha256, objects, tmp, use_midx, None)
    }

    #[test]
    fn test_write_and_lookup() {
        let dir = tempdir().unwrap();
        let odb = test_odb(false, dir.path());

        // two packs from two bulk sessions
        odb.plug();
        let a = odb.write(Kind::Blob, b"first pack").unwrap();
        odb.unplug().unwrap();
        odb.plug();
        let b = odb.write(Kind::Blob, b"second pack").unwrap();
        odb.unplug().unwrap();

        let path = write_midx(&odb).unwrap();
        let midx = Midx::open(&path, HashAlgo::Sha256).unwrap();
        assert_eq!(midx.len(), 2);
        assert!(midx.lookup(&a).is_some());
        assert!(midx.lookup(&b).is_some());
        assert!(midx.lookup(&HashAlgo::Sha256.digest(b"ghost")).is_none());

        let (pack_name, _offset) = midx.lookup(&a).unwrap();
        assert!(pack_name.starts_with("pack-") && pack_name.ends_with(".pack"));
    }

    #[test]
    fn test_store_reads_through_midx() {
        let dir = tempdir().unwrap();
        {
            let odb = test_odb(false, dir.path());
            odb.plug();
            odb.write(Kind::Blob, b"packed payload").unwrap();
            odb.unplug().unwrap();
            write_midx(&odb).unwrap();
        }
        let odb = test_odb(true, dir.path());
        let id = crate::object::hash_record(HashAlgo::Sha256, Kind::Blob, b"packed payload");
        assert!(odb.has(&id));
        assert_eq!(odb.read(&id).unwrap().bytes, b"packed payload");
    }

    #[test]
    fn test_corrupt_trailer_rejected() {
        let dir = tempdir().unwrap();
        let odb = test_odb(false, dir.path());
        odb.plug();
        odb.write(Kind::Blob, b"x").unwrap();
        odb.unplug().unwrap();

        let path = write_midx(&odb).unwrap();
        let mut data = std::fs::read(&path).unwrap();
        let len = data.len();
        data[len - 1] ^= 0xff;
        assert!(matches!(
            Midx::parse(&data, HashAlgo::Sha256),
            Err(Error::ObjectCorrupt { .. })
        ));
    }
}
