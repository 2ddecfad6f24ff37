//! pack index: sorted id -> pack offset map with a 256-way fanout,
//! CRC32s, and a two-level offset encoding for offsets >= 2^31

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashAlgo, Id};

const IDX_MAGIC: [u8; 4] = [0xff, 0x74, 0x4f, 0x63];
const IDX_VERSION: u32 = 2;
const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;

/// one record scheduled for the index of a pack being written
#[derive(Clone, Debug)]
pub struct IdxEntry {
    pub id: Id,
    pub crc32: u32,
    pub offset: u64,
}

/// a parsed pack index file
#[derive(Debug)]
pub struct PackIdx {
    ids: Vec<Id>,
    crcs: Vec<u32>,
    offsets: Vec<u64>,
    pack_digest: Id,
}

impl PackIdx {
    pub fn open(path: &Path, algo: HashAlgo) -> Result<Self> {
        let data = std::fs::read(path).with_path(path)?;
        Self::parse(&data, algo)
    }

    pub fn parse(data: &[u8], algo: HashAlgo) -> Result<Self> {
        let hsz = algo.raw_len();
        let mut cursor = 0usize;

        if take(algo, data, &mut cursor, 4)? != IDX_MAGIC {
            return Err(idx_error(algo, "bad magic"));
        }
        if read_u32(algo, data, &mut cursor)? != IDX_VERSION {
            return Err(idx_error(algo, "unsupported version"));
        }

        let mut fanout = [0u32; 256];
        for slot in fanout.iter_mut() {
            *slot = read_u32(algo, data, &mut cursor)?;
        }
        for window in fanout.windows(2) {
            if window[0] > window[1] {
                return Err(idx_error(algo, "fanout not monotonic"));
            }
        }
        let count = fanout[255] as usize;

        let mut ids = Vec::with_capacity(count);
        for _ in 0..count {
            let raw = take(algo, data, &mut cursor, hsz)?;
            ids.push(Id::from_bytes(algo, raw).expect("width checked"));
        }
        for window in ids.windows(2) {
            if window[0] >= window[1] {
                return Err(idx_error(algo, "ids not sorted"));
            }
        }

        let mut crcs = Vec::with_capacity(count);
        for _ in 0..count {
            crcs.push(read_u32(algo, data, &mut cursor)?);
        }

        let mut small_offsets = Vec::with_capacity(count);
        for _ in 0..count {
            small_offsets.push(read_u32(algo, data, &mut cursor)?);
        }
        let large_count = small_offsets
            .iter()
            .filter(|&&o| o & LARGE_OFFSET_FLAG != 0)
            .count();
        let mut large_offsets = Vec::with_capacity(large_count);
        for _ in 0..large_count {
            large_offsets.push(read_u64(algo, data, &mut cursor)?);
        }
        let mut offsets = Vec::with_capacity(count);
        for &small in &small_offsets {
            if small & LARGE_OFFSET_FLAG != 0 {
                let slot = (small & !LARGE_OFFSET_FLAG) as usize;
                let large = *large_offsets
                    .get(slot)
                    .ok_or_else(|| idx_error(algo, "large offset out of table"))?;
                offsets.push(large);
            } else {
                offsets.push(small as u64);
            }
        }

        let pack_digest_raw = take(algo, data, &mut cursor, hsz)?;
        let pack_digest = Id::from_bytes(algo, pack_digest_raw).expect("width checked");

        // the trailing digest covers everything before it
        let self_digest_raw = take(algo, data, &mut cursor, hsz)?;
        let expected = algo.digest(&data[..data.len() - hsz]);
        if self_digest_raw != expected.as_bytes() {
            return Err(idx_error(algo, "trailer digest mismatch"));
        }
        if cursor != data.len() {
            return Err(idx_error(algo, "trailing garbage"));
        }

        Ok(Self {
            ids,
            crcs,
            offsets,
            pack_digest,
        })
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn pack_digest(&self) -> Id {
        self.pack_digest
    }

    /// O(log N) position lookup
    pub fn position(&self, id: &Id) -> Option<usize> {
        self.ids.binary_search(id).ok()
    }

    pub fn offset_of(&self, id: &Id) -> Option<u64> {
        self.position(id).map(|i| self.offsets[i])
    }

    pub fn crc_of(&self, id: &Id) -> Option<u32> {
        self.position(id).map(|i| self.crcs[i])
    }

    pub fn ids(&self) -> &[Id] {
        &self.ids
    }

    /// ids whose hex form starts with the given prefix
    pub fn prefix_candidates(&self, prefix: &str) -> Vec<Id> {
        // narrow by the even-length byte prefix, then filter by hex
        let even = &prefix[..prefix.len() & !1];
        let bytes = hex::decode(even).unwrap_or_default();
        let start = self
            .ids
            .partition_point(|id| id.as_bytes()[..bytes.len()] < bytes[..]);
        self.ids[start..]
            .iter()
            .take_while(|id| id.as_bytes()[..bytes.len()] == bytes[..])
            .filter(|id| id.matches_prefix(prefix))
            .copied()
            .collect()
    }

    /// (offset, id) pairs sorted by offset, for sequential pack traversal
    pub fn reverse_index(&self) -> Vec<(u64, Id)> {
        let mut rev: Vec<_> = self
            .offsets
            .iter()
            .zip(&self.ids)
            .map(|(&o, &id)| (o, id))
            .collect();
        rev.sort_by_key(|&(o, _)| o);
        rev
    }

    /// serialize an index for the given records and write it to `path`
    pub fn write(
        path: &Path,
        algo: HashAlgo,
        entries: &mut Vec<IdxEntry>,
        pack_digest: &Id,
    ) -> Result<()> {
        entries.sort_by_key(|e| e.id);

        let mut out = Vec::new();
        out.extend_from_slice(&IDX_MAGIC);
        out.extend_from_slice(&IDX_VERSION.to_be_bytes());

        let mut fanout = [0u32; 256];
        for entry in entries.iter() {
            fanout[entry.id.as_bytes()[0] as usize] += 1;
        }
        let mut running = 0u32;
        for slot in fanout.iter_mut() {
            running += *slot;
            *slot = running;
        }
        for slot in fanout {
            out.extend_from_slice(&slot.to_be_bytes());
        }

        for entry in entries.iter() {
            out.extend_from_slice(entry.id.as_bytes());
        }
        for entry in entries.iter() {
            out.extend_from_slice(&entry.crc32.to_be_bytes());
        }

        let mut large = Vec::new();
        for entry in entries.iter() {
            if entry.offset < LARGE_OFFSET_FLAG as u64 {
                out.extend_from_slice(&(entry.offset as u32).to_be_bytes());
            } else {
                let slot = LARGE_OFFSET_FLAG | large.len() as u32;
                out.extend_from_slice(&slot.to_be_bytes());
                large.push(entry.offset);
            }
        }
        for offset in large {
            out.extend_from_slice(&offset.to_be_bytes());
        }

        out.extend_from_slice(pack_digest.as_bytes());
        let self_digest = algo.digest(&out);
        out.extend_from_slice(self_digest.as_bytes());

        let mut file = File::create(path).with_path(path)?;
        file.write_all(&out).with_path(path)?;
        file.sync_all().with_path(path)?;
        Ok(())
    }
}

fn take<'a>(algo: HashAlgo, data: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|&e| e <= data.len())
        .ok_or_else(|| idx_error(algo, "truncated"))?;
    let slice = &data[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn read_u32(algo: HashAlgo, data: &[u8], cursor: &mut usize) -> Result<u32> {
    let raw = take(algo, data, cursor, 4)?;
    Ok(u32::from_be_bytes(raw.try_into().unwrap()))
}

fn read_u64(algo: HashAlgo, data: &[u8], cursor: &mut usize) -> Result<u64> {
    let raw = take(algo, data, cursor, 8)?;
    Ok(u64::from_be_bytes(raw.try_into().unwrap()))
}

fn idx_error(algo: HashAlgo, reason: &str) -> Error {
    Error::ObjectCorrupt {
        id: algo.zero(),
        reason: format!("pack index: {}", reason),
    }
}
