//! pack backend: many records in one read-only file, raw or
//! delta-encoded, addressed through a sibling index

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::bufread::ZlibDecoder;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashAlgo, Id};
use crate::object::delta::{apply_delta, read_varint};
use crate::object::idx::PackIdx;
use crate::object::store::DeltaCache;
use crate::object::{hash_record, ObjectData, ObjectInfo};
use crate::types::Kind;

pub const PACK_MAGIC: &[u8; 4] = b"PACK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_LEN: u64 = 12;

/// delta chains deeper than this are treated as corruption
pub const MAX_DELTA_DEPTH: u32 = 64;

const KIND_COMMIT: u8 = 1;
const KIND_TREE: u8 = 2;
const KIND_BLOB: u8 = 3;
const KIND_TAG: u8 = 4;
const KIND_OFS_DELTA: u8 = 6;
const KIND_REF_DELTA: u8 = 7;

pub fn kind_code(kind: Kind) -> u8 {
    match kind {
        Kind::Commit => KIND_COMMIT,
        Kind::Tree => KIND_TREE,
        Kind::Blob => KIND_BLOB,
        Kind::Tag => KIND_TAG,
    }
}

/// variable-length in-pack entry header: 3 bits of kind, then the
/// uncompressed size 4 low bits first, 7 bits per continuation byte
pub fn encode_entry_header(code: u8, mut size: u64) -> Vec<u8> {
    let mut byte = ((code & 0x7) << 4) | (size & 0x0f) as u8;
    size >>= 4;
    let mut out = Vec::with_capacity(10);
    while size > 0 {
        out.push(byte | 0x80);
        byte = (size & 0x7f) as u8;
        size >>= 7;
    }
    out.push(byte);
    out
}

/// a pack file loaded with its index
pub struct Pack {
    path: PathBuf,
    data: Vec<u8>,
    idx: PackIdx,
    algo: HashAlgo,
}

impl Pack {
    /// open `<stem>.pack` together with its sibling `<stem>.idx`
    pub fn open(pack_path: &Path, algo: HashAlgo) -> Result<Self> {
        let data = std::fs::read(pack_path).with_path(pack_path)?;
        if data.len() < PACK_HEADER_LEN as usize + algo.raw_len() {
            return Err(pack_error(pack_path, algo, "too short"));
        }
        if &data[..4] != PACK_MAGIC {
            return Err(pack_error(pack_path, algo, "bad magic"));
        }
        let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
        if version != 2 && version != 3 {
            return Err(pack_error(pack_path, algo, "unsupported version"));
        }
        let nr_objects = u32::from_be_bytes(data[8..12].try_into().unwrap());

        let idx_path = pack_path.with_extension("idx");
        let idx = PackIdx::open(&idx_path, algo)?;
        if idx.len() as u32 != nr_objects {
            return Err(pack_error(pack_path, algo, "index entry count mismatch"));
        }

        Ok(Self {
            path: pack_path.to_path_buf(),
            data,
            idx,
            algo,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn idx(&self) -> &PackIdx {
        &self.idx
    }

    pub fn digest(&self) -> Id {
        self.idx.pack_digest()
    }

    pub fn has(&self, id: &Id) -> bool {
        self.idx.position(id).is_some()
    }

    /// materialize a record by id, reconstructing deltas as needed
    pub fn read(&self, id: &Id, cache: &mut DeltaCache) -> Result<ObjectData> {
        let offset = self
            .idx
            .offset_of(id)
            .ok_or(Error::ObjectMissing(*id))?;
        self.read_at(offset, cache, 0)
    }

    /// materialize the record stored at a known pack offset
    pub fn read_at_offset(&self, offset: u64, cache: &mut DeltaCache) -> Result<ObjectData> {
        self.read_at(offset, cache, 0)
    }

    /// kind and size by id, without materializing the payload
    pub fn info(&self, id: &Id, cache: &mut DeltaCache) -> Result<ObjectInfo> {
        let offset = self
            .idx
            .offset_of(id)
            .ok_or(Error::ObjectMissing(*id))?;
        self.info_at(offset, cache, 0)
    }

    fn entry_header(&self, offset: u64) -> Result<(u8, u64, usize)> {
        let mut cursor = offset as usize;
        let mut byte = self.byte_at(cursor)?;
        cursor += 1;
        let code = (byte >> 4) & 0x7;
        let mut size = (byte & 0x0f) as u64;
        let mut shift = 4u32;
        while byte & 0x80 != 0 {
            byte = self.byte_at(cursor)?;
            cursor += 1;
            size |= ((byte & 0x7f) as u64) << shift;
            shift += 7;
            if shift > 63 {
                return Err(pack_error(&self.path, self.algo, "entry size varint too wide"));
            }
        }
        Ok((code, size, cursor))
    }

    fn read_at(&self, offset: u64, cache: &mut DeltaCache, depth: u32) -> Result<ObjectData> {
        if depth > MAX_DELTA_DEPTH {
            return Err(pack_error(&self.path, self.algo, "delta chain too deep"));
        }
        if let Some(hit) = cache.get(&self.digest(), offset) {
            return Ok(hit);
        }
        let (code, size, cursor) = self.entry_header(offset)?;
        let data = match code {
            KIND_COMMIT | KIND_TREE | KIND_BLOB | KIND_TAG => {
                let bytes = self.inflate(cursor, size as usize)?;
                ObjectData {
                    kind: decode_kind(code).expect("raw kind"),
                    bytes,
                }
            }
            KIND_OFS_DELTA => {
                let (base_offset, cursor) = self.read_base_offset(offset, cursor)?;
                let base = self.read_at(base_offset, cache, depth + 1)?;
                let delta = self.inflate(cursor, size as usize)?;
                ObjectData {
                    kind: base.kind,
                    bytes: apply_delta(self.algo, &base.bytes, &delta)?,
                }
            }
            KIND_REF_DELTA => {
                let (base_id, cursor) = self.read_base_id(cursor)?;
                // the base of a ref delta lives in this same pack
                let base_offset = self
                    .idx
                    .offset_of(&base_id)
                    .ok_or(Error::ObjectMissing(base_id))?;
                let base = self.read_at(base_offset, cache, depth + 1)?;
                let delta = self.inflate(cursor, size as usize)?;
                ObjectData {
                    kind: base.kind,
                    bytes: apply_delta(self.algo, &base.bytes, &delta)?,
                }
            }
            other => {
                return Err(pack_error(
                    &self.path,
                    self.algo,
                    &format!("unknown entry kind {}", other),
                ))
            }
        };
        cache.put(self.digest(), offset, &data);
        Ok(data)
    }

    fn info_at(&self, offset: u64, cache: &mut DeltaCache, depth: u32) -> Result<ObjectInfo> {
        if depth > MAX_DELTA_DEPTH {
            return Err(pack_error(&self.path, self.algo, "delta chain too deep"));
        }
        let (code, size, cursor) = self.entry_header(offset)?;
        match code {
            KIND_COMMIT | KIND_TREE | KIND_BLOB | KIND_TAG => Ok(ObjectInfo {
                kind: decode_kind(code).expect("raw kind"),
                size,
            }),
            KIND_OFS_DELTA | KIND_REF_DELTA => {
                let (base_kind, cursor) = match code {
                    KIND_OFS_DELTA => {
                        let (base_offset, cursor) = self.read_base_offset(offset, cursor)?;
                        (self.info_at(base_offset, cache, depth + 1)?.kind, cursor)
                    }
                    _ => {
                        let (base_id, cursor) = self.read_base_id(cursor)?;
                        let base_offset = self
                            .idx
                            .offset_of(&base_id)
                            .ok_or(Error::ObjectMissing(base_id))?;
                        (self.info_at(base_offset, cache, depth + 1)?.kind, cursor)
                    }
                };
                // the delta header carries the reconstructed size
                let head = self.inflate(cursor, 32.min(size as usize))?;
                let mut p = 0usize;
                let _base_size = read_varint(self.algo, &head, &mut p)?;
                let result_size = read_varint(self.algo, &head, &mut p)?;
                Ok(ObjectInfo {
                    kind: base_kind,
                    size: result_size,
                })
            }
            other => Err(pack_error(
                &self.path,
                self.algo,
                &format!("unknown entry kind {}", other),
            )),
        }
    }

    /// negative base offset of an OFS delta, relative to `offset`
    fn read_base_offset(&self, offset: u64, mut cursor: usize) -> Result<(u64, usize)> {
        let mut byte = self.byte_at(cursor)?;
        cursor += 1;
        let mut distance = (byte & 0x7f) as u64;
        while byte & 0x80 != 0 {
            byte = self.byte_at(cursor)?;
            cursor += 1;
            distance = ((distance + 1) << 7) | (byte & 0x7f) as u64;
        }
        let base = offset
            .checked_sub(distance)
            .filter(|&b| b >= PACK_HEADER_LEN)
            .ok_or_else(|| pack_error(&self.path, self.algo, "delta base offset out of pack"))?;
        Ok((base, cursor))
    }

    fn read_base_id(&self, cursor: usize) -> Result<(Id, usize)> {
        let hsz = self.algo.raw_len();
        let end = cursor + hsz;
        if end > self.data.len() {
            return Err(pack_error(&self.path, self.algo, "truncated ref delta base"));
        }
        let id = Id::from_bytes(self.algo, &self.data[cursor..end]).expect("width checked");
        Ok((id, end))
    }

    fn inflate(&self, cursor: usize, size: usize) -> Result<Vec<u8>> {
        if cursor > self.data.len() {
            return Err(pack_error(&self.path, self.algo, "offset out of pack"));
        }
        let mut decoder = ZlibDecoder::new(&self.data[cursor..]);
        let mut out = vec![0u8; size];
        decoder
            .read_exact(&mut out)
            .map_err(|e| pack_error(&self.path, self.algo, &format!("zlib stream: {}", e)))?;
        Ok(out)
    }

    fn byte_at(&self, cursor: usize) -> Result<u8> {
        self.data
            .get(cursor)
            .copied()
            .ok_or_else(|| pack_error(&self.path, self.algo, "truncated entry"))
    }

    /// re-hash every record and the pack trailer; used by integrity checks
    pub fn verify(&self) -> Result<()> {
        let hsz = self.algo.raw_len();
        let body = &self.data[..self.data.len() - hsz];
        let trailer = &self.data[self.data.len() - hsz..];
        if self.algo.digest(body).as_bytes() != trailer {
            return Err(pack_error(&self.path, self.algo, "pack trailer digest mismatch"));
        }

        let mut cache = DeltaCache::default();
        for &(offset, id) in &self.idx.reverse_index() {
            let data = self.read_at(offset, &mut cache, 0)?;
            let actual = hash_record(self.algo, data.kind, &data.bytes);
            if actual != id {
                return Err(Error::ObjectCorrupt {
                    id,
                    reason: format!("packed record hashes to {}", actual),
                });
            }
        }
        Ok(())
    }
}

fn decode_kind(code: u8) -> Option<Kind> {
    match code {
        KIND_COMMIT => Some(Kind::Commit),
        KIND_TREE => Some(Kind::Tree),
        KIND_BLOB => Some(Kind::Blob),
        KIND_TAG => Some(Kind::Tag),
        _ => None,
    }
}

fn pack_error(path: &Path, algo: HashAlgo, reason: &str) -> Error {
    Error::ObjectCorrupt {
        id: algo.zero(),
        reason: format!("pack {}: {}", path.display(), reason),
    }
}
