//! loose backend: one zlib-compressed file per record at
//! `objects/aa/bbcc…`, written atomically via temp + rename

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::error::{Error, IoResultExt, Result};
use crate::hash::{HashAlgo, Id};
use crate::object::{encode_frame, hash_record, parse_frame, ObjectData, ObjectInfo};
use crate::types::Kind;

/// filesystem path of a loose record
pub fn loose_path(objects_dir: &Path, id: &Id) -> PathBuf {
    let (dir, file) = id.to_path_components();
    objects_dir.join(dir).join(file)
}

pub fn has_loose(objects_dir: &Path, id: &Id) -> bool {
    loose_path(objects_dir, id).exists()
}

/// write a record to the loose backend, returning its id
///
/// two concurrent writes of the same id both succeed because the
/// destination path is content-addressed.
pub fn write_loose(
    objects_dir: &Path,
    tmp_dir: &Path,
    algo: HashAlgo,
    kind: Kind,
    payload: &[u8],
) -> Result<Id> {
    let id = hash_record(algo, kind, payload);

    let path = loose_path(objects_dir, &id);
    // deduplication: if the record already exists, we're done
    if path.exists() {
        return Ok(id);
    }

    let parent = path.parent().expect("loose path has a parent");
    fs::create_dir_all(parent).with_path(parent)?;

    // atomic write: temp -> fsync -> rename -> fsync parent
    let tmp_path = tmp_dir.join(uuid::Uuid::new_v4().to_string());
    {
        let tmp_file = File::create(&tmp_path).with_path(&tmp_path)?;
        let mut encoder = ZlibEncoder::new(tmp_file, Compression::default());
        encoder
            .write_all(&encode_frame(kind, payload.len() as u64))
            .with_path(&tmp_path)?;
        encoder.write_all(payload).with_path(&tmp_path)?;
        let tmp_file = encoder.finish().with_path(&tmp_path)?;
        tmp_file.sync_all().with_path(&tmp_path)?;
    }
    fs::rename(&tmp_path, &path).with_path(&path)?;
    fsync_dir(parent)?;

    Ok(id)
}

/// read and verify a loose record
pub fn read_loose(objects_dir: &Path, id: &Id) -> Result<ObjectData> {
    let decoded = inflate_loose(objects_dir, id, None)?;
    let (kind, size, hdrlen) = parse_frame(id.algo(), &decoded).map_err(|e| with_id(e, id))?;
    let payload = decoded[hdrlen..].to_vec();

    if payload.len() as u64 != size {
        return Err(Error::ObjectCorrupt {
            id: *id,
            reason: format!("size {} does not match header {}", payload.len(), size),
        });
    }
    // the payload must hash back to its name
    let actual = hash_record(id.algo(), kind, &payload);
    if actual != *id {
        return Err(Error::ObjectCorrupt {
            id: *id,
            reason: format!("digest mismatch: content hashes to {}", actual),
        });
    }

    Ok(ObjectData { kind, bytes: payload })
}

/// kind and size without materializing the payload
pub fn loose_info(objects_dir: &Path, id: &Id) -> Result<ObjectInfo> {
    // inflating a small prefix is enough to see the framing header
    let prefix = inflate_loose(objects_dir, id, Some(64))?;
    let (kind, size, _) = parse_frame(id.algo(), &prefix).map_err(|e| with_id(e, id))?;
    Ok(ObjectInfo { kind, size })
}

/// a corruption error raised while reading a known id names that id
fn with_id(e: Error, id: &Id) -> Error {
    match e {
        Error::ObjectCorrupt { reason, .. } => Error::ObjectCorrupt { id: *id, reason },
        other => other,
    }
}

fn inflate_loose(objects_dir: &Path, id: &Id, limit: Option<usize>) -> Result<Vec<u8>> {
    let path = loose_path(objects_dir, id);
    let file = File::open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::ObjectMissing(*id)
        } else {
            Error::Io {
                path: path.clone(),
                source: e,
            }
        }
    })?;

    let mut decoder = ZlibDecoder::new(file);
    let mut decoded = Vec::new();
    match limit {
        None => {
            decoder.read_to_end(&mut decoded).map_err(|e| Error::ObjectCorrupt {
                id: *id,
                reason: format!("zlib stream: {}", e),
            })?;
        }
        Some(limit) => {
            decoded.resize(limit, 0);
            let mut filled = 0;
            while filled < limit {
                match decoder.read(&mut decoded[filled..]) {
                    Ok(0) => break,
                    Ok(n) => filled += n,
                    Err(e) => {
                        return Err(Error::ObjectCorrupt {
                            id: *id,
                            reason: format!("zlib stream: {}", e),
                        })
                    }
                }
            }
            decoded.truncate(filled);
        }
    }
    Ok(decoded)
}

/// enumerate every id stored loose
pub fn for_each_loose(
    objects_dir: &Path,
    algo: HashAlgo,
    mut f: impl FnMut(Id) -> Result<()>,
) -> Result<()> {
    if !objects_dir.exists() {
        return Ok(());
    }
    for entry in walkdir::WalkDir::new(objects_dir)
        .min_depth(2)
        .max_depth(2)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| Error::Io {
            path: objects_dir.to_path_buf(),
            source: e.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let dir = entry
            .path()
            .parent()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .unwrap_or("");
        let file = entry.file_name().to_str().unwrap_or("");
        // skip non-object files (the pack directory lives alongside)
        if dir.len() != 2 || dir.len() + file.len() != algo.hex_len() {
            continue;
        }
        let hex = format!("{}{}", dir, file);
        if let Ok(id) = Id::from_hex_with(algo, &hex) {
            f(id)?;
        }
    }
    Ok(())
}

fn fsync_dir(path: &Path) -> Result<()> {
    let dir = File::open(path).with_path(path)?;
    dir.sync_all().with_path(path)?;
    Ok(())
}
