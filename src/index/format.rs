//! the persisted index format: `DIRC` header, sorted entries,
//! extensions, trailing digest; versions 2 through 4

use bstr::{BString, ByteSlice};

use crate::error::{Error, Result};
use crate::hash::{HashAlgo, Id};
use crate::index::cache_tree::CacheTree;
use crate::index::entry::{flags, IndexEntry, StatData, NAME_LENGTH_MAX};
use crate::index::resolve_undo::{self, ResolveUndo};
use crate::types::Mode;

pub const SIGNATURE: &[u8; 4] = b"DIRC";
pub const VERSION_MIN: u32 = 2;
pub const VERSION_MAX: u32 = 4;

const FLAG_ASSUME_VALID: u16 = 1 << 15;
const FLAG_EXTENDED: u16 = 1 << 14;
const STAGE_SHIFT: u16 = 12;
const STAGE_MASK: u16 = 0x3;

const EXT_SKIP_WORKTREE: u16 = 1 << 14;
const EXT_INTENT_TO_ADD: u16 = 1 << 13;

/// an unrecognized extension preserved verbatim across a round-trip
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawExtension {
    pub tag: [u8; 4],
    pub payload: Vec<u8>,
}

/// everything one index file carries
#[derive(Default)]
pub struct RawIndex {
    pub version: u32,
    pub entries: Vec<IndexEntry>,
    pub cache_tree: Option<CacheTree>,
    pub resolve_undo: Vec<ResolveUndo>,
    /// split-index payload; interpreted by the split module
    pub link: Option<Vec<u8>>,
    pub unknown: Vec<RawExtension>,
}

/// parse an index file image
pub fn parse(data: &[u8], algo: HashAlgo) -> Result<RawIndex> {
    let hsz = algo.raw_len();
    if data.len() < 12 + hsz {
        return Err(corrupt("file too short"));
    }
    if &data[..4] != SIGNATURE {
        return Err(corrupt("bad signature"));
    }
    let version = u32::from_be_bytes(data[4..8].try_into().unwrap());
    if !(VERSION_MIN..=VERSION_MAX).contains(&version) {
        return Err(corrupt(&format!("unsupported version {}", version)));
    }
    let nr_entries = u32::from_be_bytes(data[8..12].try_into().unwrap()) as usize;

    // the trailer is a digest over everything before it; with the
    // skip-hash opt-in (v4) it is written as zeros instead
    let trailer_start = data.len() - hsz;
    let trailer = &data[trailer_start..];
    let trailer_is_zero = trailer.iter().all(|&b| b == 0);
    if trailer_is_zero {
        if version < 4 {
            return Err(corrupt("zero trailer on a pre-v4 index"));
        }
    } else if algo.digest(&data[..trailer_start]).as_bytes() != trailer {
        return Err(corrupt("trailer digest mismatch"));
    }

    let mut cursor = 12usize;
    let mut entries = Vec::with_capacity(nr_entries);
    let mut previous_name = BString::from("");
    for _ in 0..nr_entries {
        let entry = parse_entry(
            data,
            &mut cursor,
            trailer_start,
            algo,
            version,
            &previous_name,
        )?;
        previous_name = entry.path.clone();
        entries.push(entry);
    }
    for window in entries.windows(2) {
        if window[1].cmp_key(window[0].path.as_bstr(), window[0].stage) != std::cmp::Ordering::Greater
        {
            return Err(corrupt(&format!(
                "entries out of order: {} then {}",
                window[0].path, window[1].path
            )));
        }
    }

    let mut raw = RawIndex {
        version,
        entries,
        ..Default::default()
    };

    while cursor < trailer_start {
        if cursor + 8 > trailer_start {
            return Err(corrupt("truncated extension header"));
        }
        let tag: [u8; 4] = data[cursor..cursor + 4].try_into().unwrap();
        let size =
            u32::from_be_bytes(data[cursor + 4..cursor + 8].try_into().unwrap()) as usize;
        cursor += 8;
        if cursor + size > trailer_start {
            return Err(corrupt("extension overruns trailer"));
        }
        let payload = &data[cursor..cursor + size];
        cursor += size;

        match &tag {
            b"TREE" => raw.cache_tree = Some(CacheTree::parse_ext(payload, algo)?),
            b"REUC" => raw.resolve_undo = resolve_undo::parse_ext(payload, algo)?,
            b"link" => raw.link = Some(payload.to_vec()),
            // table-of-contents extensions describe the file we just
            // parsed; they are regenerated, never carried over
            b"EOIE" | b"IEOT" => {}
            _ => {
                if tag[0].is_ascii_uppercase() {
                    raw.unknown.push(RawExtension {
                        tag,
                        payload: payload.to_vec(),
                    });
                } else {
                    return Err(corrupt(&format!(
                        "unknown mandatory extension {:?}",
                        tag.as_bstr()
                    )));
                }
            }
        }
    }

    Ok(raw)
}

fn parse_entry(
    data: &[u8],
    cursor: &mut usize,
    limit: usize,
    algo: HashAlgo,
    version: u32,
    previous_name: &BString,
) -> Result<IndexEntry> {
    let hsz = algo.raw_len();
    let start = *cursor;
    let fixed = 40 + hsz + 2;
    if start + fixed > limit {
        return Err(corrupt("truncated entry"));
    }

    let mut fields = [0u32; 10];
    for (i, field) in fields.iter_mut().enumerate() {
        let at = start + i * 4;
        *field = u32::from_be_bytes(data[at..at + 4].try_into().unwrap());
    }
    let stat = StatData {
        ctime_sec: fields[0],
        ctime_nsec: fields[1],
        mtime_sec: fields[2],
        mtime_nsec: fields[3],
        dev: fields[4],
        ino: fields[5],
        uid: fields[7],
        gid: fields[8],
        size: fields[9],
    };
    let mode = Mode::from_u32(fields[6])
        .map_err(|_| corrupt(&format!("entry mode {:o}", fields[6])))?;

    let id = Id::from_bytes(algo, &data[start + 40..start + 40 + hsz]).expect("width checked");
    let disk_flags =
        u16::from_be_bytes(data[start + 40 + hsz..start + 40 + hsz + 2].try_into().unwrap());

    let mut entry_flags = 0u32;
    if disk_flags & FLAG_ASSUME_VALID != 0 {
        entry_flags |= flags::ASSUME_VALID;
    }
    let stage = ((disk_flags >> STAGE_SHIFT) & STAGE_MASK) as u8;
    let name_len_field = (disk_flags & NAME_LENGTH_MAX as u16) as usize;

    let mut after_flags = start + fixed;
    if disk_flags & FLAG_EXTENDED != 0 {
        if version < 3 {
            return Err(corrupt("extended flags in a v2 index"));
        }
        if after_flags + 2 > limit {
            return Err(corrupt("truncated extended flags"));
        }
        let ext = u16::from_be_bytes(data[after_flags..after_flags + 2].try_into().unwrap());
        after_flags += 2;
        if ext & EXT_SKIP_WORKTREE != 0 {
            entry_flags |= flags::SKIP_WORKTREE;
        }
        if ext & EXT_INTENT_TO_ADD != 0 {
            entry_flags |= flags::INTENT_TO_ADD;
        }
        if ext & !(EXT_SKIP_WORKTREE | EXT_INTENT_TO_ADD) != 0 {
            return Err(corrupt("unknown extended flag bits"));
        }
    }

    let path;
    if version >= 4 {
        // prefix compression against the previous entry's path
        let mut varint_cursor = after_flags;
        let strip = read_prefix_varint(data, &mut varint_cursor, limit)? as usize;
        if strip > previous_name.len() {
            return Err(corrupt("v4 prefix strip longer than previous name"));
        }
        let rest = &data[varint_cursor..limit];
        let nul = rest
            .find_byte(0)
            .ok_or_else(|| corrupt("unterminated v4 name"))?;
        let mut name = BString::from(&previous_name[..previous_name.len() - strip]);
        name.extend_from_slice(&rest[..nul]);
        path = name;
        *cursor = varint_cursor + nul + 1;
    } else {
        let name_start = after_flags;
        let name_len = if name_len_field < NAME_LENGTH_MAX {
            name_len_field
        } else {
            data[name_start..limit]
                .find_byte(0)
                .ok_or_else(|| corrupt("unterminated name"))?
        };
        if name_start + name_len > limit {
            return Err(corrupt("truncated name"));
        }
        path = BString::from(&data[name_start..name_start + name_len]);

        // entries are NUL-padded to an 8-byte boundary
        let fixed_len = after_flags - start;
        let entry_len = (fixed_len + name_len + 8) & !7;
        if start + entry_len > limit {
            return Err(corrupt("entry padding overruns trailer"));
        }
        *cursor = start + entry_len;
    }

    if version < 4 && name_len_field < NAME_LENGTH_MAX && name_len_field != path.len() {
        return Err(corrupt("name length field mismatch"));
    }

    Ok(IndexEntry {
        path,
        mode,
        id,
        stage,
        stat,
        flags: entry_flags,
    })
}

/// serialize an index image; returns the bytes and the trailer digest
/// (the digest is computed even when the zero-trailer opt-in elides it)
pub fn serialize(raw: &RawIndex, algo: HashAlgo, skip_hash: bool) -> (Vec<u8>, Id) {
    let needs_extended = raw
        .entries
        .iter()
        .any(|e| e.flags & (flags::SKIP_WORKTREE | flags::INTENT_TO_ADD) != 0);
    let mut version = raw.version.clamp(VERSION_MIN, VERSION_MAX);
    if needs_extended && version < 3 {
        version = 3;
    }

    let mut out = Vec::new();
    out.extend_from_slice(SIGNATURE);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend_from_slice(&(raw.entries.len() as u32).to_be_bytes());

    let mut previous_name = BString::from("");
    for entry in &raw.entries {
        write_entry(&mut out, entry, version, &previous_name);
        previous_name = entry.path.clone();
    }

    if let Some(cache_tree) = &raw.cache_tree {
        let mut payload = Vec::new();
        cache_tree.write_ext(&mut payload);
        write_extension(&mut out, b"TREE", &payload);
    }
    if !raw.resolve_undo.is_empty() {
        let mut payload = Vec::new();
        resolve_undo::write_ext(&raw.resolve_undo, &mut payload);
        write_extension(&mut out, b"REUC", &payload);
    }
    if let Some(link) = &raw.link {
        write_extension(&mut out, b"link", link);
    }
    for ext in &raw.unknown {
        write_extension(&mut out, &ext.tag, &ext.payload);
    }

    let digest = algo.digest(&out);
    if skip_hash && version >= 4 {
        out.extend_from_slice(&vec![0u8; algo.raw_len()]);
    } else {
        out.extend_from_slice(digest.as_bytes());
    }
    (out, digest)
}

fn write_entry(out: &mut Vec<u8>, entry: &IndexEntry, version: u32, previous_name: &BString) {
    let start = out.len();

    for field in [
        entry.stat.ctime_sec,
        entry.stat.ctime_nsec,
        entry.stat.mtime_sec,
        entry.stat.mtime_nsec,
        entry.stat.dev,
        entry.stat.ino,
        entry.mode.as_u32(),
        entry.stat.uid,
        entry.stat.gid,
        entry.stat.size,
    ] {
        out.extend_from_slice(&field.to_be_bytes());
    }
    out.extend_from_slice(entry.id.as_bytes());

    let extended = entry.flags & (flags::SKIP_WORKTREE | flags::INTENT_TO_ADD) != 0;
    let mut disk_flags = entry.path.len().min(NAME_LENGTH_MAX) as u16;
    disk_flags |= (entry.stage as u16 & STAGE_MASK) << STAGE_SHIFT;
    if entry.flags & flags::ASSUME_VALID != 0 {
        disk_flags |= FLAG_ASSUME_VALID;
    }
    if extended {
        disk_flags |= FLAG_EXTENDED;
    }
    out.extend_from_slice(&disk_flags.to_be_bytes());

    if extended {
        let mut ext = 0u16;
        if entry.flags & flags::SKIP_WORKTREE != 0 {
            ext |= EXT_SKIP_WORKTREE;
        }
        if entry.flags & flags::INTENT_TO_ADD != 0 {
            ext |= EXT_INTENT_TO_ADD;
        }
        out.extend_from_slice(&ext.to_be_bytes());
    }

    if version >= 4 {
        let common = previous_name
            .iter()
            .zip(entry.path.iter())
            .take_while(|(a, b)| a == b)
            .count();
        write_prefix_varint(out, (previous_name.len() - common) as u64);
        out.extend_from_slice(&entry.path[common..]);
        out.push(0);
    } else {
        out.extend_from_slice(&entry.path);
        let fixed_len = out.len() - start;
        let entry_len = (fixed_len + 8) & !7;
        out.resize(start + entry_len, 0);
    }
}

fn write_extension(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
    out.extend_from_slice(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
}

/// the big-endian prefix varint used by v4 path compression
fn read_prefix_varint(data: &[u8], cursor: &mut usize, limit: usize) -> Result<u64> {
    let mut byte = *data
        .get(*cursor)
        .filter(|_| *cursor < limit)
        .ok_or_else(|| corrupt("truncated varint"))?;
    *cursor += 1;
    let mut value = (byte & 0x7f) as u64;
    while byte & 0x80 != 0 {
        byte = *data
            .get(*cursor)
            .filter(|_| *cursor < limit)
            .ok_or_else(|| corrupt("truncated varint"))?;
        *cursor += 1;
        value = ((value + 1) << 7) | (byte & 0x7f) as u64;
    }
    Ok(value)
}

fn write_prefix_varint(out: &mut Vec<u8>, value: u64) {
    let mut buf = [0u8; 10];
    let mut pos = buf.len() - 1;
    let mut value = value;
    buf[pos] = (value & 0x7f) as u8;
    while value >> 7 != 0 {
        value = (value >> 7) - 1;
        pos -= 1;
        buf[pos] = 0x80 | (value & 0x7f) as u8;
    }
    out.extend_from_slice(&buf[pos..]);
}

fn corrupt(reason: &str) -> Error {
    Error::IndexCorrupt(reason.to_string())
}
