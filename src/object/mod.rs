//! the object store: durable content-addressed storage of the four
//! record kinds, over a loose and a packed backend

mod bulk;
mod delta;
mod idx;
mod loose;
mod midx;
mod pack;
mod store;

pub use delta::apply_delta;
pub use idx::{IdxEntry, PackIdx};
pub use midx::{write_midx, Midx};
pub use pack::{Pack, MAX_DELTA_DEPTH};
pub use store::{DeltaCache, KindHint, Odb};

use crate::error::{Error, Result};
use crate::hash::{HashAlgo, Id};
use crate::types::Kind;

/// kind and size of a stored record, without its payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub kind: Kind,
    pub size: u64,
}

/// a materialized record
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectData {
    pub kind: Kind,
    pub bytes: Vec<u8>,
}

/// canonical framing header: `<kind> SP <decimal-size> NUL`
pub fn encode_frame(kind: Kind, size: u64) -> Vec<u8> {
    let mut frame = format!("{} {}", kind.name(), size).into_bytes();
    frame.push(0);
    frame
}

/// parse a framing header; returns (kind, payload size, header length)
pub fn parse_frame(algo: HashAlgo, bytes: &[u8]) -> Result<(Kind, u64, usize)> {
    let nul = bytes
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| frame_error(algo, "missing NUL terminator"))?;
    let header = std::str::from_utf8(&bytes[..nul])
        .map_err(|_| frame_error(algo, "header is not utf-8"))?;
    let (kind, size) = header
        .split_once(' ')
        .ok_or_else(|| frame_error(algo, "missing size"))?;
    let kind = Kind::from_name(kind)?;
    let size: u64 = size
        .parse()
        .map_err(|_| frame_error(algo, "bad decimal size"))?;
    Ok((kind, size, nul + 1))
}

fn frame_error(algo: HashAlgo, reason: &str) -> Error {
    Error::ObjectCorrupt {
        id: algo.zero(),
        reason: format!("framing header: {}", reason),
    }
}

/// content address of a record: digest over framing header + payload
pub fn hash_record(algo: HashAlgo, kind: Kind, payload: &[u8]) -> Id {
    let mut hasher = algo.hasher();
    hasher.update(&encode_frame(kind, payload.len() as u64));
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = encode_frame(Kind::Blob, 13);
        assert_eq!(&frame, b"blob 13\0");
        let mut full = frame.clone();
        full.extend_from_slice(b"hello, world!");
        let (kind, size, hdrlen) = parse_frame(HashAlgo::Sha256, &full).unwrap();
        assert_eq!(kind, Kind::Blob);
        assert_eq!(size, 13);
        assert_eq!(hdrlen, 8);
    }

    #[test]
    fn test_frame_rejects_garbage() {
        assert!(parse_frame(HashAlgo::Sha256, b"blob 13 no nul").is_err());
        assert!(parse_frame(HashAlgo::Sha256, b"blob\0").is_err());
        assert!(parse_frame(HashAlgo::Sha256, b"widget 3\0abc").is_err());
        assert!(parse_frame(HashAlgo::Sha256, b"blob x\0").is_err());
    }

    #[test]
    fn test_frame_error_id_matches_algorithm() {
        match parse_frame(HashAlgo::Sha1, b"garbage") {
            Err(Error::ObjectCorrupt { id, .. }) => {
                assert_eq!(id.algo(), HashAlgo::Sha1);
                assert!(id.is_zero());
            }
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_hash_record_depends_on_kind_and_payload() {
        let a = hash_record(HashAlgo::Sha256, Kind::Blob, b"x");
        let b = hash_record(HashAlgo::Sha256, Kind::Tree, b"x");
        let c = hash_record(HashAlgo::Sha256, Kind::Blob, b"y");
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, hash_record(HashAlgo::Sha256, Kind::Blob, b"x"));
    }
}
