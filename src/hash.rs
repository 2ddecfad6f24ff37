use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// shortest accepted hex abbreviation of an object id
pub const MIN_ABBREV: usize = 4;

/// digest algorithm used for content addressing
///
/// the algorithm is a repository-wide choice recorded in config and threaded
/// through every interface that persists or transmits an id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HashAlgo {
    Sha1,
    Sha256,
}

impl HashAlgo {
    /// digest width in bytes
    pub fn raw_len(self) -> usize {
        match self {
            HashAlgo::Sha1 => 20,
            HashAlgo::Sha256 => 32,
        }
    }

    /// digest width in hex characters
    pub fn hex_len(self) -> usize {
        self.raw_len() * 2
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgo::Sha1 => "sha1",
            HashAlgo::Sha256 => "sha256",
        }
    }

    /// the all-zero id of this algorithm, denoting "absent"
    pub fn zero(self) -> Id {
        match self {
            HashAlgo::Sha1 => Id::Sha1([0u8; 20]),
            HashAlgo::Sha256 => Id::Sha256([0u8; 32]),
        }
    }

    /// start an incremental digest
    pub fn hasher(self) -> Hasher {
        match self {
            HashAlgo::Sha1 => Hasher::Sha1(Sha1::new()),
            HashAlgo::Sha256 => Hasher::Sha256(Sha256::new()),
        }
    }

    /// digest a complete buffer
    pub fn digest(self, data: &[u8]) -> Id {
        let mut h = self.hasher();
        h.update(data);
        h.finalize()
    }
}

impl Default for HashAlgo {
    fn default() -> Self {
        HashAlgo::Sha256
    }
}

/// incremental digest state (init/update/final)
pub enum Hasher {
    Sha1(Sha1),
    Sha256(Sha256),
}

impl Hasher {
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha1(h) => h.update(data),
            Hasher::Sha256(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Id {
        match self {
            Hasher::Sha1(h) => Id::Sha1(h.finalize().into()),
            Hasher::Sha256(h) => Id::Sha256(h.finalize().into()),
        }
    }

    /// digest of the bytes fed so far, without consuming the state
    pub fn clone_finalize(&self) -> Id {
        match self {
            Hasher::Sha1(h) => Id::Sha1(h.clone().finalize().into()),
            Hasher::Sha256(h) => Id::Sha256(h.clone().finalize().into()),
        }
    }
}

/// object id: the digest of a record's canonical encoding
///
/// equality, ordering and hashing are byte-lexicographic. within one
/// repository every id carries the same algorithm.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Id {
    Sha1([u8; 20]),
    Sha256([u8; 32]),
}

impl Id {
    /// parse from a full-width hex string; the algorithm is inferred from
    /// the length (40 or 64 characters)
    pub fn from_hex(s: &str) -> Result<Self> {
        let algo = match s.len() {
            40 => HashAlgo::Sha1,
            64 => HashAlgo::Sha256,
            _ => return Err(Error::IdSyntax(s.to_string())),
        };
        Self::from_hex_with(algo, s)
    }

    /// parse from hex for a known algorithm
    pub fn from_hex_with(algo: HashAlgo, s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| Error::IdSyntax(s.to_string()))?;
        Self::from_bytes(algo, &bytes).ok_or_else(|| Error::IdSyntax(s.to_string()))
    }

    /// create from raw digest bytes; None if the width does not match
    pub fn from_bytes(algo: HashAlgo, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != algo.raw_len() {
            return None;
        }
        Some(match algo {
            HashAlgo::Sha1 => {
                let mut arr = [0u8; 20];
                arr.copy_from_slice(bytes);
                Id::Sha1(arr)
            }
            HashAlgo::Sha256 => {
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                Id::Sha256(arr)
            }
        })
    }

    pub fn algo(&self) -> HashAlgo {
        match self {
            Id::Sha1(_) => HashAlgo::Sha1,
            Id::Sha256(_) => HashAlgo::Sha256,
        }
    }

    /// raw digest bytes
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Id::Sha1(b) => b,
            Id::Sha256(b) => b,
        }
    }

    /// convert to full-width hex
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }

    /// hex prefix of the given length, clamped to [MIN_ABBREV, hex_len]
    pub fn abbrev(&self, len: usize) -> String {
        let len = len.clamp(MIN_ABBREV, self.algo().hex_len());
        self.to_hex()[..len].to_string()
    }

    /// the all-zero id denotes "absent"
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|&b| b == 0)
    }

    /// does this id's hex form start with the given prefix?
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        self.to_hex().starts_with(prefix)
    }

    /// split into path components for the loose object store
    /// returns (first 2 hex chars, remaining hex chars)
    pub fn to_path_components(&self) -> (String, String) {
        let hex = self.to_hex();
        (hex[..2].to_string(), hex[2..].to_string())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", &self.to_hex()[..12])
    }
}

impl Serialize for Id {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// is the string entirely hex digits?
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_hexdigit())
}
