//! loam - content-addressed version control core
//!
//! the object database, staging index, and tree reconciliation engine
//! of a version control system. every tracked state of a project
//! reduces to a set of immutable, hash-named records linked by
//! reference.
//!
//! # Core concepts
//!
//! - **Blob**: opaque file bytes, addressed by digest
//! - **Tree**: a directory listing of (mode, name, id) in canonical order
//! - **Commit**: a tree plus parents, identities, and a message
//! - **Tag**: a named annotation pointing at any other record
//! - **Index**: the ordered staging area between working tree and trees
//!
//! records are framed as `<kind> SP <size> NUL <payload>` and stored
//! zlib-deflated, either loose (one file per record) or packed (many
//! records per file, raw or delta-encoded).
//!
//! # Example usage
//!
//! ```no_run
//! use loam::{ops, Repo};
//! use std::path::Path;
//!
//! // initialize a repository
//! let repo = Repo::init(Path::new("/path/to/repo")).unwrap();
//!
//! // stage a blob and write the index out as a tree
//! let id = repo.odb().write(loam::Kind::Blob, b"hello").unwrap();
//! let (mut index, lock) = loam::Index::load_locked(&repo).unwrap();
//! index.add(
//!     loam::IndexEntry::new(loam::Mode::Regular, id, "hello.txt", 0),
//!     loam::index::add_opts::OK_TO_ADD,
//! ).unwrap();
//! let tree = index.write_tree(repo.odb(), 0).unwrap();
//! index.write(&repo, lock).unwrap();
//!
//! // name resolution
//! let resolved = loam::revision::resolve(&repo, &format!("{}:hello.txt", tree)).unwrap();
//! assert_eq!(resolved.id, id);
//! ```

mod config;
mod error;
mod graph;
mod hash;
mod repo;

pub mod index;
pub mod object;
pub mod refs;
pub mod revision;
pub mod types;
pub mod unpack;

/// high-level reconciliation operations
pub mod ops {
    pub use crate::unpack::{
        check_updates, oneway_policy, twoway_policy, unpack_trees, Candidate, MergeResult,
        UnpackOptions,
    };
}

pub use config::{BranchConfig, CheckStat, Config, CoreConfig, IndexConfig, PackConfig};
pub use error::{Error, IoResultExt, Result};
pub use graph::{Handle, ObjectGraph};
pub use hash::{is_hex, HashAlgo, Hasher, Id, MIN_ABBREV};
pub use index::{Index, IndexEntry, IndexLock, SparseMode, SparsePatterns, StatData};
pub use object::{
    apply_delta, hash_record, write_midx, KindHint, ObjectData, ObjectInfo, Odb, Pack, PackIdx,
};
pub use repo::Repo;
pub use types::{Commit, Identity, Kind, Mode, Tag, Timestamp, Tree, TreeEntry, TreeIter};
