use std::path::PathBuf;

use crate::hash::Id;

/// error type for loam operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("repository not found at {0}")]
    NoRepo(PathBuf),

    #[error("repository already exists at {0}")]
    RepoExists(PathBuf),

    #[error("object not found: {0}")]
    ObjectMissing(Id),

    #[error("corrupt object {id}: {reason}")]
    ObjectCorrupt { id: Id, reason: String },

    #[error("short id {prefix} is ambiguous ({} candidates)", candidates.len())]
    IdAmbiguous { prefix: String, candidates: Vec<Id> },

    #[error("malformed object id: {0}")]
    IdSyntax(String),

    #[error("corrupt index: {0}")]
    IndexCorrupt(String),

    #[error("index is locked: {0}")]
    IndexLockHeld(PathBuf),

    #[error("unmerged entry in index: {0}")]
    IndexUnmerged(String),

    #[error("invalid path: {0}")]
    PathInvalid(String),

    #[error("tree entry conflict: {0}")]
    TreeEntryConflict(String),

    #[error("merge conflict at {0}")]
    MergeConflict(String),

    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("unborn branch: {0}")]
    UnbornHead(String),

    #[error("ref not found: {0}")]
    RefNotFound(String),

    #[error("invalid ref name: {0}")]
    InvalidRef(String),

    #[error("path not found in tree: {0}")]
    PathNotFound(String),

    #[error("invalid object type: {0}")]
    InvalidObjectType(String),

    #[error("object {id} is of kind {actual}, expected {expected}")]
    KindMismatch {
        id: Id,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("reflog for {0} has no entry {1}")]
    ReflogOutOfRange(String, usize),

    #[error("invalid revision expression: {0}")]
    RevisionSyntax(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("config serialization error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("invalid regex: {0}")]
    Regex(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// helper to wrap io errors with path context
pub trait IoResultExt<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::io::Result<T> {
    fn with_path(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|source| Error::Io {
            path: path.into(),
            source,
        })
    }
}
