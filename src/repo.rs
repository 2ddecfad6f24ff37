use std::cell::{RefCell, RefMut};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::{Error, IoResultExt, Result};
use crate::graph::ObjectGraph;
use crate::hash::HashAlgo;
use crate::object::Odb;

/// environment override for the object directory
pub const ENV_OBJECT_DIR: &str = "LOAM_OBJECT_DIR";
/// environment override for the index file
pub const ENV_INDEX_FILE: &str = "LOAM_INDEX_FILE";
/// force expansion of a sparse index after every load
pub const ENV_FULL_INDEX: &str = "LOAM_FULL_INDEX";
/// force collapsing to a sparse index before every write
pub const ENV_SPARSE_INDEX: &str = "LOAM_SPARSE_INDEX";

/// a loam repository: configuration, object database, parsed-object
/// graph, and the paths everything lives under
///
/// there is no process-global state; every core function receives one
/// of these explicitly.
pub struct Repo {
    path: PathBuf,
    config: Config,
    index_file: PathBuf,
    force_full_index: bool,
    force_sparse_index: bool,
    odb: Odb,
    graph: RefCell<ObjectGraph>,
}

impl Repo {
    /// initialize a new repository at the given path
    pub fn init(path: &Path) -> Result<Self> {
        Self::init_with(path, Config::default())
    }

    /// initialize with explicit configuration (hash algorithm etc.)
    pub fn init_with(path: &Path, config: Config) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            return Err(Error::RepoExists(path.to_path_buf()));
        }

        // create directory structure
        std::fs::create_dir_all(path.join("objects/pack")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/heads")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/tags")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/remotes")).with_path(path)?;
        std::fs::create_dir_all(path.join("logs")).with_path(path)?;
        std::fs::create_dir_all(path.join("info")).with_path(path)?;
        std::fs::create_dir_all(path.join("tmp")).with_path(path)?;

        config.save(&config_path)?;

        // a fresh repository starts on an unborn default branch
        let head_path = path.join("HEAD");
        std::fs::write(&head_path, "ref: refs/heads/main\n").with_path(&head_path)?;

        Self::assemble(path.to_path_buf(), config)
    }

    /// open an existing repository
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoRepo(path.to_path_buf()));
        }
        let config = Config::load(&config_path)?;
        Self::assemble(path.to_path_buf(), config)
    }

    fn assemble(path: PathBuf, config: Config) -> Result<Self> {
        let object_dir = match std::env::var_os(ENV_OBJECT_DIR) {
            Some(dir) => PathBuf::from(dir),
            None => path.join("objects"),
        };
        let index_file = match std::env::var_os(ENV_INDEX_FILE) {
            Some(file) => PathBuf::from(file),
            None => path.join("index"),
        };
        let odb = Odb::new(
            config.core.hash_algo,
            object_dir,
            path.join("tmp"),
            config.core.multi_pack_index,
            config.pack.size_limit,
        );

        Ok(Self {
            path,
            config,
            index_file,
            force_full_index: std::env::var_os(ENV_FULL_INDEX).is_some(),
            force_sparse_index: std::env::var_os(ENV_SPARSE_INDEX).is_some(),
            odb,
            graph: RefCell::new(ObjectGraph::new()),
        })
    }

    /// repository root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    /// the object database
    pub fn odb(&self) -> &Odb {
        &self.odb
    }

    /// the parsed-object graph; hold the borrow for one operation only
    pub fn graph(&self) -> RefMut<'_, ObjectGraph> {
        self.graph.borrow_mut()
    }

    /// hash algorithm of this repository's ids
    pub fn algo(&self) -> HashAlgo {
        self.config.core.hash_algo
    }

    /// path of the staging index file
    pub fn index_file(&self) -> &Path {
        &self.index_file
    }

    pub fn refs_path(&self) -> PathBuf {
        self.path.join("refs")
    }

    pub fn heads_path(&self) -> PathBuf {
        self.path.join("refs/heads")
    }

    pub fn tags_path(&self) -> PathBuf {
        self.path.join("refs/tags")
    }

    pub fn head_path(&self) -> PathBuf {
        self.path.join("HEAD")
    }

    pub fn logs_path(&self) -> PathBuf {
        self.path.join("logs")
    }

    pub fn sparse_patterns_path(&self) -> PathBuf {
        self.path.join("info/sparse-checkout")
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    /// expand any sparse index immediately after load?
    pub fn force_full_index(&self) -> bool {
        self.force_full_index
    }

    /// collapse to a sparse index before every write?
    pub fn force_sparse_index(&self) -> bool {
        self.force_sparse_index
    }
}
