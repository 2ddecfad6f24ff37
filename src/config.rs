use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, Result};
use crate::hash::HashAlgo;

/// repository configuration stored in config.toml
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub core: CoreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub pack: PackConfig,
    /// per-branch upstream configuration, keyed by short branch name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub branches: BTreeMap<String, BranchConfig>,
}

impl Config {
    /// load config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    pub fn branch(&self, name: &str) -> Option<&BranchConfig> {
        self.branches.get(name)
    }
}

/// [core] section
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// digest algorithm for this repository's object ids
    pub hash_algo: HashAlgo,
    /// honor the executable bit when comparing modes
    pub file_mode: bool,
    /// the filesystem supports symbolic links
    pub symlinks: bool,
    /// fold case in path hashing and lookups
    pub ignore_case: bool,
    /// include ctime in stat-cache comparison
    pub trust_ctime: bool,
    /// which stat fields to compare: "default" (all) or "minimal"
    pub check_stat: CheckStat,
    /// sparse-checkout is enabled
    pub sparse_checkout: bool,
    /// sparse-checkout patterns are restricted to cone mode
    pub sparse_checkout_cone: bool,
    /// consult the multi-pack index on lookups
    pub multi_pack_index: bool,
    pub repository_format_version: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            hash_algo: HashAlgo::default(),
            file_mode: true,
            symlinks: true,
            ignore_case: false,
            trust_ctime: true,
            check_stat: CheckStat::Default,
            sparse_checkout: false,
            sparse_checkout_cone: false,
            multi_pack_index: false,
            repository_format_version: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStat {
    /// compare all cached stat fields
    Default,
    /// compare only size and the whole seconds of mtime
    Minimal,
}

/// [index] section: write-side format choices
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// on-disk format version to write (2..=4)
    pub version: u32,
    /// write a zero trailer instead of a digest (v4 only)
    pub skip_hash: bool,
    /// allow collapsing to a sparse index on write
    pub sparse: bool,
    /// maintain a split index (base + overlay)
    pub split: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            version: 2,
            skip_hash: false,
            sparse: false,
            split: false,
        }
    }
}

/// [pack] section
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    /// cap on a single pack written by bulk checkin, in bytes
    pub size_limit: Option<u64>,
}

/// upstream tracking for one branch
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchConfig {
    /// remote the branch pulls from
    pub remote: Option<String>,
    /// full ref name merged from that remote, e.g. "refs/heads/main"
    pub merge: Option<String>,
    /// remote the branch pushes to, when different from `remote`
    pub push_remote: Option<String>,
}
