mod commit;
mod tag;
mod tree;

pub use commit::{Commit, Identity, Timestamp};
pub use tag::Tag;
pub use tree::{entry_name_cmp, Tree, TreeEntry, TreeIter};

use crate::error::{Error, Result};

/// the four stored record kinds
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Blob,
    Tree,
    Commit,
    Tag,
}

impl Kind {
    pub fn name(self) -> &'static str {
        match self {
            Kind::Blob => "blob",
            Kind::Tree => "tree",
            Kind::Commit => "commit",
            Kind::Tag => "tag",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "blob" => Ok(Kind::Blob),
            "tree" => Ok(Kind::Tree),
            "commit" => Ok(Kind::Commit),
            "tag" => Ok(Kind::Tag),
            other => Err(Error::InvalidObjectType(other.to_string())),
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// file mode of a tree or index entry, restricted to the canonical set
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    Regular,
    Executable,
    Symlink,
    /// submodule: an opaque leaf pointing at a commit in another repository
    Gitlink,
    Tree,
}

impl Mode {
    pub fn as_u32(self) -> u32 {
        match self {
            Mode::Regular => 0o100644,
            Mode::Executable => 0o100755,
            Mode::Symlink => 0o120000,
            Mode::Gitlink => 0o160000,
            Mode::Tree => 0o040000,
        }
    }

    pub fn from_u32(raw: u32) -> Result<Self> {
        match raw {
            0o100644 => Ok(Mode::Regular),
            0o100755 => Ok(Mode::Executable),
            0o120000 => Ok(Mode::Symlink),
            0o160000 => Ok(Mode::Gitlink),
            0o040000 => Ok(Mode::Tree),
            other => Err(Error::InvalidObjectType(format!("mode {:o}", other))),
        }
    }

    /// octal form as serialized in tree payloads (no leading zero)
    pub fn octal(self) -> &'static str {
        match self {
            Mode::Regular => "100644",
            Mode::Executable => "100755",
            Mode::Symlink => "120000",
            Mode::Gitlink => "160000",
            Mode::Tree => "40000",
        }
    }

    pub fn from_octal(s: &[u8]) -> Result<Self> {
        match s {
            b"100644" => Ok(Mode::Regular),
            b"100755" => Ok(Mode::Executable),
            b"120000" => Ok(Mode::Symlink),
            b"160000" => Ok(Mode::Gitlink),
            b"40000" | b"040000" => Ok(Mode::Tree),
            other => Err(Error::InvalidObjectType(format!(
                "mode {}",
                String::from_utf8_lossy(other)
            ))),
        }
    }

    pub fn is_tree(self) -> bool {
        matches!(self, Mode::Tree)
    }

    pub fn is_file(self) -> bool {
        matches!(self, Mode::Regular | Mode::Executable)
    }

    pub fn is_gitlink(self) -> bool {
        matches!(self, Mode::Gitlink)
    }

    pub fn is_symlink(self) -> bool {
        matches!(self, Mode::Symlink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        for kind in [Kind::Blob, Kind::Tree, Kind::Commit, Kind::Tag] {
            assert_eq!(Kind::from_name(kind.name()).unwrap(), kind);
        }
        assert!(matches!(
            Kind::from_name("bloop"),
            Err(Error::InvalidObjectType(_))
        ));
    }

    #[test]
    fn test_mode_roundtrip() {
        for mode in [
            Mode::Regular,
            Mode::Executable,
            Mode::Symlink,
            Mode::Gitlink,
            Mode::Tree,
        ] {
            assert_eq!(Mode::from_u32(mode.as_u32()).unwrap(), mode);
            assert_eq!(Mode::from_octal(mode.octal().as_bytes()).unwrap(), mode);
        }
    }

    #[test]
    fn test_mode_rejects_unrestricted() {
        assert!(Mode::from_u32(0o100600).is_err());
        assert!(Mode::from_octal(b"100600").is_err());
    }

    #[test]
    fn test_tree_mode_no_leading_zero() {
        assert_eq!(Mode::Tree.octal(), "40000");
        // but a padded form is accepted on decode
        assert_eq!(Mode::from_octal(b"040000").unwrap(), Mode::Tree);
    }
}
