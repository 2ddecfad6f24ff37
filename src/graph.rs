//! parsed object graph: a per-repository map from id to typed,
//! lazily-parsed in-memory objects
//!
//! nodes are allocated out of one slab per kind and referenced by
//! copyable handles, so the whole graph is cleared at once and no
//! owning references cross between objects.

use std::collections::HashMap;

use log::warn;

use crate::error::{Error, Result};
use crate::hash::Id;
use crate::object::Odb;
use crate::types::{Commit, Kind, Tag, Tree};

/// stable reference to a node: (arena kind, slot index)
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Handle {
    kind: Kind,
    index: u32,
}

impl Handle {
    pub fn kind(&self) -> Kind {
        self.kind
    }
}

struct Node<T> {
    id: Id,
    flags: u32,
    used: bool,
    data: Option<T>,
}

impl<T> Node<T> {
    fn shell(id: Id) -> Self {
        Self {
            id,
            flags: 0,
            used: false,
            data: None,
        }
    }
}

/// tree nodes keep the raw payload resident so callers can iterate
/// entries without copies
struct TreeData {
    raw: Vec<u8>,
    tree: Tree,
}

/// the process-wide (per-repository) object graph
#[derive(Default)]
pub struct ObjectGraph {
    blobs: Vec<Node<()>>,
    trees: Vec<Node<TreeData>>,
    commits: Vec<Node<Commit>>,
    tags: Vec<Node<Tag>>,
    by_id: HashMap<Id, Handle>,
}

impl ObjectGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// drop every node at once; callers must not hold handles across this
    pub fn clear(&mut self) {
        self.blobs.clear();
        self.trees.clear();
        self.commits.clear();
        self.tags.clear();
        self.by_id.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// canonical handle for an id, creating an empty shell if absent
    ///
    /// two lookups of the same id return the same handle. the store is
    /// consulted only when a lookup contradicts an earlier
    /// classification: the stored record's kind wins, and the conflict
    /// is reported.
    pub fn lookup(&mut self, odb: &Odb, kind: Kind, id: Id) -> Handle {
        if let Some(&handle) = self.by_id.get(&id) {
            if handle.kind != kind {
                return self.resolve_kind_conflict(odb, handle, kind, id);
            }
            return handle;
        }
        self.new_shell(kind, id)
    }

    fn new_shell(&mut self, kind: Kind, id: Id) -> Handle {
        let index = match kind {
            Kind::Blob => {
                self.blobs.push(Node::shell(id));
                self.blobs.len() - 1
            }
            Kind::Tree => {
                self.trees.push(Node::shell(id));
                self.trees.len() - 1
            }
            Kind::Commit => {
                self.commits.push(Node::shell(id));
                self.commits.len() - 1
            }
            Kind::Tag => {
                self.tags.push(Node::shell(id));
                self.tags.len() - 1
            }
        } as u32;
        let handle = Handle { kind, index };
        self.by_id.insert(id, handle);
        handle
    }

    /// two callers disagree about a record's kind: the stored record is
    /// the authority; an id the store cannot verify keeps its first
    /// classification
    fn resolve_kind_conflict(
        &mut self,
        odb: &Odb,
        existing: Handle,
        requested: Kind,
        id: Id,
    ) -> Handle {
        let verified = odb.info(&id).ok().map(|info| info.kind);
        warn!(
            "object {} classified as both {} and {}, stored kind is {}",
            id,
            existing.kind.name(),
            requested.name(),
            verified.map(|k| k.name()).unwrap_or("unverifiable")
        );
        match verified {
            Some(kind) if kind != existing.kind => {
                // re-pin the id to a shell of the verified kind; the
                // stale shell stays in its arena until the graph clears
                self.new_shell(kind, id)
            }
            _ => existing,
        }
    }

    /// lookup with the kind discovered from the store
    pub fn lookup_any(&mut self, odb: &Odb, id: Id) -> Result<Handle> {
        if let Some(&handle) = self.by_id.get(&id) {
            return Ok(handle);
        }
        let info = odb.info(&id)?;
        Ok(self.lookup(odb, info.kind, id))
    }

    pub fn id_of(&self, handle: Handle) -> Id {
        match handle.kind {
            Kind::Blob => self.blobs[handle.index as usize].id,
            Kind::Tree => self.trees[handle.index as usize].id,
            Kind::Commit => self.commits[handle.index as usize].id,
            Kind::Tag => self.tags[handle.index as usize].id,
        }
    }

    pub fn is_parsed(&self, handle: Handle) -> bool {
        match handle.kind {
            Kind::Blob => self.blobs[handle.index as usize].data.is_some(),
            Kind::Tree => self.trees[handle.index as usize].data.is_some(),
            Kind::Commit => self.commits[handle.index as usize].data.is_some(),
            Kind::Tag => self.tags[handle.index as usize].data.is_some(),
        }
    }

    /// populate a shell from the store; second and later calls are no-ops
    pub fn parse(&mut self, odb: &Odb, handle: Handle) -> Result<()> {
        if self.is_parsed(handle) {
            return Ok(());
        }
        let id = self.id_of(handle);
        match handle.kind {
            Kind::Blob => {
                // a blob carries nothing past its id
                odb.info(&id)?;
                self.blobs[handle.index as usize].data = Some(());
            }
            Kind::Tree => {
                let data = odb.read_kind(&id, Kind::Tree)?;
                let tree = Tree::decode(odb.algo(), &data.bytes)?;
                self.trees[handle.index as usize].data = Some(TreeData {
                    raw: data.bytes,
                    tree,
                });
            }
            Kind::Commit => {
                let data = odb.read_kind(&id, Kind::Commit)?;
                let commit = Commit::decode(odb.algo(), &data.bytes)?;
                self.commits[handle.index as usize].data = Some(commit);
            }
            Kind::Tag => {
                let data = odb.read_kind(&id, Kind::Tag)?;
                let tag = Tag::decode(odb.algo(), &data.bytes)?;
                self.tags[handle.index as usize].data = Some(tag);
            }
        }
        Ok(())
    }

    /// parse and return a commit in one step
    pub fn parse_commit(&mut self, odb: &Odb, handle: Handle) -> Result<&Commit> {
        self.parse(odb, handle)?;
        self.commit(handle).ok_or_else(|| Error::KindMismatch {
            id: self.id_of(handle),
            expected: "commit",
            actual: handle.kind.name(),
        })
    }

    /// parse and return a tree in one step
    pub fn parse_tree(&mut self, odb: &Odb, handle: Handle) -> Result<&Tree> {
        self.parse(odb, handle)?;
        self.tree(handle).ok_or_else(|| Error::KindMismatch {
            id: self.id_of(handle),
            expected: "tree",
            actual: handle.kind.name(),
        })
    }

    pub fn commit(&self, handle: Handle) -> Option<&Commit> {
        if handle.kind != Kind::Commit {
            return None;
        }
        self.commits[handle.index as usize].data.as_ref()
    }

    pub fn tree(&self, handle: Handle) -> Option<&Tree> {
        if handle.kind != Kind::Tree {
            return None;
        }
        self.trees[handle.index as usize]
            .data
            .as_ref()
            .map(|d| &d.tree)
    }

    /// raw payload of a parsed tree, for zero-copy iteration
    pub fn tree_raw(&self, handle: Handle) -> Option<&[u8]> {
        if handle.kind != Kind::Tree {
            return None;
        }
        self.trees[handle.index as usize]
            .data
            .as_ref()
            .map(|d| d.raw.as_slice())
    }

    pub fn tag(&self, handle: Handle) -> Option<&Tag> {
        if handle.kind != Kind::Tag {
            return None;
        }
        self.tags[handle.index as usize].data.as_ref()
    }

    /// follow tag targets until a non-tag object is reached
    pub fn deref_tag(&mut self, odb: &Odb, mut handle: Handle) -> Result<Handle> {
        // stored records cannot form a cycle, but a corrupt store could
        let mut hops = 0;
        while handle.kind == Kind::Tag {
            if hops > 32 {
                return Err(Error::ObjectCorrupt {
                    id: self.id_of(handle),
                    reason: "tag chain too deep".to_string(),
                });
            }
            self.parse(odb, handle)?;
            let tag = self.tag(handle).expect("just parsed");
            let (target, kind) = (tag.object, tag.target_kind);
            handle = self.lookup(odb, kind, target);
            hops += 1;
        }
        Ok(handle)
    }

    fn flags_mut(&mut self, handle: Handle) -> (&mut u32, &mut bool) {
        match handle.kind {
            Kind::Blob => {
                let node = &mut self.blobs[handle.index as usize];
                (&mut node.flags, &mut node.used)
            }
            Kind::Tree => {
                let node = &mut self.trees[handle.index as usize];
                (&mut node.flags, &mut node.used)
            }
            Kind::Commit => {
                let node = &mut self.commits[handle.index as usize];
                (&mut node.flags, &mut node.used)
            }
            Kind::Tag => {
                let node = &mut self.tags[handle.index as usize];
                (&mut node.flags, &mut node.used)
            }
        }
    }

    fn flags_of(&self, handle: Handle) -> (u32, bool) {
        match handle.kind {
            Kind::Blob => {
                let node = &self.blobs[handle.index as usize];
                (node.flags, node.used)
            }
            Kind::Tree => {
                let node = &self.trees[handle.index as usize];
                (node.flags, node.used)
            }
            Kind::Commit => {
                let node = &self.commits[handle.index as usize];
                (node.flags, node.used)
            }
            Kind::Tag => {
                let node = &self.tags[handle.index as usize];
                (node.flags, node.used)
            }
        }
    }

    /// open-ended traversal-marking bits
    pub fn set_flag(&mut self, handle: Handle, bit: u32) {
        *self.flags_mut(handle).0 |= bit;
    }

    pub fn clear_flag(&mut self, handle: Handle, bit: u32) {
        *self.flags_mut(handle).0 &= !bit;
    }

    pub fn has_flag(&self, handle: Handle, bit: u32) -> bool {
        self.flags_of(handle).0 & bit != 0
    }

    /// reachability marker consulted by garbage-collection passes
    pub fn mark_used(&mut self, handle: Handle) {
        *self.flags_mut(handle).1 = true;
    }

    pub fn is_used(&self, handle: Handle) -> bool {
        self.flags_of(handle).1
    }
}
