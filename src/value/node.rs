//! Index-addressed value node arena
//!
//! Nodes form a tree through an owning `first_child` link and a non-owning
//! `next_sibling` link, the sibling link is a list pointer and never implies
//! ownership. Nodes are addressed by index into a fixed-capacity arena, so
//! there are no raw pointers to dangle and no cycles to leak: a node can be
//! appended only while it is a detached root.

use crate::error::{Error, Result};
use crate::slab::{BlockId, SlabPool};
use std::fmt;

/// Reference to one node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// One scalar or one branch of structured data.
#[derive(Debug, Clone, Copy, Default)]
struct Node {
    /// Key under which this node hangs in its parent (slab-backed)
    label: Option<BlockId>,
    /// Scalar payload (slab-backed); `None` marks a branch
    payload: Option<BlockId>,
    /// Owning link to the head of the child chain
    first_child: Option<NodeId>,
    /// Non-owning link to the next sibling
    next_sibling: Option<NodeId>,
}

/// Fixed-capacity arena of value nodes.
pub struct NodeArena {
    nodes: Vec<Node>,
    live: Vec<bool>,
    free: Vec<u32>,
}

impl NodeArena {
    /// Create an arena with a fixed node capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: vec![Node::default(); capacity],
            live: vec![false; capacity],
            // Pop from the back, so seed in reverse for low-index-first reuse
            free: (0..capacity as u32).rev().collect(),
        }
    }

    /// Number of live nodes.
    pub fn nodes_in_use(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Create a leaf node holding a scalar payload.
    pub fn create_leaf(&mut self, pool: &mut SlabPool, bytes: &[u8]) -> Result<NodeId> {
        let payload = pool.alloc_bytes(bytes)?;
        match self.alloc_node() {
            Ok(id) => {
                self.nodes[id.0 as usize].payload = Some(payload);
                Ok(id)
            }
            Err(e) => {
                pool.release(payload)?;
                Err(e)
            }
        }
    }

    /// Create an empty branch node.
    pub fn create_branch(&mut self) -> Result<NodeId> {
        self.alloc_node()
    }

    /// Attach a label to a node (the key it hangs under in its parent).
    pub fn set_label(&mut self, pool: &mut SlabPool, id: NodeId, label: &str) -> Result<()> {
        let idx = self.check(id)?;
        let block = pool.alloc_bytes(label.as_bytes())?;
        if let Some(old) = self.nodes[idx].label.replace(block) {
            pool.release(old)?;
        }
        Ok(())
    }

    /// Read a node's label, if any.
    pub fn label<'a>(&self, pool: &'a SlabPool, id: NodeId) -> Result<Option<&'a str>> {
        let idx = self.check(id)?;
        match self.nodes[idx].label {
            Some(block) => Ok(Some(pool.read_str(block)?)),
            None => Ok(None),
        }
    }

    /// Read a node's scalar payload, if any. Branch nodes return `None`.
    pub fn payload<'a>(&self, pool: &'a SlabPool, id: NodeId) -> Result<Option<&'a [u8]>> {
        let idx = self.check(id)?;
        match self.nodes[idx].payload {
            Some(block) => Ok(Some(pool.read(block)?)),
            None => Ok(None),
        }
    }

    /// Whether a node is a branch (no scalar payload).
    pub fn is_branch(&self, id: NodeId) -> Result<bool> {
        let idx = self.check(id)?;
        Ok(self.nodes[idx].payload.is_none())
    }

    /// Transfer ownership of a detached `child` to `parent`, appending it to
    /// the end of the parent's child chain.
    pub fn append_child(&mut self, parent: NodeId, child: NodeId) -> Result<()> {
        let parent_idx = self.check(parent)?;
        self.check(child)?;
        if parent == child {
            return Err(Error::InvalidBlock(format!(
                "Cannot append {} to itself",
                parent
            )));
        }
        if self.nodes[parent_idx].payload.is_some() {
            return Err(Error::InvalidBlock(format!(
                "Cannot append a child to leaf {}",
                parent
            )));
        }
        if self.nodes[child.0 as usize].next_sibling.is_some() {
            return Err(Error::InvalidBlock(format!(
                "{} is already linked into a sibling chain",
                child
            )));
        }

        match self.nodes[parent_idx].first_child {
            None => {
                self.nodes[parent_idx].first_child = Some(child);
            }
            Some(head) => {
                let mut cursor = head;
                loop {
                    if cursor == child {
                        return Err(Error::InvalidBlock(format!(
                            "{} is already a child of {}",
                            child, parent
                        )));
                    }
                    match self.nodes[cursor.0 as usize].next_sibling {
                        Some(next) => cursor = next,
                        None => break,
                    }
                }
                self.nodes[cursor.0 as usize].next_sibling = Some(child);
            }
        }
        Ok(())
    }

    /// Label a detached `child` and append it to `parent` in one step. On
    /// failure the child stays detached and owned by the caller.
    pub fn append_child_with_key(
        &mut self,
        pool: &mut SlabPool,
        parent: NodeId,
        child: NodeId,
        key: &str,
    ) -> Result<()> {
        self.set_label(pool, child, key)?;
        self.append_child(parent, child)
    }

    /// The children of a node, in chain order.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let idx = self.check(id)?;
        let mut out = Vec::new();
        let mut cursor = self.nodes[idx].first_child;
        while let Some(child) = cursor {
            out.push(child);
            cursor = self.nodes[child.0 as usize].next_sibling;
        }
        Ok(out)
    }

    /// Find a direct child by its label.
    pub fn find_child_by_key(
        &self,
        pool: &SlabPool,
        parent: NodeId,
        key: &str,
    ) -> Result<Option<NodeId>> {
        let idx = self.check(parent)?;
        let mut cursor = self.nodes[idx].first_child;
        while let Some(child) = cursor {
            if let Some(block) = self.nodes[child.0 as usize].label {
                if pool.read(block)? == key.as_bytes() {
                    return Ok(Some(child));
                }
            }
            cursor = self.nodes[child.0 as usize].next_sibling;
        }
        Ok(None)
    }

    /// Walk branch children by `.`-separated key segments.
    pub fn resolve_path(
        &self,
        pool: &SlabPool,
        root: NodeId,
        path: &str,
    ) -> Result<Option<NodeId>> {
        let mut cursor = root;
        for segment in path.split('.') {
            match self.find_child_by_key(pool, cursor, segment)? {
                Some(next) => cursor = next,
                None => return Ok(None),
            }
        }
        Ok(Some(cursor))
    }

    /// Recursively destroy a node: owned children and their slab blocks are
    /// released; the destroyed node's own sibling link is never followed.
    pub fn destroy(&mut self, pool: &mut SlabPool, id: NodeId) -> Result<()> {
        self.check(id)?;
        let mut stack = vec![id];
        while let Some(node) = stack.pop() {
            let idx = node.0 as usize;

            // Queue the owned child chain
            let mut cursor = self.nodes[idx].first_child;
            while let Some(child) = cursor {
                cursor = self.nodes[child.0 as usize].next_sibling;
                stack.push(child);
            }

            if let Some(block) = self.nodes[idx].label {
                pool.release(block)?;
            }
            if let Some(block) = self.nodes[idx].payload {
                pool.release(block)?;
            }
            self.nodes[idx] = Node::default();
            self.live[idx] = false;
            self.free.push(node.0);
        }
        Ok(())
    }

    fn alloc_node(&mut self) -> Result<NodeId> {
        let slot = self.free.pop().ok_or_else(|| {
            Error::PoolExhausted(format!(
                "Node arena is full ({} nodes)",
                self.nodes.len()
            ))
        })?;
        self.live[slot as usize] = true;
        self.nodes[slot as usize] = Node::default();
        Ok(NodeId(slot))
    }

    fn check(&self, id: NodeId) -> Result<usize> {
        let idx = id.0 as usize;
        if idx >= self.nodes.len() || !self.live[idx] {
            return Err(Error::InvalidBlock(format!("{} is not a live node", id)));
        }
        Ok(idx)
    }
}
