//! Pointer node table
//!
//! NDR supports three pointer semantics:
//!
//! - Reference (`[ref]`): non-null; top-level pointees follow inline with no
//!   wire representation, embedded ones leave a 4-byte placeholder
//! - Unique (`[unique]`): nullable, 4-byte referent id
//! - Full (`[ptr]`): nullable, 4-byte referent id, aliasing allowed
//!
//! Unique and full pointers share the node table: the first reference to a
//! pointee assigns the next node id and transmits the pointee, later
//! references transmit the id alone.

use std::collections::HashMap;

use tracing::trace;

use crate::{HeapRef, NdrError, Result};

/// Referent id written for an embedded `[ref]` pointer
pub const REF_PLACEHOLDER: u32 = 0x0002_0000;

/// Outcome of looking up a host pointer while marshalling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLookup {
    /// First sighting; the pointee must be transmitted
    New(u32),
    /// Already transmitted; only the id goes on the wire
    Seen(u32),
}

/// Bidirectional node id ⇄ host handle map for one operation
#[derive(Debug, Default)]
pub struct NodeTable {
    by_ref: HashMap<HeapRef, u32>,
    by_id: HashMap<u32, HeapRef>,
    next_id: u32,
}

impl NodeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Marshal side: id for `node`, assigning the next one on first sight
    pub fn marshal_lookup(&mut self, node: HeapRef) -> Result<NodeLookup> {
        if let Some(&id) = self.by_ref.get(&node) {
            return Ok(NodeLookup::Seen(id));
        }
        self.next_id = self.next_id.checked_add(1).ok_or(NdrError::IntegerOverflow)?;
        let id = self.next_id;
        self.by_ref.insert(node, id);
        self.by_id.insert(id, node);
        trace!("node table: {} -> node {}", node, id);
        Ok(NodeLookup::New(id))
    }

    /// Unmarshal side: allocation already bound to `id`
    pub fn lookup_id(&self, id: u32) -> Option<HeapRef> {
        self.by_id.get(&id).copied()
    }

    /// Id previously bound to `node`
    pub fn lookup_ref(&self, node: HeapRef) -> Option<u32> {
        self.by_ref.get(&node).copied()
    }

    /// Unmarshal side: bind a fresh allocation to a wire id
    pub fn register(&mut self, id: u32, node: HeapRef) -> Result<()> {
        if id == 0 {
            return Err(NdrError::UnknownNode(id));
        }
        if self.by_id.contains_key(&id) || self.by_ref.contains_key(&node) {
            return Err(NdrError::InvalidHeapRef(node.0));
        }
        self.by_id.insert(id, node);
        self.by_ref.insert(node, id);
        trace!("node table: node {} -> {}", id, node);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.by_ref.clear();
        self.by_id.clear();
        self.next_id = 0;
    }
}
