// Copyright 2026 the MToken Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The VM-owned value heap: arrays, strings, opaque buffers.
//!
//! Every allocation gets a monotonic id; handles never dangle silently
//! because lookups go through the live-node map. The optional mark-sweep
//! pass marks by id, so arrays-of-arrays may cycle without hanging the
//! collector.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};

use crate::value::{ArrayRef, OpaqueRef, StrRef, Value};

/// A heap access failure, mapped onto VM faults by the interpreter.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum HeapError {
    /// The handle does not name a live allocation.
    BadHandle,
    /// The allocation is not of the expected kind.
    WrongKind,
    /// An element index is out of bounds.
    OutOfBounds,
}

#[derive(Clone, Debug)]
enum HeapNode {
    Array(Vec<Value>),
    Str(String),
    Buffer(Vec<u8>),
}

/// Collector statistics reported through the host trace callback.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct CollectStats {
    pub(crate) freed: usize,
    pub(crate) live: usize,
}

/// The allocation list plus the collector.
#[derive(Clone, Debug, Default)]
pub(crate) struct ValueHeap {
    nodes: HashMap<u32, HeapNode>,
    next_id: u32,
    allocs_since_collect: u32,
}

impl ValueHeap {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn live_count(&self) -> usize {
        self.nodes.len()
    }

    /// Allocations since the last collection, for the auto-GC threshold.
    pub(crate) fn allocs_since_collect(&self) -> u32 {
        self.allocs_since_collect
    }

    fn insert(&mut self, node: HeapNode) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        self.nodes.insert(id, node);
        self.allocs_since_collect += 1;
        id
    }

    pub(crate) fn new_array(&mut self, len: usize) -> ArrayRef {
        ArrayRef(self.insert(HeapNode::Array(vec![Value::Int(0); len])))
    }

    pub(crate) fn new_str(&mut self, text: String) -> StrRef {
        StrRef(self.insert(HeapNode::Str(text)))
    }

    pub(crate) fn new_buffer(&mut self, size: usize) -> OpaqueRef {
        OpaqueRef(self.insert(HeapNode::Buffer(vec![0; size])))
    }

    pub(crate) fn array_len(&self, arr: ArrayRef) -> Result<usize, HeapError> {
        match self.nodes.get(&arr.0) {
            Some(HeapNode::Array(values)) => Ok(values.len()),
            Some(_) => Err(HeapError::WrongKind),
            None => Err(HeapError::BadHandle),
        }
    }

    pub(crate) fn str_len(&self, s: StrRef) -> Result<usize, HeapError> {
        match self.nodes.get(&s.0) {
            Some(HeapNode::Str(text)) => Ok(text.len()),
            Some(_) => Err(HeapError::WrongKind),
            None => Err(HeapError::BadHandle),
        }
    }

    pub(crate) fn array_get(&self, arr: ArrayRef, index: usize) -> Result<Value, HeapError> {
        match self.nodes.get(&arr.0) {
            Some(HeapNode::Array(values)) => {
                values.get(index).copied().ok_or(HeapError::OutOfBounds)
            }
            Some(_) => Err(HeapError::WrongKind),
            None => Err(HeapError::BadHandle),
        }
    }

    pub(crate) fn array_set(
        &mut self,
        arr: ArrayRef,
        index: usize,
        value: Value,
    ) -> Result<(), HeapError> {
        match self.nodes.get_mut(&arr.0) {
            Some(HeapNode::Array(values)) => match values.get_mut(index) {
                Some(slot) => {
                    *slot = value;
                    Ok(())
                }
                None => Err(HeapError::OutOfBounds),
            },
            Some(_) => Err(HeapError::WrongKind),
            None => Err(HeapError::BadHandle),
        }
    }

    /// Releases an `ALLOC`ed buffer.
    pub(crate) fn free_buffer(&mut self, buf: OpaqueRef) -> Result<(), HeapError> {
        match self.nodes.get(&buf.0) {
            Some(HeapNode::Buffer(_)) => {
                self.nodes.remove(&buf.0);
                Ok(())
            }
            Some(_) => Err(HeapError::WrongKind),
            None => Err(HeapError::BadHandle),
        }
    }

    /// Mark-sweep collection from `roots`.
    ///
    /// Array elements are themselves roots for further marking; the visited
    /// set is keyed by allocation id so cyclic arrays terminate.
    pub(crate) fn collect(&mut self, roots: impl Iterator<Item = Value>) -> CollectStats {
        let mut marked: HashSet<u32> = HashSet::new();
        let mut pending: Vec<u32> = Vec::new();

        for value in roots {
            if let Some(id) = handle_id(value)
                && marked.insert(id)
            {
                pending.push(id);
            }
        }

        while let Some(id) = pending.pop() {
            let Some(HeapNode::Array(values)) = self.nodes.get(&id) else {
                continue;
            };
            for &value in values {
                if let Some(elem) = handle_id(value)
                    && marked.insert(elem)
                {
                    pending.push(elem);
                }
            }
        }

        let before = self.nodes.len();
        self.nodes.retain(|id, _| marked.contains(id));
        self.allocs_since_collect = 0;

        CollectStats {
            freed: before - self.nodes.len(),
            live: self.nodes.len(),
        }
    }
}

fn handle_id(value: Value) -> Option<u32> {
    match value {
        Value::Array(ArrayRef(id)) | Value::Str(StrRef(id)) | Value::Opaque(OpaqueRef(id)) => {
            Some(id)
        }
        Value::Int(_) | Value::Float(_) | Value::Bool(_) => None,
    }
}
