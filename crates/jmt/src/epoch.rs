// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Epoch-scoped node arena: one contiguous slab, bump-allocated, reclaimed as
//! a whole. Local index 0 is the nil sentinel and is never issued.
//!
//! Single-writer / many-reader: all mutation (`alloc`, `truncate`,
//! `reset_for_reuse`, `release`) happens under the tree's writer lock, while
//! readers copy nodes concurrently gated by an acquire load of `head`. A slot
//! below a published `head` is never rewritten while the arena keeps its
//! epoch id, and readers re-check the id around every access, so a recycled
//! arena resolves to "not found" rather than to a stale node.

use crate::error::TreeError;
use crate::node::Node;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

pub(crate) struct EpochArena {
    id: AtomicU64,
    head: AtomicU32,
    freed: AtomicBool,
    nodes: Box<[UnsafeCell<Node>]>,
}

// Readers only dereference slots below an acquire-loaded `head`; see the
// module contract above.
unsafe impl Send for EpochArena {}
unsafe impl Sync for EpochArena {}

impl EpochArena {
    pub fn new(id: u64, capacity: usize) -> Self {
        let capacity = capacity.max(2);
        let nodes = (0..capacity)
            .map(|_| UnsafeCell::new(Node::default()))
            .collect();
        Self {
            id: AtomicU64::new(id),
            head: AtomicU32::new(1),
            freed: AtomicBool::new(false),
            nodes,
        }
    }

    pub fn id(&self) -> u64 {
        self.id.load(Ordering::Acquire)
    }

    pub fn head(&self) -> u32 {
        self.head.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.nodes.len()
    }

    pub fn remaining(&self) -> usize {
        self.nodes.len() - self.head() as usize
    }

    pub fn is_freed(&self) -> bool {
        self.freed.load(Ordering::Acquire)
    }

    /// Restores `head` to a prior value after a failed batch. The abandoned
    /// slots are unreachable: nothing published references their indices.
    pub fn truncate(&self, new_head: u32) {
        self.head.store(new_head, Ordering::Release);
    }

    /// Writer-only bump allocation. The node is written before the new head
    /// is released, so a reader that observes the head also observes the node.
    pub fn alloc(&self, node: Node) -> Result<u32, TreeError> {
        if self.is_freed() {
            return Err(TreeError::ArenaFreed);
        }
        let index = self.head.load(Ordering::Relaxed);
        if index as usize >= self.nodes.len() {
            return Err(TreeError::ArenaFull);
        }
        unsafe { *self.nodes[index as usize].get() = node };
        self.head.store(index + 1, Ordering::Release);
        Ok(index)
    }

    pub fn node_at(&self, index: u32) -> Option<Node> {
        if index == 0 || index >= self.head() {
            return None;
        }
        Some(unsafe { *self.nodes[index as usize].get() })
    }

    /// Rebinds a warm-pool arena to a new epoch. Node storage is not zeroed;
    /// `head` gating makes the stale contents unreachable.
    pub fn reset_for_reuse(&self, new_id: u64) -> Result<(), TreeError> {
        if self.is_freed() {
            return Err(TreeError::ArenaFreed);
        }
        self.id.store(new_id, Ordering::Release);
        self.head.store(1, Ordering::Release);
        Ok(())
    }

    /// Logically frees the arena ahead of its deferred physical drop. Readers
    /// observe `head == 0` and resolve every lookup to "not found".
    pub fn release(&self) {
        self.freed.store(true, Ordering::Release);
        self.head.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::H256;

    fn leaf(version: u64) -> Node {
        Node::new_leaf(H256::repeat_byte(version as u8), version)
    }

    #[test]
    fn bump_allocation_skips_nil_slot() {
        let arena = EpochArena::new(3, 8);
        assert_eq!(arena.id(), 3);
        assert_eq!(arena.head(), 1);
        assert_eq!(arena.remaining(), 7);

        let first = arena.alloc(leaf(1)).unwrap();
        assert_eq!(first, 1);
        assert_eq!(arena.node_at(first).unwrap().version, 1);
        assert_eq!(arena.node_at(0), None);
        assert_eq!(arena.node_at(2), None);
    }

    #[test]
    fn alloc_fails_when_exhausted() {
        let arena = EpochArena::new(1, 2);
        arena.alloc(leaf(1)).unwrap();
        assert_eq!(arena.alloc(leaf(2)), Err(TreeError::ArenaFull));
    }

    #[test]
    fn tiny_capacities_clamp_to_two() {
        let arena = EpochArena::new(1, 0);
        assert_eq!(arena.capacity(), 2);
    }

    #[test]
    fn truncate_hides_rolled_back_nodes() {
        let arena = EpochArena::new(1, 8);
        let base = arena.head();
        arena.alloc(leaf(1)).unwrap();
        arena.alloc(leaf(2)).unwrap();
        arena.truncate(base);
        assert_eq!(arena.node_at(1), None);
        assert_eq!(arena.remaining(), 7);
    }

    #[test]
    fn reuse_rebinds_id_and_head() {
        let arena = EpochArena::new(4, 8);
        arena.alloc(leaf(1)).unwrap();
        arena.reset_for_reuse(9).unwrap();
        assert_eq!(arena.id(), 9);
        assert_eq!(arena.head(), 1);
        assert_eq!(arena.node_at(1), None);
    }

    #[test]
    fn released_arena_refuses_everything() {
        let arena = EpochArena::new(5, 8);
        arena.alloc(leaf(1)).unwrap();
        arena.release();
        assert!(arena.is_freed());
        assert_eq!(arena.node_at(1), None);
        assert_eq!(arena.alloc(leaf(2)), Err(TreeError::ArenaFreed));
        assert_eq!(arena.reset_for_reuse(6), Err(TreeError::ArenaFreed));
    }
}
