// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Level-synchronous batch rebuild.
//!
//! A commit walks each normalized mutation top-down once, capturing the
//! sibling index at every depth, then rebuilds bottom-up one level at a time.
//! At each depth the current frontier is scanned left to right; entries that
//! share the top `depth` bits form a run that produces exactly one parent.
//! A run covers at most one left and one right child; an absent side is
//! filled from the captured path of the present side's originating mutation,
//! which stitches the new interior nodes to the unchanged remainder of the
//! previous tree. Runs whose children are both nil collapse to a zero
//! subtree without allocating.
//!
//! Grouping all parent work of a depth together is what feeds the router:
//! parents are hashed four at a time, and the residual of a level goes
//! through the scalar path so batch boundaries never change the output.

use crate::bits::{bit_at, prefix_path, same_prefix, TREE_DEPTH};
use crate::epoch::EpochArena;
use crate::error::TreeError;
use crate::hash::{HashEngine, ParentPair, SIMD_CHUNK_SIZE};
use crate::memory::MemoryManager;
use crate::node::Node;
use crate::tree::{Mutation, StateTree};
use primitive_types::H256;

/// Sibling global index at every depth of one mutation's root-to-leaf walk,
/// recorded against the previous root.
pub(crate) struct PathStack {
    sibling: [u32; TREE_DEPTH],
}

impl Default for PathStack {
    fn default() -> Self {
        Self {
            sibling: [0; TREE_DEPTH],
        }
    }
}

/// One frontier entry: the subtree root `index` for `key`'s prefix, plus the
/// mutation (`witness`) whose path stack fills absent siblings above it.
#[derive(Clone, Copy)]
struct LevelEntry {
    key: H256,
    index: u32,
    witness: u32,
}

#[derive(Default)]
struct LevelBuffer {
    curr: Vec<LevelEntry>,
    next: Vec<LevelEntry>,
}

impl LevelBuffer {
    fn swap(&mut self) {
        std::mem::swap(&mut self.curr, &mut self.next);
        self.next.clear();
    }
}

#[derive(Clone, Copy, Default)]
struct PendingParent {
    left_index: u32,
    right_index: u32,
    key: H256,
    witness: u32,
}

/// Coalesces up to four pending parents and routes full chunks to the
/// batched compression.
struct SimdRouter<'a> {
    hasher: &'a HashEngine,
    batch: [ParentPair; SIMD_CHUNK_SIZE],
    meta: [PendingParent; SIMD_CHUNK_SIZE],
    out: [H256; SIMD_CHUNK_SIZE],
    count: usize,
}

impl<'a> SimdRouter<'a> {
    fn new(hasher: &'a HashEngine) -> Self {
        Self {
            hasher,
            batch: [ParentPair::default(); SIMD_CHUNK_SIZE],
            meta: [PendingParent::default(); SIMD_CHUNK_SIZE],
            out: [H256::zero(); SIMD_CHUNK_SIZE],
            count: 0,
        }
    }

    /// Queues one parent; returns true when the chunk is full.
    fn add(&mut self, left: H256, right: H256, meta: PendingParent) -> bool {
        self.batch[self.count] = ParentPair { left, right };
        self.meta[self.count] = meta;
        self.count += 1;
        self.count == SIMD_CHUNK_SIZE
    }

    fn flush_x4(&mut self) -> (&[H256; SIMD_CHUNK_SIZE], &[PendingParent; SIMD_CHUNK_SIZE]) {
        debug_assert_eq!(self.count, SIMD_CHUNK_SIZE);
        let (batch, out) = (&self.batch, &mut self.out);
        self.hasher.compress_parents_x4(batch, out);
        self.count = 0;
        (&self.out, &self.meta)
    }
}

/// Reusable working state of the single writer.
#[derive(Default)]
pub(crate) struct BatchUpdater {
    path_stacks: Vec<PathStack>,
    level: LevelBuffer,
}

impl BatchUpdater {
    fn fill_path_stack(tree: &StateTree, root_index: u32, key: &H256, stack: &mut PathStack) {
        let mut current = root_index;
        for depth in 0..TREE_DEPTH {
            if current == 0 {
                stack.sibling[depth] = 0;
                continue;
            }
            match tree.node_by_index(current) {
                None => {
                    stack.sibling[depth] = 0;
                    current = 0;
                }
                Some(node) => {
                    if bit_at(key, depth) == 0 {
                        stack.sibling[depth] = node.right_index;
                        current = node.left_index;
                    } else {
                        stack.sibling[depth] = node.left_index;
                        current = node.right_index;
                    }
                }
            }
        }
    }

    /// Rebuilds the dirty paths of `mutations` against `base_root`, returning
    /// the new root index and hash. Nodes go into `epoch`; on error the
    /// caller rolls the epoch and locator counters back.
    pub fn apply_dirty_paths(
        &mut self,
        tree: &StateTree,
        memory: &mut MemoryManager,
        epoch: &EpochArena,
        base_root: u32,
        version: u64,
        mutations: &[Mutation],
    ) -> Result<(u32, H256), TreeError> {
        if mutations.is_empty() {
            return Ok((base_root, tree.node_hash_at_depth(base_root, 0)));
        }

        if self.path_stacks.len() < mutations.len() {
            self.path_stacks
                .resize_with(mutations.len(), PathStack::default);
        }
        self.level.curr.clear();
        self.level.next.clear();
        self.level.curr.reserve(mutations.len());

        for (i, mutation) in mutations.iter().enumerate() {
            Self::fill_path_stack(tree, base_root, &mutation.key, &mut self.path_stacks[i]);

            let leaf_index = if mutation.delete {
                0
            } else {
                let leaf_hash = tree.hasher().hash_leaf(&mutation.key, &mutation.value);
                tree.alloc_node(memory, epoch, Node::new_leaf(leaf_hash, version))?
            };
            self.level.curr.push(LevelEntry {
                key: mutation.key,
                index: leaf_index,
                witness: i as u32,
            });
        }

        for depth in (0..TREE_DEPTH).rev() {
            let mut next = std::mem::take(&mut self.level.next);
            let mut router = SimdRouter::new(tree.hasher());
            let curr = &self.level.curr;
            let stacks = &self.path_stacks;

            let mut i = 0;
            while i < curr.len() {
                let run_start = i;
                i += 1;
                while i < curr.len() && same_prefix(&curr[run_start].key, &curr[i].key, depth) {
                    i += 1;
                }

                let mut has_left = false;
                let mut has_right = false;
                let mut left_index = 0u32;
                let mut right_index = 0u32;
                let mut left_witness = 0u32;
                let mut right_witness = 0u32;
                for entry in &curr[run_start..i] {
                    if bit_at(&entry.key, depth) == 0 {
                        has_left = true;
                        left_index = entry.index;
                        left_witness = entry.witness;
                    } else {
                        has_right = true;
                        right_index = entry.index;
                        right_witness = entry.witness;
                    }
                }

                let mut witness = left_witness;
                if !has_left {
                    witness = right_witness;
                    left_index = stacks[right_witness as usize].sibling[depth];
                }
                if !has_right {
                    right_index = stacks[left_witness as usize].sibling[depth];
                }

                let parent_key = prefix_path(&curr[run_start].key, depth);
                if left_index == 0 && right_index == 0 {
                    // Both sides empty: the subtree collapses to a zero hash.
                    next.push(LevelEntry {
                        key: parent_key,
                        index: 0,
                        witness,
                    });
                    continue;
                }

                let full = router.add(
                    tree.node_hash_at_depth(left_index, depth + 1),
                    tree.node_hash_at_depth(right_index, depth + 1),
                    PendingParent {
                        left_index,
                        right_index,
                        key: parent_key,
                        witness,
                    },
                );
                if full {
                    let (hashes, metas) = router.flush_x4();
                    for k in 0..SIMD_CHUNK_SIZE {
                        let parent = Node::new_internal(
                            hashes[k],
                            version,
                            depth as u16,
                            metas[k].left_index,
                            metas[k].right_index,
                        );
                        let parent_index = tree.alloc_node(memory, epoch, parent)?;
                        next.push(LevelEntry {
                            key: metas[k].key,
                            index: parent_index,
                            witness: metas[k].witness,
                        });
                    }
                }
            }

            // Residual parents go through the scalar path, so the output is
            // independent of where chunk boundaries fell.
            for j in 0..router.count {
                let pair = router.batch[j];
                let meta = router.meta[j];
                let parent_hash = tree.hasher().hash_parent(&pair.left, &pair.right);
                let parent = Node::new_internal(
                    parent_hash,
                    version,
                    depth as u16,
                    meta.left_index,
                    meta.right_index,
                );
                let parent_index = tree.alloc_node(memory, epoch, parent)?;
                next.push(LevelEntry {
                    key: meta.key,
                    index: parent_index,
                    witness: meta.witness,
                });
            }

            self.level.next = next;
            self.level.swap();
        }

        // Depth 0 leaves exactly one entry: the new root, possibly nil.
        match self.level.curr.first() {
            None => Ok((0, tree.hasher().zero_hash(0))),
            Some(entry) => Ok((entry.index, tree.node_hash_at_depth(entry.index, 0))),
        }
    }
}
