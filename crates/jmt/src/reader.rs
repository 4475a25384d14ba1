// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

use crate::bits::{bit_at, TREE_DEPTH};
use crate::proof::MerkleProof;
use crate::tree::StateTree;
use crate::version::Snapshot;
use crossbeam::epoch::{self, Guard};
use primitive_types::H256;

/// A pinned view of one published version.
///
/// Acquiring a transaction registers the reader (which pauses reclamation and
/// snapshot-cell reuse) and pins the current memory epoch (which holds any
/// deferred arena drop). Dropping it releases both; an explicit
/// [`release`](ReadTxn::release) is provided for call sites that want the
/// hand-off visible.
pub struct ReadTxn<'a> {
    tree: &'a StateTree,
    snapshot: Snapshot,
    _guard: Guard,
}

impl StateTree {
    pub fn acquire_latest(&self) -> ReadTxn<'_> {
        self.snapshots.reader_enter();
        let guard = epoch::pin();
        let snapshot = self.snapshots.load_latest();
        ReadTxn {
            tree: self,
            snapshot,
            _guard: guard,
        }
    }

    /// One-shot proof against the latest version.
    pub fn generate_proof_latest(&self, key: &H256) -> MerkleProof {
        self.acquire_latest().generate_proof(key)
    }

    pub fn root_hash(&self) -> H256 {
        self.latest_snapshot().root_hash
    }

    pub fn latest_version(&self) -> u64 {
        self.latest_snapshot().version
    }
}

impl ReadTxn<'_> {
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot
    }

    pub fn version(&self) -> u64 {
        self.snapshot.version
    }

    pub fn root_hash(&self) -> H256 {
        self.snapshot.root_hash
    }

    /// Walks the pinned version from the root and records the sibling hash at
    /// every depth; nil branches take the zero-hash ladder. The landed node
    /// decides existence.
    pub fn generate_proof(&self, key: &H256) -> MerkleProof {
        let hasher = self.tree.hasher();
        let mut siblings = [H256::zero(); TREE_DEPTH];
        let mut current = self.snapshot.root_index;

        for depth in 0..TREE_DEPTH {
            if current == 0 {
                siblings[depth] = hasher.zero_hash(depth + 1);
                continue;
            }
            match self.tree.node_by_index(current) {
                None => {
                    siblings[depth] = hasher.zero_hash(depth + 1);
                    current = 0;
                }
                Some(node) => {
                    if bit_at(key, depth) == 0 {
                        siblings[depth] = self.tree.node_hash_at_depth(node.right_index, depth + 1);
                        current = node.left_index;
                    } else {
                        siblings[depth] = self.tree.node_hash_at_depth(node.left_index, depth + 1);
                        current = node.right_index;
                    }
                }
            }
        }

        if current != 0 {
            if let Some(leaf) = self.tree.node_by_index(current) {
                if leaf.is_leaf() && leaf.depth() as usize == TREE_DEPTH {
                    return MerkleProof {
                        version: self.snapshot.version,
                        exists: true,
                        leaf_hash: leaf.hash,
                        siblings,
                    };
                }
            }
        }
        MerkleProof {
            version: self.snapshot.version,
            exists: false,
            leaf_hash: hasher.zero_hash(TREE_DEPTH),
            siblings,
        }
    }

    /// Unregisters the reader. Equivalent to dropping the transaction.
    pub fn release(self) {}
}

impl Drop for ReadTxn<'_> {
    fn drop(&mut self) {
        self.tree.snapshots.reader_exit();
    }
}
