// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Keyed, domain-separated hash engine with a batched parent path.
//!
//! Three domains, each tagged with a distinct leading byte: `'L'` for leaves,
//! `'P'` for parents, `'Z'` for the empty-leaf seed of the zero-hash ladder.
//! The ladder caches the hash of an empty subtree at every depth so a nil
//! child index never forces a recomputation.
//!
//! [`compress_parents_x4`](HashEngine::compress_parents_x4) is the batching
//! contract used by the updater's router: its output is bit-identical to four
//! scalar [`hash_parent`](HashEngine::hash_parent) calls in input order, so
//! batching is an optimization and never a semantic.

use crate::bits::TREE_DEPTH;
use primitive_types::H256;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};

/// Width of one batched parent compression.
pub const SIMD_CHUNK_SIZE: usize = 4;

const LEAF_TAG: u8 = b'L';
const PARENT_TAG: u8 = b'P';
const ZERO_TAG: u8 = b'Z';

/// One pending parent compression: the two child hashes at depth + 1.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ParentPair {
    pub left: H256,
    pub right: H256,
}

/// Point-in-time snapshot of the engine's call counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HashStats {
    pub leaf_calls: u64,
    pub parent_scalar_calls: u64,
    pub parent_x4_batches: u64,
    pub parent_x4_pairs: u64,
    pub accel_calls: u64,
}

impl HashStats {
    /// Fraction of parent work routed through the batched path:
    /// `parent_x4_pairs / (parent_x4_pairs + parent_scalar_calls)`.
    /// Returns 0 when no parent work happened.
    pub fn parent_simd_ratio(&self) -> f64 {
        let denom = self.parent_x4_pairs + self.parent_scalar_calls;
        if denom == 0 {
            return 0.0;
        }
        self.parent_x4_pairs as f64 / denom as f64
    }
}

pub struct HashEngine {
    key: H256,
    zero: [H256; TREE_DEPTH + 1],
    leaf_calls: AtomicU64,
    parent_scalar_calls: AtomicU64,
    parent_x4_batches: AtomicU64,
    parent_x4_pairs: AtomicU64,
    // Bumped only by an accelerated compressor backend; the portable engine
    // never does.
    accel_calls: AtomicU64,
}

impl HashEngine {
    pub fn new(key: H256) -> Self {
        let mut zero = [H256::zero(); TREE_DEPTH + 1];
        let mut seed = Sha256::new();
        seed.update([ZERO_TAG]);
        seed.update(key.as_bytes());
        zero[TREE_DEPTH] = H256::from_slice(&seed.finalize());
        for depth in (0..TREE_DEPTH).rev() {
            zero[depth] = hash_parent_raw(&key, &zero[depth + 1], &zero[depth + 1]);
        }
        Self {
            key,
            zero,
            leaf_calls: AtomicU64::new(0),
            parent_scalar_calls: AtomicU64::new(0),
            parent_x4_batches: AtomicU64::new(0),
            parent_x4_pairs: AtomicU64::new(0),
            accel_calls: AtomicU64::new(0),
        }
    }

    /// Hash of an empty subtree rooted at `depth`. Depths past the leaf level
    /// clamp to the empty-leaf hash.
    #[inline]
    pub fn zero_hash(&self, depth: usize) -> H256 {
        self.zero[depth.min(TREE_DEPTH)]
    }

    pub fn hash_leaf(&self, key: &H256, value: &H256) -> H256 {
        self.leaf_calls.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update([LEAF_TAG]);
        hasher.update(self.key.as_bytes());
        hasher.update(key.as_bytes());
        hasher.update(value.as_bytes());
        H256::from_slice(&hasher.finalize())
    }

    pub fn hash_parent(&self, left: &H256, right: &H256) -> H256 {
        self.parent_scalar_calls.fetch_add(1, Ordering::Relaxed);
        hash_parent_raw(&self.key, left, right)
    }

    /// Compresses four parent pairs at once. Output is bit-identical to four
    /// scalar `hash_parent` calls in input order; only the counters differ.
    pub fn compress_parents_x4(
        &self,
        pairs: &[ParentPair; SIMD_CHUNK_SIZE],
        out: &mut [H256; SIMD_CHUNK_SIZE],
    ) {
        self.parent_x4_batches.fetch_add(1, Ordering::Relaxed);
        self.parent_x4_pairs
            .fetch_add(SIMD_CHUNK_SIZE as u64, Ordering::Relaxed);
        for (slot, pair) in out.iter_mut().zip(pairs.iter()) {
            *slot = hash_parent_raw(&self.key, &pair.left, &pair.right);
        }
    }

    pub fn stats(&self) -> HashStats {
        HashStats {
            leaf_calls: self.leaf_calls.load(Ordering::Relaxed),
            parent_scalar_calls: self.parent_scalar_calls.load(Ordering::Relaxed),
            parent_x4_batches: self.parent_x4_batches.load(Ordering::Relaxed),
            parent_x4_pairs: self.parent_x4_pairs.load(Ordering::Relaxed),
            accel_calls: self.accel_calls.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.leaf_calls.store(0, Ordering::Relaxed);
        self.parent_scalar_calls.store(0, Ordering::Relaxed);
        self.parent_x4_batches.store(0, Ordering::Relaxed);
        self.parent_x4_pairs.store(0, Ordering::Relaxed);
        self.accel_calls.store(0, Ordering::Relaxed);
    }
}

fn hash_parent_raw(engine_key: &H256, left: &H256, right: &H256) -> H256 {
    let mut hasher = Sha256::new();
    hasher.update([PARENT_TAG]);
    hasher.update(engine_key.as_bytes());
    hasher.update(left.as_bytes());
    hasher.update(right.as_bytes());
    H256::from_slice(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(seed: u8) -> H256 {
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = seed.wrapping_add(i as u8);
        }
        H256(out)
    }

    #[test]
    fn zero_ladder_follows_parent_recurrence() {
        let engine = HashEngine::new(word(0x07));
        for depth in 0..TREE_DEPTH {
            let child = engine.zero_hash(depth + 1);
            assert_eq!(engine.zero_hash(depth), engine.hash_parent(&child, &child));
        }
        // Past-the-leaf depths clamp.
        assert_eq!(engine.zero_hash(TREE_DEPTH), engine.zero_hash(4096));
    }

    #[test]
    fn domains_are_separated() {
        let engine = HashEngine::new(word(0x01));
        let (a, b) = (word(0x10), word(0x20));
        assert_ne!(engine.hash_leaf(&a, &b), engine.hash_parent(&a, &b));
        assert_ne!(engine.hash_parent(&a, &b), engine.hash_parent(&b, &a));
    }

    #[test]
    fn keyed_engines_disagree() {
        let left = word(0x31);
        let right = word(0x71);
        let one = HashEngine::new(word(0x01));
        let two = HashEngine::new(word(0x02));
        assert_ne!(one.hash_parent(&left, &right), two.hash_parent(&left, &right));
    }

    #[test]
    fn x4_matches_scalar_bit_for_bit() {
        let engine = HashEngine::new(word(0x42));
        let mut pairs = [ParentPair::default(); SIMD_CHUNK_SIZE];
        for (i, pair) in pairs.iter_mut().enumerate() {
            pair.left = word(i as u8 + 1);
            pair.right = word(i as u8 + 9);
        }
        let mut batched = [H256::zero(); SIMD_CHUNK_SIZE];
        engine.compress_parents_x4(&pairs, &mut batched);
        for (i, pair) in pairs.iter().enumerate() {
            assert_eq!(batched[i], engine.hash_parent(&pair.left, &pair.right));
        }
    }

    #[test]
    fn counters_track_calls_and_reset() {
        let engine = HashEngine::new(H256::zero());
        let (a, b) = (word(1), word(2));
        engine.hash_leaf(&a, &b);
        engine.hash_parent(&a, &b);
        let mut out = [H256::zero(); SIMD_CHUNK_SIZE];
        engine.compress_parents_x4(&[ParentPair::default(); SIMD_CHUNK_SIZE], &mut out);

        let stats = engine.stats();
        assert_eq!(stats.leaf_calls, 1);
        assert_eq!(stats.parent_scalar_calls, 1);
        assert_eq!(stats.parent_x4_batches, 1);
        assert_eq!(stats.parent_x4_pairs, 4);
        assert!((stats.parent_simd_ratio() - 0.8).abs() < 1e-9);

        engine.reset_stats();
        assert_eq!(engine.stats(), HashStats::default());
        assert_eq!(engine.stats().parent_simd_ratio(), 0.0);
    }
}
