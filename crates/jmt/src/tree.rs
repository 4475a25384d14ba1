// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! The tree facade: a single writer commits batches under a mutex while
//! readers resolve proofs lock-free against published snapshots.

use crate::dirty_queue::DirtyQueue;
use crate::epoch::EpochArena;
use crate::error::TreeError;
use crate::hash::{HashEngine, HashStats};
use crate::locator::{LocatorStore, MAX_NODE_INDEX};
use crate::memory::{epoch_ring_size, EpochRing, MemoryManager};
use crate::ring_buffer::RingBuffer;
use crate::updater::BatchUpdater;
use crate::version::{RootRef, Snapshot, SnapshotSlots, VersionControl};
use crossbeam::epoch;
use parking_lot::Mutex;
use primitive_types::H256;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, trace};

pub(crate) const MIN_INITIAL_ARENA_CAPACITY: usize = 1024;
pub(crate) const DEFAULT_RETAIN_VERSIONS: u64 = 8;

const NODE_ESTIMATE_PER_MUTATION: usize = 272;
const NODE_ESTIMATE_BASE: usize = 2048;

/// A single key update. Deletions carry a zero value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub key: H256,
    pub value: H256,
    pub delete: bool,
}

impl Mutation {
    pub fn put(key: H256, value: H256) -> Self {
        Self {
            key,
            value,
            delete: false,
        }
    }

    pub fn delete(key: H256) -> Self {
        Self {
            key,
            value: H256::zero(),
            delete: true,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Node capacity of the first epoch and the warm-pool arenas; clamped to
    /// a sane minimum.
    pub initial_arena_capacity: usize,
    /// How many trailing versions stay reachable; 0 selects the default.
    pub retain_versions: u64,
    /// Key of the hash engine; trees only agree when their keys do.
    pub hash_key: H256,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_arena_capacity: MIN_INITIAL_ARENA_CAPACITY,
            retain_versions: DEFAULT_RETAIN_VERSIONS,
            hash_key: H256::zero(),
        }
    }
}

pub struct StateTree {
    pub(crate) hasher: HashEngine,
    pub(crate) locators: LocatorStore,
    pub(crate) epoch_ring: EpochRing,
    pub(crate) snapshots: SnapshotSlots,
    pub(crate) writer: Mutex<WriterState>,
}

/// Everything only the writer touches, gathered under the writer mutex.
pub(crate) struct WriterState {
    pub memory: MemoryManager,
    pub versions: VersionControl,
    pub dirty: DirtyQueue,
    pub updater: BatchUpdater,
}

impl StateTree {
    pub fn new(config: Config) -> Self {
        let initial_arena_capacity = config
            .initial_arena_capacity
            .max(MIN_INITIAL_ARENA_CAPACITY);
        let retain_versions = if config.retain_versions == 0 {
            DEFAULT_RETAIN_VERSIONS
        } else {
            config.retain_versions
        };

        let hasher = HashEngine::new(config.hash_key);
        let genesis_root = hasher.zero_hash(0);
        let initial_epoch = Arc::new(EpochArena::new(1, initial_arena_capacity));

        let epoch_ring = EpochRing::new(epoch_ring_size(retain_versions));
        epoch_ring.install(&initial_epoch);

        let snapshots = SnapshotSlots::new(Snapshot {
            version: 0,
            epoch_id: initial_epoch.id(),
            root_index: 0,
            root_hash: genesis_root,
        });

        Self {
            hasher,
            locators: LocatorStore::with_default_budget(),
            epoch_ring,
            snapshots,
            writer: Mutex::new(WriterState {
                memory: MemoryManager::new(initial_arena_capacity, initial_epoch),
                versions: VersionControl::new(retain_versions, 1, genesis_root),
                dirty: DirtyQueue::default(),
                updater: BatchUpdater::default(),
            }),
        }
    }

    /// Applies one mutation batch atomically and publishes the new version.
    /// An empty (or fully collapsed) batch returns the current snapshot
    /// without committing.
    pub fn apply_batch(&self, mutations: &[Mutation]) -> Result<Snapshot, TreeError> {
        let mut state = self.writer.lock();
        self.apply_batch_locked(&mut state, mutations)
    }

    fn apply_batch_locked(
        &self,
        state: &mut WriterState,
        mutations: &[Mutation],
    ) -> Result<Snapshot, TreeError> {
        let guard = epoch::pin();
        let current = self.snapshots.load_latest();
        if mutations.is_empty() {
            return Ok(current);
        }

        let WriterState {
            memory,
            versions,
            dirty,
            updater,
        } = state;
        let normalized = dirty.normalize(mutations);
        if normalized.is_empty() {
            return Ok(current);
        }

        let next_version = current.version + 1;
        let mut required = estimate_required_nodes(normalized.len());

        loop {
            let prev_active = memory.active_epoch.clone();
            let (epoch, created_epoch) = match prev_active.as_ref() {
                Some(active) if active.remaining() >= required => (active.clone(), false),
                _ => {
                    let epoch = memory.acquire_epoch(&self.epoch_ring, required);
                    memory.active_epoch = Some(epoch.clone());
                    (epoch, true)
                }
            };
            let head_base = epoch.head();
            let locator_base = memory.next_locator;

            if let Err(err) = self.locators.reserve(locator_base, required as u32) {
                if created_epoch {
                    memory.discard_epoch(&self.epoch_ring, &epoch, &guard);
                    memory.active_epoch = prev_active;
                }
                return Err(err);
            }

            match updater.apply_dirty_paths(
                self,
                memory,
                &epoch,
                current.root_index,
                next_version,
                normalized,
            ) {
                Ok((root_index, root_hash)) => {
                    let snapshot = Snapshot {
                        version: next_version,
                        epoch_id: epoch.id(),
                        root_index,
                        root_hash,
                    };
                    self.snapshots.publish(snapshot, &guard);
                    versions.version_roots.insert(
                        next_version,
                        RootRef {
                            epoch_id: epoch.id(),
                            root_index,
                            root_hash,
                        },
                    );
                    *versions.epoch_refcount.entry(epoch.id()).or_insert(0) += 1;
                    self.reclaim_locked(memory, versions, &guard);
                    trace!(
                        version = next_version,
                        mutations = normalized.len(),
                        "committed batch"
                    );
                    return Ok(snapshot);
                }
                Err(err) => {
                    // No partial visibility: unwind the locator cursor and
                    // the epoch before surfacing or retrying.
                    memory.next_locator = locator_base;
                    if created_epoch {
                        memory.discard_epoch(&self.epoch_ring, &epoch, &guard);
                        memory.active_epoch = prev_active;
                    } else {
                        epoch.truncate(head_base);
                    }
                    if err != TreeError::ArenaFull {
                        return Err(err);
                    }
                    let grown = required
                        .saturating_mul(2)
                        .min(MAX_NODE_INDEX as usize - 1);
                    if grown == required {
                        return Err(TreeError::ArenaFull);
                    }
                    required = grown;
                    debug!(required, "epoch exhausted mid-batch, restarting");
                }
            }
        }
    }

    /// Drains up to `max_batches` batches (0 means until empty) in dequeue
    /// order. Returns the last published snapshot (or the current one when
    /// the queue was empty) and the number of batches applied.
    pub fn drain_mutation_queue(
        &self,
        queue: &RingBuffer<Vec<Mutation>>,
        max_batches: usize,
    ) -> Result<(Snapshot, usize), TreeError> {
        let mut last = None;
        let mut processed = 0;
        while max_batches == 0 || processed < max_batches {
            let Some(batch) = queue.dequeue() else {
                break;
            };
            last = Some(self.apply_batch(&batch)?);
            processed += 1;
        }
        match last {
            Some(snapshot) => Ok((snapshot, processed)),
            None => Ok((self.latest_snapshot(), 0)),
        }
    }

    /// Re-publishes a retained version as the latest; later commits extend
    /// from it, not from the discarded tip.
    pub fn rollback(&self, version: u64) -> Result<Snapshot, TreeError> {
        let mut state = self.writer.lock();
        let guard = epoch::pin();
        let WriterState {
            memory, versions, ..
        } = &mut *state;

        let Some(root) = versions.version_roots.get(&version).copied() else {
            return Err(TreeError::UnknownVersion);
        };
        if !memory.epoch_by_id.contains_key(&root.epoch_id) {
            return Err(TreeError::UnknownVersion);
        }
        let snapshot = Snapshot {
            version,
            epoch_id: root.epoch_id,
            root_index: root.root_index,
            root_hash: root.root_hash,
        };
        self.snapshots.publish(snapshot, &guard);
        debug!(version, "rolled back");
        self.reclaim_locked(memory, versions, &guard);
        Ok(snapshot)
    }

    /// Looks up a retained version without republishing it.
    pub fn snapshot_by_version(&self, version: u64) -> Result<Snapshot, TreeError> {
        let state = self.writer.lock();
        let Some(root) = state.versions.version_roots.get(&version) else {
            return Err(TreeError::UnknownVersion);
        };
        if !state.memory.epoch_by_id.contains_key(&root.epoch_id) {
            return Err(TreeError::UnknownVersion);
        }
        Ok(Snapshot {
            version,
            epoch_id: root.epoch_id,
            root_index: root.root_index,
            root_hash: root.root_hash,
        })
    }

    /// Copies the latest snapshot under a fresh epoch pin, so a concurrently
    /// retired heap snapshot cannot be freed mid-copy.
    pub(crate) fn latest_snapshot(&self) -> Snapshot {
        let _guard = epoch::pin();
        self.snapshots.load_latest()
    }

    pub fn hash_stats(&self) -> HashStats {
        self.hasher.stats()
    }

    /// Fraction of parent hashing that went through the batched path.
    pub fn parent_simd_ratio(&self) -> f64 {
        self.hasher.stats().parent_simd_ratio()
    }

    pub fn hasher(&self) -> &HashEngine {
        &self.hasher
    }
}

/// Conservative node estimate for a normalized batch, clamped to the index
/// space.
fn estimate_required_nodes(mutations: usize) -> usize {
    (mutations * NODE_ESTIMATE_PER_MUTATION + NODE_ESTIMATE_BASE)
        .clamp(2, MAX_NODE_INDEX as usize - 1)
}
