// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Epoch bookkeeping: the lock-free epoch ring readers use to resolve a
//! locator to an arena, and the writer-owned tables (active epoch, id map,
//! warm pool) behind the writer mutex.
//!
//! Arenas are `Arc`-owned by the writer tables; the ring only carries raw
//! pointers. Physical destruction is deferred through an epoch-pin guard, so
//! a reader that raced the quiescence check and still holds a ring pointer
//! can never touch freed storage. Logical staleness is handled by the id
//! double-check in [`EpochRing::lookup`].

use crate::epoch::EpochArena;
use crate::error::TreeError;
use crate::locator::{NodeLocator, MAX_NODE_INDEX};
use crate::node::Node;
use crate::tree::StateTree;
use crossbeam::epoch::Guard;
use primitive_types::H256;
use std::collections::HashMap;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) const MIN_EPOCH_RING_SIZE: usize = 1024;
const RETAIN_RING_MULTIPLIER: u64 = 8;

pub(crate) const WARM_POOL_BOOTSTRAP: usize = 3;
pub(crate) const WARM_POOL_MAX: usize = 8;

/// Power-of-two ring size covering at least `retain` epochs with headroom.
pub(crate) fn epoch_ring_size(retain: u64) -> usize {
    let wanted = (retain.saturating_mul(RETAIN_RING_MULTIPLIER) as usize).max(MIN_EPOCH_RING_SIZE);
    wanted.next_power_of_two()
}

struct EpochRingSlot {
    epoch_id: AtomicU64,
    arena: AtomicPtr<EpochArena>,
}

/// Fixed-size array of `(epoch_id, arena)` slots indexed by
/// `epoch_id % len`. Stale slots read `epoch_id == 0`.
pub(crate) struct EpochRing {
    slots: Box<[EpochRingSlot]>,
}

impl EpochRing {
    pub fn new(size: usize) -> Self {
        Self {
            slots: (0..size)
                .map(|_| EpochRingSlot {
                    epoch_id: AtomicU64::new(0),
                    arena: AtomicPtr::new(std::ptr::null_mut()),
                })
                .collect(),
        }
    }

    fn slot(&self, epoch_id: u64) -> &EpochRingSlot {
        &self.slots[(epoch_id % self.slots.len() as u64) as usize]
    }

    /// Writer-only. The arena pointer is published before the id so a reader
    /// that sees the id also sees the pointer.
    pub fn install(&self, arena: &Arc<EpochArena>) {
        let slot = self.slot(arena.id());
        slot.arena
            .store(Arc::as_ptr(arena) as *mut EpochArena, Ordering::Release);
        slot.epoch_id.store(arena.id(), Ordering::Release);
    }

    /// Writer-only. Clears the slot iff it still belongs to `epoch_id`.
    pub fn clear(&self, epoch_id: u64) {
        let slot = self.slot(epoch_id);
        if slot.epoch_id.load(Ordering::Acquire) == epoch_id {
            slot.epoch_id.store(0, Ordering::Release);
            slot.arena.store(std::ptr::null_mut(), Ordering::Release);
        }
    }

    /// Resolves an epoch id to its arena without locking. The id is checked
    /// before and after the arena access to defeat ABA on recycled slots; a
    /// mismatch is a safe "not found".
    ///
    /// Callers must hold either the writer lock or an epoch-pin guard; the
    /// writer defers arena drops past all pins, which keeps the returned
    /// reference alive for the borrow of `self`.
    pub fn lookup(&self, epoch_id: u64) -> Option<&EpochArena> {
        if epoch_id == 0 {
            return None;
        }
        let slot = self.slot(epoch_id);
        if slot.epoch_id.load(Ordering::Acquire) != epoch_id {
            return None;
        }
        let ptr = slot.arena.load(Ordering::Acquire);
        if ptr.is_null() {
            return None;
        }
        let arena = unsafe { &*ptr };
        if arena.is_freed() || arena.id() != epoch_id {
            return None;
        }
        if slot.epoch_id.load(Ordering::Acquire) != epoch_id {
            return None;
        }
        Some(arena)
    }
}

/// Writer-owned epoch and locator bookkeeping; lives behind the writer mutex.
pub(crate) struct MemoryManager {
    pub initial_arena_capacity: usize,

    pub epochs: Vec<Arc<EpochArena>>,
    pub epoch_by_id: HashMap<u64, Arc<EpochArena>>,
    pub active_epoch: Option<Arc<EpochArena>>,
    pub next_epoch_id: u64,

    pub warm_pool: Vec<Arc<EpochArena>>,

    pub next_locator: u32,
}

impl MemoryManager {
    pub fn new(initial_arena_capacity: usize, initial_epoch: Arc<EpochArena>) -> Self {
        let warm_pool = (0..WARM_POOL_BOOTSTRAP)
            .map(|_| Arc::new(EpochArena::new(0, initial_arena_capacity)))
            .collect();
        Self {
            initial_arena_capacity,
            epochs: vec![initial_epoch.clone()],
            epoch_by_id: HashMap::from([(initial_epoch.id(), initial_epoch.clone())]),
            active_epoch: Some(initial_epoch),
            next_epoch_id: 2,
            warm_pool,
            next_locator: 1,
        }
    }

    /// Returns a fresh epoch for a new version and publishes it in the ring.
    pub fn acquire_epoch(&mut self, ring: &EpochRing, capacity: usize) -> Arc<EpochArena> {
        let epoch = self.take_from_pool_or_alloc(capacity);
        self.epochs.push(epoch.clone());
        self.epoch_by_id.insert(epoch.id(), epoch.clone());
        ring.install(&epoch);
        debug!(
            epoch_id = epoch.id(),
            capacity = epoch.capacity(),
            "acquired epoch"
        );
        epoch
    }

    fn take_from_pool_or_alloc(&mut self, capacity: usize) -> Arc<EpochArena> {
        let capacity = capacity.max(self.initial_arena_capacity);
        let id = self.next_epoch_id;
        self.next_epoch_id += 1;

        // A pooled arena must cover the request or it stays pooled.
        if let Some(pooled) = self.warm_pool.last() {
            if pooled.capacity() >= capacity {
                let pooled = self.warm_pool.pop().expect("checked non-empty");
                pooled
                    .reset_for_reuse(id)
                    .expect("warm pool never holds freed arenas");
                return pooled;
            }
        }
        Arc::new(EpochArena::new(id, capacity))
    }

    /// Drops a just-acquired epoch after a failed batch: removes it from all
    /// tables, clears its ring slot and defers the physical drop.
    pub fn discard_epoch(&mut self, ring: &EpochRing, epoch: &Arc<EpochArena>, guard: &Guard) {
        if self
            .active_epoch
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, epoch))
        {
            self.active_epoch = None;
        }
        self.epoch_by_id.remove(&epoch.id());
        if let Some(position) = self.epochs.iter().position(|e| Arc::ptr_eq(e, epoch)) {
            self.epochs.remove(position);
        }
        ring.clear(epoch.id());
        epoch.release();
        let retired = epoch.clone();
        guard.defer(move || drop(retired));
        debug!(epoch_id = epoch.id(), "discarded epoch");
    }
}

impl StateTree {
    /// Allocates `node` into `epoch` and binds it to the next global index.
    pub(crate) fn alloc_node(
        &self,
        memory: &mut MemoryManager,
        epoch: &EpochArena,
        node: Node,
    ) -> Result<u32, TreeError> {
        let local_index = epoch.alloc(node)?;
        let index = memory.next_locator;
        if index == 0 || index == MAX_NODE_INDEX {
            return Err(TreeError::NodeIndexExhausted);
        }
        let epoch_id = epoch.id();
        if epoch_id > u32::MAX as u64 {
            return Err(TreeError::EpochIdOverflow);
        }
        self.locators.set(
            index,
            NodeLocator {
                epoch_id: epoch_id as u32,
                local_index,
            },
        )?;
        memory.next_locator = index + 1;
        Ok(index)
    }

    /// Resolves a global index to its node. Callers hold the writer lock or
    /// an epoch-pin guard (see [`EpochRing::lookup`]).
    pub(crate) fn node_by_index(&self, index: u32) -> Option<Node> {
        if index == 0 {
            return None;
        }
        let locator = self.locators.get(index)?;
        let arena = self.epoch_ring.lookup(locator.epoch_id as u64)?;
        arena.node_at(locator.local_index)
    }

    /// Hash of the subtree referenced by `index` at `depth`; nil or
    /// unresolvable indices fall back to the zero-hash ladder.
    pub(crate) fn node_hash_at_depth(&self, index: u32, depth: usize) -> H256 {
        if index == 0 {
            return self.hasher.zero_hash(depth);
        }
        match self.node_by_index(index) {
            Some(node) => node.hash,
            None => self.hasher.zero_hash(depth),
        }
    }

    /// Faults locator chunks for `nodes` upcoming allocations so measurement
    /// runs are not skewed by first-touch chunk growth.
    pub fn preallocate_locator_chunks(&self, nodes: u32) -> Result<(), TreeError> {
        let state = self.writer.lock();
        self.locators.reserve(state.memory.next_locator, nodes)
    }
}
