// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Snapshot publication and bounded version retention.
//!
//! The latest snapshot is a single atomic pointer. While no reader is active
//! the writer reuses a fixed ring of snapshot cells, so steady-state commits
//! allocate nothing; as soon as a reader is registered the writer falls back
//! to heap-owned snapshots, so no active read transaction can observe a cell
//! being rewritten. Replaced heap snapshots are retired through an epoch-pin
//! guard.
//!
//! Retention keeps version 0 plus the trailing window. Reclamation only runs
//! when `active_readers == 0`; a reader that wins the race with a reclaiming
//! commit merely leaves the old epoch alive one extra cycle.

use crate::memory::{MemoryManager, WARM_POOL_MAX};
use crate::tree::StateTree;
use crossbeam::epoch::Guard;
use primitive_types::H256;
use serde::{Deserialize, Serialize};
use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicPtr, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) const SNAPSHOT_RING_SIZE: u64 = 1024;

/// A published tree state: everything a reader needs to walk one version.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub epoch_id: u64,
    pub root_index: u32,
    pub root_hash: H256,
}

/// Retained root of one version, keyed by version in the writer's tables.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RootRef {
    pub epoch_id: u64,
    pub root_index: u32,
    pub root_hash: H256,
}

/// Writer-owned version bookkeeping; lives behind the writer mutex.
pub(crate) struct VersionControl {
    pub retain_versions: u64,
    pub version_roots: HashMap<u64, RootRef>,
    pub epoch_refcount: HashMap<u64, i64>,
}

impl VersionControl {
    pub fn new(retain_versions: u64, genesis_epoch_id: u64, genesis_root: H256) -> Self {
        Self {
            retain_versions,
            version_roots: HashMap::from([(
                0,
                RootRef {
                    epoch_id: genesis_epoch_id,
                    root_index: 0,
                    root_hash: genesis_root,
                },
            )]),
            epoch_refcount: HashMap::from([(genesis_epoch_id, 1)]),
        }
    }
}

/// Shared snapshot publication state: the reader counter, the latest pointer
/// and the reusable cell ring.
pub(crate) struct SnapshotSlots {
    active_readers: AtomicI64,
    latest: AtomicPtr<Snapshot>,
    ring: Box<[UnsafeCell<Snapshot>]>,
}

// Ring cells are only rewritten by the writer while `active_readers == 0`;
// readers validate the latest pointer around their copy.
unsafe impl Send for SnapshotSlots {}
unsafe impl Sync for SnapshotSlots {}

impl SnapshotSlots {
    pub fn new(genesis: Snapshot) -> Self {
        let ring: Box<[UnsafeCell<Snapshot>]> = (0..SNAPSHOT_RING_SIZE)
            .map(|_| UnsafeCell::new(Snapshot::default()))
            .collect();
        unsafe { *ring[0].get() = genesis };
        let latest = AtomicPtr::new(ring[0].get());
        Self {
            active_readers: AtomicI64::new(0),
            latest,
            ring,
        }
    }

    pub fn reader_enter(&self) {
        self.active_readers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn reader_exit(&self) {
        self.active_readers.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn active_readers(&self) -> i64 {
        self.active_readers.load(Ordering::SeqCst)
    }

    /// Copies the latest snapshot, revalidating the pointer so a copy torn
    /// by a concurrent ring-cell reuse is retried. Callers hold either the
    /// writer lock or an epoch-pin guard, which holds any deferred free of a
    /// heap snapshot the copy may race with.
    pub fn load_latest(&self) -> Snapshot {
        loop {
            let ptr = self.latest.load(Ordering::Acquire);
            let snapshot = unsafe { *ptr };
            if self.latest.load(Ordering::Acquire) == ptr {
                return snapshot;
            }
        }
    }

    /// Writer-only. Publishes `snapshot` with a release store of the latest
    /// pointer; everything written before it (nodes, locators) is visible to
    /// any reader that observes it.
    pub fn publish(&self, snapshot: Snapshot, guard: &Guard) {
        let ptr = if self.active_readers() > 0 {
            Box::into_raw(Box::new(snapshot))
        } else {
            let cell = &self.ring[(snapshot.version % SNAPSHOT_RING_SIZE) as usize];
            unsafe { *cell.get() = snapshot };
            cell.get()
        };
        let prev = self.latest.swap(ptr, Ordering::AcqRel);
        if prev != ptr && !self.in_ring(prev) {
            // A raced reader may still copy through `prev`; retire it past
            // all current pins.
            let retired = unsafe { Box::from_raw(prev) };
            guard.defer(move || drop(retired));
        }
    }

    fn in_ring(&self, ptr: *mut Snapshot) -> bool {
        let start = self.ring.as_ptr() as usize;
        let end = start + self.ring.len() * std::mem::size_of::<UnsafeCell<Snapshot>>();
        (start..end).contains(&(ptr as usize))
    }
}

impl Drop for SnapshotSlots {
    fn drop(&mut self) {
        let ptr = *self.latest.get_mut();
        if !self.in_ring(ptr) {
            drop(unsafe { Box::from_raw(ptr) });
        }
    }
}

impl StateTree {
    /// Drops retired versions and recycles epochs whose refcount hits zero.
    /// Runs only at reader quiescence.
    pub(crate) fn reclaim_locked(
        &self,
        memory: &mut MemoryManager,
        versions: &mut VersionControl,
        guard: &Guard,
    ) {
        if self.snapshots.active_readers() > 0 {
            return;
        }
        let latest = self.snapshots.load_latest();
        let min_keep = latest.version.saturating_sub(versions.retain_versions);

        let stale: Vec<u64> = versions
            .version_roots
            .keys()
            .copied()
            .filter(|&version| version != 0 && version < min_keep)
            .collect();
        for version in stale {
            let Some(root) = versions.version_roots.remove(&version) else {
                continue;
            };
            if let Some(count) = versions.epoch_refcount.get_mut(&root.epoch_id) {
                *count -= 1;
                if *count == 0 {
                    self.recycle_epoch_locked(memory, versions, root.epoch_id, guard);
                }
            }
        }
    }

    fn recycle_epoch_locked(
        &self,
        memory: &mut MemoryManager,
        versions: &mut VersionControl,
        epoch_id: u64,
        guard: &Guard,
    ) {
        let Some(epoch) = memory.epoch_by_id.get(&epoch_id).cloned() else {
            return;
        };
        if memory
            .active_epoch
            .as_ref()
            .is_some_and(|active| Arc::ptr_eq(active, &epoch))
        {
            return;
        }
        // The initial epoch backs version 0 forever.
        if epoch_id == 1 {
            return;
        }

        memory.epoch_by_id.remove(&epoch_id);
        if let Some(position) = memory.epochs.iter().position(|e| Arc::ptr_eq(e, &epoch)) {
            memory.epochs.remove(position);
        }
        versions.epoch_refcount.remove(&epoch_id);
        self.epoch_ring.clear(epoch_id);

        if memory.warm_pool.len() < WARM_POOL_MAX {
            let _ = epoch.reset_for_reuse(0);
            memory.warm_pool.push(epoch);
            debug!(epoch_id, "recycled epoch into warm pool");
        } else {
            epoch.release();
            guard.defer(move || drop(epoch));
            debug!(epoch_id, "released epoch storage");
        }
    }
}
