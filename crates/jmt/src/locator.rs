// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

//! Two-level directory mapping a global 32-bit node index to
//! `(epoch_id, local_index)`. A flat array of locators would cost ~32 GiB up
//! front; lazily faulted chunks keep the footprint proportional to the
//! working set while the fixed top level allows concurrent lock-free reads.
//!
//! Each entry packs both halves of the locator into a single `AtomicU64`, so
//! a read can never observe a torn pairing of epoch id and local index.

use crate::error::TreeError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

pub(crate) const LOCATOR_CHUNK_SHIFT: u32 = 17;
pub(crate) const LOCATOR_CHUNK_SIZE: usize = 1 << LOCATOR_CHUNK_SHIFT;
pub(crate) const LOCATOR_CHUNK_MASK: u32 = (LOCATOR_CHUNK_SIZE - 1) as u32;

/// `u32::MAX` is reserved, as is index 0; the maximum live index is
/// `u32::MAX - 1`.
pub(crate) const MAX_NODE_INDEX: u32 = u32::MAX;

const LOCATOR_ENTRY_BYTES: usize = 8;
const LOCATOR_TARGET_BYTES: usize = 16 << 30;
const MIN_DIRECTORY_CHUNKS: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct NodeLocator {
    pub epoch_id: u32,
    pub local_index: u32,
}

impl NodeLocator {
    #[inline]
    fn pack(self) -> u64 {
        (self.epoch_id as u64) << 32 | self.local_index as u64
    }

    #[inline]
    fn unpack(raw: u64) -> Self {
        Self {
            epoch_id: (raw >> 32) as u32,
            local_index: raw as u32,
        }
    }
}

struct LocatorChunk {
    entries: Box<[AtomicU64]>,
}

impl LocatorChunk {
    fn new() -> Self {
        Self {
            entries: (0..LOCATOR_CHUNK_SIZE).map(|_| AtomicU64::new(0)).collect(),
        }
    }
}

pub(crate) struct LocatorStore {
    chunks: Box<[OnceLock<LocatorChunk>]>,
}

impl LocatorStore {
    /// Directory sized so the locators can address the default byte budget.
    pub fn with_default_budget() -> Self {
        let chunk_bytes = LOCATOR_CHUNK_SIZE * LOCATOR_ENTRY_BYTES;
        let chunks = (LOCATOR_TARGET_BYTES / chunk_bytes).max(MIN_DIRECTORY_CHUNKS);
        Self::with_chunk_slots(chunks)
    }

    pub fn with_chunk_slots(chunk_slots: usize) -> Self {
        let store = Self {
            chunks: (0..chunk_slots).map(|_| OnceLock::new()).collect(),
        };
        // The first chunk is always hot; fault it up front.
        store.chunks[0].get_or_init(LocatorChunk::new);
        store
    }

    pub fn get(&self, index: u32) -> Option<NodeLocator> {
        let chunk = self
            .chunks
            .get((index >> LOCATOR_CHUNK_SHIFT) as usize)?
            .get()?;
        let raw = chunk.entries[(index & LOCATOR_CHUNK_MASK) as usize].load(Ordering::Acquire);
        let locator = NodeLocator::unpack(raw);
        if locator.local_index == 0 {
            return None;
        }
        Some(locator)
    }

    /// Writer-only. Faults the chunk if absent and publishes the entry.
    pub fn set(&self, index: u32, locator: NodeLocator) -> Result<(), TreeError> {
        let chunk_index = (index >> LOCATOR_CHUNK_SHIFT) as usize;
        let slot = self
            .chunks
            .get(chunk_index)
            .ok_or(TreeError::NodeIndexExhausted)?;
        let chunk = slot.get_or_init(LocatorChunk::new);
        chunk.entries[(index & LOCATOR_CHUNK_MASK) as usize]
            .store(locator.pack(), Ordering::Release);
        Ok(())
    }

    /// Pre-faults every chunk needed for `extra` allocations starting at
    /// `base`, so a commit can fail before touching any entry and roll back
    /// cleanly.
    pub fn reserve(&self, base: u32, extra: u32) -> Result<(), TreeError> {
        if extra == 0 {
            return Ok(());
        }
        let end = base as u64 + extra as u64;
        if end > MAX_NODE_INDEX as u64 {
            return Err(TreeError::NodeIndexExhausted);
        }
        let last_chunk = ((end - 1) >> LOCATOR_CHUNK_SHIFT) as usize;
        if last_chunk >= self.chunks.len() {
            return Err(TreeError::NodeIndexExhausted);
        }
        for slot in &self.chunks[..=last_chunk] {
            slot.get_or_init(LocatorChunk::new);
        }
        Ok(())
    }

    #[cfg(test)]
    fn resident_chunks(&self) -> usize {
        self.chunks.iter().filter(|slot| slot.get().is_some()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locator_packing_round_trips() {
        let locator = NodeLocator {
            epoch_id: 0xdead_beef,
            local_index: 0x0bad_cafe,
        };
        assert_eq!(NodeLocator::unpack(locator.pack()), locator);
    }

    #[test]
    fn empty_and_vacant_entries_read_as_none() {
        let store = LocatorStore::with_chunk_slots(4);
        assert_eq!(store.get(1), None);
        // An untouched chunk is not faulted by reads.
        assert_eq!(store.get((LOCATOR_CHUNK_SIZE + 5) as u32), None);
        assert_eq!(store.resident_chunks(), 1);
    }

    #[test]
    fn set_faults_chunks_lazily() {
        let store = LocatorStore::with_chunk_slots(4);
        let index = (2 * LOCATOR_CHUNK_SIZE + 17) as u32;
        let locator = NodeLocator {
            epoch_id: 7,
            local_index: 42,
        };
        store.set(index, locator).unwrap();
        assert_eq!(store.get(index), Some(locator));
        assert_eq!(store.resident_chunks(), 2);
    }

    #[test]
    fn directory_bounds_are_enforced() {
        let store = LocatorStore::with_chunk_slots(2);
        let out_of_range = (2 * LOCATOR_CHUNK_SIZE) as u32;
        let locator = NodeLocator {
            epoch_id: 1,
            local_index: 1,
        };
        assert_eq!(
            store.set(out_of_range, locator),
            Err(TreeError::NodeIndexExhausted),
        );
        assert_eq!(
            store.reserve(1, 2 * LOCATOR_CHUNK_SIZE as u32),
            Err(TreeError::NodeIndexExhausted),
        );
        assert_eq!(
            store.reserve(MAX_NODE_INDEX - 1, 2),
            Err(TreeError::NodeIndexExhausted),
        );
    }

    #[test]
    fn reserve_prefaults_the_whole_span() {
        let store = LocatorStore::with_chunk_slots(8);
        store
            .reserve(1, (3 * LOCATOR_CHUNK_SIZE) as u32)
            .unwrap();
        assert_eq!(store.resident_chunks(), 4);
        store.reserve(1, 0).unwrap();
    }
}
