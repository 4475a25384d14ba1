// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

use crate::tree::Mutation;

/// Normalizes a mutation batch: sorts by key and collapses duplicate keys to
/// their last occurrence, so the level pass sees each key once, in order.
/// Buffers are reused across commits.
#[derive(Default)]
pub(crate) struct DirtyQueue {
    staged: Vec<Mutation>,
    output: Vec<Mutation>,
}

impl DirtyQueue {
    pub fn normalize(&mut self, mutations: &[Mutation]) -> &[Mutation] {
        self.staged.clear();
        self.output.clear();
        if mutations.is_empty() {
            return &self.output;
        }

        self.staged.extend_from_slice(mutations);
        // Stable sort keeps batch order within a key run, so the last entry
        // of a run is the last write.
        self.staged.sort_by(|a, b| a.key.cmp(&b.key));

        let mut i = 0;
        while i < self.staged.len() {
            let mut j = i + 1;
            while j < self.staged.len() && self.staged[j].key == self.staged[i].key {
                j += 1;
            }
            self.output.push(self.staged[j - 1]);
            i = j;
        }
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use primitive_types::H256;

    fn put(key: u8, value: u8) -> Mutation {
        Mutation {
            key: H256::repeat_byte(key),
            value: H256::repeat_byte(value),
            delete: false,
        }
    }

    #[test]
    fn empty_batch_normalizes_to_empty() {
        let mut queue = DirtyQueue::default();
        assert!(queue.normalize(&[]).is_empty());
    }

    #[test]
    fn sorts_by_key() {
        let mut queue = DirtyQueue::default();
        let normalized = queue.normalize(&[put(9, 1), put(2, 2), put(5, 3)]);
        let keys: Vec<u8> = normalized.iter().map(|m| m.key.as_bytes()[0]).collect();
        assert_eq!(keys, vec![2, 5, 9]);
    }

    #[test]
    fn last_write_wins_within_a_batch() {
        let mut queue = DirtyQueue::default();
        let normalized = queue.normalize(&[put(4, 1), put(7, 9), put(4, 2), put(4, 3)]);
        assert_eq!(normalized.len(), 2);
        assert_eq!(normalized[0].key, H256::repeat_byte(4));
        assert_eq!(normalized[0].value, H256::repeat_byte(3));
        assert_eq!(normalized[1].key, H256::repeat_byte(7));
    }

    #[test]
    fn later_delete_overrides_earlier_put() {
        let mut queue = DirtyQueue::default();
        let batch = [
            put(4, 1),
            Mutation {
                key: H256::repeat_byte(4),
                value: H256::zero(),
                delete: true,
            },
        ];
        let normalized = queue.normalize(&batch);
        assert_eq!(normalized.len(), 1);
        assert!(normalized[0].delete);
    }
}
