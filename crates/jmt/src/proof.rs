// Copyright (c) Kanari Network
// SPDX-License-Identifier: Apache-2.0

use crate::bits::{bit_at, TREE_DEPTH};
use crate::hash::HashEngine;
use anyhow::{ensure, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use primitive_types::H256;
use std::io::Read;

/// Encoded size: version + existence byte + leaf hash + 256 siblings.
pub const PROOF_ENCODED_LEN: usize = 8 + 1 + 32 + TREE_DEPTH * 32;

/// A Merkle proof for one key against one version's root.
///
/// `siblings[d]` is the sibling hash at depth `d` of the root-to-leaf walk
/// (so index 0 sits directly under the root). Absence proofs carry
/// `exists == false` and the empty-leaf hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MerkleProof {
    pub version: u64,
    pub exists: bool,
    pub leaf_hash: H256,
    pub siblings: [H256; TREE_DEPTH],
}

impl MerkleProof {
    /// Verifies `(key, value)` against `expected_root`. For an absence proof
    /// the value is ignored and the empty-leaf hash anchors the fold.
    pub fn verify(
        &self,
        hasher: &HashEngine,
        key: &H256,
        value: &H256,
        expected_root: H256,
    ) -> Result<()> {
        if self.exists {
            let leaf_hash = hasher.hash_leaf(key, value);
            ensure!(
                leaf_hash == self.leaf_hash,
                "leaf hash mismatch: computed {:x}, proof carries {:x}",
                leaf_hash,
                self.leaf_hash,
            );
            self.fold_to_root(hasher, key, leaf_hash, expected_root)
        } else {
            self.fold_to_root(hasher, key, hasher.zero_hash(TREE_DEPTH), expected_root)
        }
    }

    /// Verifies from a precomputed leaf hash, for callers that already hold
    /// it and do not want to re-hash the value.
    pub fn verify_leaf_hash(
        &self,
        hasher: &HashEngine,
        key: &H256,
        leaf_hash: H256,
        expected_root: H256,
    ) -> Result<()> {
        if self.exists {
            ensure!(
                leaf_hash == self.leaf_hash,
                "leaf hash mismatch: given {:x}, proof carries {:x}",
                leaf_hash,
                self.leaf_hash,
            );
        }
        self.fold_to_root(hasher, key, leaf_hash, expected_root)
    }

    fn fold_to_root(
        &self,
        hasher: &HashEngine,
        key: &H256,
        leaf_hash: H256,
        expected_root: H256,
    ) -> Result<()> {
        let mut current = leaf_hash;
        for depth in (0..TREE_DEPTH).rev() {
            let sibling = self.siblings[depth];
            current = if bit_at(key, depth) == 0 {
                hasher.hash_parent(&current, &sibling)
            } else {
                hasher.hash_parent(&sibling, &current)
            };
        }
        ensure!(
            current == expected_root,
            "root hash mismatch: computed {:x}, expected {:x}",
            current,
            expected_root,
        );
        Ok(())
    }

    /// Fixed-layout little-endian encoding, stable across implementations.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PROOF_ENCODED_LEN);
        out.write_u64::<LittleEndian>(self.version)
            .expect("vec write cannot fail");
        out.write_u8(self.exists as u8).expect("vec write cannot fail");
        out.extend_from_slice(self.leaf_hash.as_bytes());
        for sibling in &self.siblings {
            out.extend_from_slice(sibling.as_bytes());
        }
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        ensure!(
            data.len() == PROOF_ENCODED_LEN,
            "proof must be {} bytes, got {}",
            PROOF_ENCODED_LEN,
            data.len(),
        );
        let mut reader = data;
        let version = reader.read_u64::<LittleEndian>()?;
        let exists = match reader.read_u8()? {
            0 => false,
            1 => true,
            other => anyhow::bail!("invalid existence byte: {}", other),
        };
        let mut word = [0u8; 32];
        reader.read_exact(&mut word)?;
        let leaf_hash = H256(word);
        let mut siblings = [H256::zero(); TREE_DEPTH];
        for sibling in &mut siblings {
            reader.read_exact(&mut word)?;
            *sibling = H256(word);
        }
        Ok(Self {
            version,
            exists,
            leaf_hash,
            siblings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;

    static ENGINE: Lazy<HashEngine> = Lazy::new(|| HashEngine::new(H256::repeat_byte(0x5a)));

    /// Builds a proof for `key` in a tree whose only content is `(key, value)`.
    fn single_leaf_proof(key: &H256, value: &H256) -> (MerkleProof, H256) {
        let leaf_hash = ENGINE.hash_leaf(key, value);
        let mut siblings = [H256::zero(); TREE_DEPTH];
        for (depth, sibling) in siblings.iter_mut().enumerate() {
            *sibling = ENGINE.zero_hash(depth + 1);
        }
        let mut root = leaf_hash;
        for depth in (0..TREE_DEPTH).rev() {
            let sibling = siblings[depth];
            root = if bit_at(key, depth) == 0 {
                ENGINE.hash_parent(&root, &sibling)
            } else {
                ENGINE.hash_parent(&sibling, &root)
            };
        }
        (
            MerkleProof {
                version: 1,
                exists: true,
                leaf_hash,
                siblings,
            },
            root,
        )
    }

    #[test]
    fn accepts_matching_leaf_and_rejects_tampering() {
        let key = H256::repeat_byte(0x11);
        let value = H256::repeat_byte(0x22);
        let (proof, root) = single_leaf_proof(&key, &value);

        assert!(proof.verify(&ENGINE, &key, &value, root).is_ok());
        assert!(proof
            .verify(&ENGINE, &key, &H256::repeat_byte(0x23), root)
            .is_err());
        assert!(proof
            .verify(&ENGINE, &key, &value, H256::repeat_byte(0x01))
            .is_err());

        let mut tampered = proof.clone();
        tampered.siblings[17] = H256::repeat_byte(0x99);
        assert!(tampered.verify(&ENGINE, &key, &value, root).is_err());
    }

    #[test]
    fn absence_proof_folds_from_empty_leaf() {
        let key = H256::repeat_byte(0x31);
        let mut siblings = [H256::zero(); TREE_DEPTH];
        for (depth, sibling) in siblings.iter_mut().enumerate() {
            *sibling = ENGINE.zero_hash(depth + 1);
        }
        let proof = MerkleProof {
            version: 0,
            exists: false,
            leaf_hash: ENGINE.zero_hash(TREE_DEPTH),
            siblings,
        };
        // The empty tree's root is the depth-0 rung of the ladder.
        assert!(proof
            .verify(&ENGINE, &key, &H256::zero(), ENGINE.zero_hash(0))
            .is_ok());
    }

    #[test]
    fn verify_leaf_hash_skips_value_hashing() {
        let key = H256::repeat_byte(0x44);
        let value = H256::repeat_byte(0x55);
        let (proof, root) = single_leaf_proof(&key, &value);
        let leaf_hash = ENGINE.hash_leaf(&key, &value);
        assert!(proof.verify_leaf_hash(&ENGINE, &key, leaf_hash, root).is_ok());
        assert!(proof
            .verify_leaf_hash(&ENGINE, &key, H256::repeat_byte(0x66), root)
            .is_err());
    }

    #[test]
    fn wire_format_is_fixed_layout() {
        let key = H256::repeat_byte(0x12);
        let value = H256::repeat_byte(0x34);
        let (proof, _) = single_leaf_proof(&key, &value);

        let encoded = proof.encode();
        assert_eq!(encoded.len(), PROOF_ENCODED_LEN);
        assert_eq!(encoded[..8], 1u64.to_le_bytes());
        assert_eq!(encoded[8], 1);
        assert_eq!(&encoded[9..41], proof.leaf_hash.as_bytes());
        assert_eq!(MerkleProof::decode(&encoded).unwrap(), proof);

        assert!(MerkleProof::decode(&encoded[1..]).is_err());
        let mut bad_flag = encoded;
        bad_flag[8] = 7;
        assert!(MerkleProof::decode(&bad_flag).is_err());
    }
}
