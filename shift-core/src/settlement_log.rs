//! Per-channel append-only log of settled transaction hashes.
//!
//! The log's Merkle root is bound into the channel closing message, so both
//! parties sign over exactly which transactions the final balances include.
//! A counterparty holding only the root can check membership with an
//! [`InclusionProof`].

use crate::types::{Hash256, TransactionHash};
use rs_merkle::{algorithms::Sha256, Hasher, MerkleProof, MerkleTree};
use serde::{Deserialize, Serialize};

/// Root of a log with no entries.
pub const EMPTY_ROOT: Hash256 = [0u8; 32];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLog {
    entries: Vec<TransactionHash>,
}

/// Proof that a transaction hash is in a log with a given root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub transaction_hash: TransactionHash,
    pub leaf_index: usize,
    pub leaf_count: usize,
    /// Sibling hashes, rs_merkle byte encoding
    pub proof: Vec<u8>,
}

fn leaf(transaction_hash: &TransactionHash) -> Hash256 {
    Sha256::hash(transaction_hash)
}

impl SettlementLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, transaction_hash: TransactionHash) {
        self.entries.push(transaction_hash);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[TransactionHash] {
        &self.entries
    }

    fn tree(&self) -> MerkleTree<Sha256> {
        let leaves: Vec<Hash256> = self.entries.iter().map(leaf).collect();
        MerkleTree::<Sha256>::from_leaves(&leaves)
    }

    /// Merkle root over all entries, [`EMPTY_ROOT`] when empty.
    pub fn root(&self) -> Hash256 {
        if self.entries.is_empty() {
            return EMPTY_ROOT;
        }
        self.tree().root().unwrap_or(EMPTY_ROOT)
    }

    pub fn inclusion_proof(&self, transaction_hash: &TransactionHash) -> Option<InclusionProof> {
        let leaf_index = self.entries.iter().position(|h| h == transaction_hash)?;
        let proof = self.tree().proof(&[leaf_index]);
        Some(InclusionProof {
            transaction_hash: *transaction_hash,
            leaf_index,
            leaf_count: self.entries.len(),
            proof: proof.to_bytes(),
        })
    }
}

impl InclusionProof {
    /// Check membership against a root the verifier already trusts.
    pub fn verify(&self, root: &Hash256) -> bool {
        let Ok(proof) = MerkleProof::<Sha256>::from_bytes(&self.proof) else {
            return false;
        };
        proof.verify(
            *root,
            &[self.leaf_index],
            &[leaf(&self.transaction_hash)],
            self.leaf_count,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_of(n: u8) -> SettlementLog {
        let mut log = SettlementLog::new();
        for i in 0..n {
            log.append([i; 32]);
        }
        log
    }

    #[test]
    fn test_empty_root() {
        assert_eq!(SettlementLog::new().root(), EMPTY_ROOT);
    }

    #[test]
    fn test_root_depends_on_order() {
        let mut a = SettlementLog::new();
        a.append([1; 32]);
        a.append([2; 32]);
        let mut b = SettlementLog::new();
        b.append([2; 32]);
        b.append([1; 32]);
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_inclusion_proofs_verify() {
        let log = log_of(5);
        let root = log.root();
        for i in 0..5u8 {
            let proof = log.inclusion_proof(&[i; 32]).unwrap();
            assert!(proof.verify(&root), "entry {i}");
        }
    }

    #[test]
    fn test_inclusion_proof_rejects_other_root() {
        let log = log_of(3);
        let proof = log.inclusion_proof(&[1; 32]).unwrap();
        assert!(!proof.verify(&log_of(4).root()));

        let mut forged = proof;
        forged.transaction_hash = [9; 32];
        assert!(!forged.verify(&log.root()));
    }

    #[test]
    fn test_absent_entry_has_no_proof() {
        assert!(log_of(2).inclusion_proof(&[7; 32]).is_none());
    }
}
