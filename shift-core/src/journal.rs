//! Write-ahead journal for settlements.
//!
//! Before a key is encumbered the coordinator appends an [`JournalEntry::Intent`]
//! keyed by transaction hash; once balances move it appends `Applied`, and if
//! encumbrance fails it appends `Aborted`. An intent with neither follow-up is
//! what [`crate::TransactionCoordinator::recover`] looks for after a crash.

use crate::channel::Side;
use crate::serialization::{self, SerializationError};
use crate::types::{ChannelId, DeviceId, PublicKeyBytes, SignatureBytes, TransactionHash};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal encoding error: {0}")]
    Encoding(#[from] SerializationError),

    #[error("Journal storage error: {0}")]
    Storage(String),
}

/// Everything needed to finish a settlement after the key is burned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementIntent {
    pub transaction_hash: TransactionHash,
    pub channel_id: ChannelId,
    pub sender_device: DeviceId,
    /// Channel side being debited
    pub debit: Side,
    pub amount: u64,
    pub key_index: u32,
    pub public_key: PublicKeyBytes,
    pub hardware_signature: SignatureBytes,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntry {
    Intent(SettlementIntent),
    Applied { transaction_hash: TransactionHash },
    Aborted { transaction_hash: TransactionHash, reason: String },
}

impl JournalEntry {
    pub fn transaction_hash(&self) -> &TransactionHash {
        match self {
            JournalEntry::Intent(intent) => &intent.transaction_hash,
            JournalEntry::Applied { transaction_hash }
            | JournalEntry::Aborted { transaction_hash, .. } => transaction_hash,
        }
    }
}

/// Durable, append-only settlement journal.
#[async_trait]
pub trait SettlementJournal: Send + Sync {
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError>;

    /// All entries in append order.
    async fn entries(&self) -> Result<Vec<JournalEntry>, JournalError>;
}

/// Intents not yet followed by `Applied` or `Aborted`, in append order.
///
/// A transaction aborted before encumbrance may be retried, so a later intent
/// for the same hash reopens it.
pub fn unresolved_intents(entries: &[JournalEntry]) -> Vec<SettlementIntent> {
    let mut pending: Vec<SettlementIntent> = Vec::new();
    for entry in entries {
        match entry {
            JournalEntry::Intent(intent) => {
                if !pending
                    .iter()
                    .any(|p| p.transaction_hash == intent.transaction_hash)
                {
                    pending.push(intent.clone());
                }
            }
            JournalEntry::Applied { transaction_hash }
            | JournalEntry::Aborted { transaction_hash, .. } => {
                pending.retain(|p| p.transaction_hash != *transaction_hash);
            }
        }
    }
    pending
}

/// In-process journal holding canonical CBOR records.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<Vec<u8>>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl SettlementJournal for MemoryJournal {
    async fn append(&self, entry: JournalEntry) -> Result<(), JournalError> {
        let bytes = serialization::to_canonical_cbor(&entry)?;
        self.records.lock().await.push(bytes);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<JournalEntry>, JournalError> {
        let records = self.records.lock().await;
        records
            .iter()
            .map(|bytes| serialization::from_canonical_cbor(bytes).map_err(JournalError::from))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ts;

    fn intent(tag: u8) -> SettlementIntent {
        SettlementIntent {
            transaction_hash: [tag; 32],
            channel_id: ChannelId([1; 32]),
            sender_device: DeviceId([2; 32]),
            debit: Side::A,
            amount: 10,
            key_index: 0,
            public_key: [3; 32],
            hardware_signature: SignatureBytes([4; 64]),
            recorded_at: ts(0),
        }
    }

    #[tokio::test]
    async fn test_memory_journal_preserves_order() {
        let journal = MemoryJournal::new();
        journal.append(JournalEntry::Intent(intent(1))).await.unwrap();
        journal
            .append(JournalEntry::Applied { transaction_hash: [1; 32] })
            .await
            .unwrap();

        let entries = journal.entries().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0], JournalEntry::Intent(intent(1)));
        assert_eq!(entries[1].transaction_hash(), &[1; 32]);
    }

    #[test]
    fn test_unresolved_intents() {
        let entries = vec![
            JournalEntry::Intent(intent(1)),
            JournalEntry::Intent(intent(2)),
            JournalEntry::Intent(intent(3)),
            JournalEntry::Applied { transaction_hash: [1; 32] },
            JournalEntry::Aborted {
                transaction_hash: [3; 32],
                reason: "no key encumbered".to_string(),
            },
            JournalEntry::Intent(intent(3)),
            JournalEntry::Intent(intent(2)),
        ];
        let pending = unresolved_intents(&entries);
        assert_eq!(pending, vec![intent(2), intent(3)]);
    }
}
