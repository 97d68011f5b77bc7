//! One-time key pools and key encumbrance.
//!
//! Each device owns a pool of one-time Ed25519 keys. Settling a transaction
//! consumes exactly one key: [`KeyPool::encumber`] checks the key's signature
//! over the transaction hash, flips it to `Encumbered` and records a
//! [`DestructionProof`] binding the key to that transaction. Nothing ever
//! flips a key back.
//!
//! [`KeyPoolManager`] owns every pool behind its own mutex, so all mutations of
//! one device's pool are linearizable while different devices proceed in
//! parallel.

use crate::config::{KeyPoolConfig, SettlementConfig};
use crate::crypto::{blake3_derive, sha256_parts, SignatureVerifier};
use crate::lock::{acquire, ConcurrencyError, Resource};
use crate::serialization::{self, SerializationError};
use crate::types::{
    DeviceId, EncumbranceProofBytes, KeyStatus, ProofType, PublicKeyBytes, SignatureBytes,
    TransactionHash,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

const COMMITMENT_DOMAIN: &[u8] = b"shift/destruction/v1";
const HARDWARE_PROOF_CONTEXT: &str = "shift-core 2024-06 hardware destruction proof v1";

/// Log target for suspected double-spend attempts.
pub const DOUBLE_SPEND_TARGET: &str = "shift_core::double_spend";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncumbranceError {
    #[error("Key index {index} out of range (pool holds {total} keys)")]
    KeyOutOfRange { index: u32, total: u32 },

    #[error("Key {index} already encumbered")]
    KeyAlreadyEncumbered { index: u32 },

    #[error("Hardware signature does not verify under key {index}")]
    SignatureMismatch { index: u32 },

    #[error("Public key does not match pool key {index}")]
    KeyMismatch { index: u32 },

    #[error("Duplicate public key {}", hex::encode(.0))]
    DuplicateKey(PublicKeyBytes),

    #[error("Key pool must contain at least one key")]
    EmptyPool,

    #[error("Pool capacity {capacity} exceeded ({requested} keys requested)")]
    CapacityExceeded { capacity: u32, requested: u64 },

    #[error("No key pool for device {0}")]
    PoolNotFound(DeviceId),

    #[error("Key pool already exists for device {0}")]
    PoolExists(DeviceId),

    #[error("Proof type {0:?} cannot be produced")]
    UnsupportedProofType(ProofType),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
}

impl EncumbranceError {
    /// True for the failure that signals a replayed one-time key.
    pub fn is_double_spend_attempt(&self) -> bool {
        matches!(self, EncumbranceError::KeyAlreadyEncumbered { .. })
    }
}

/// A one-time key slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolKey {
    pub index: u32,
    pub public_key: PublicKeyBytes,
    pub status: KeyStatus,
}

/// Evidence that a key index was encumbered for one specific transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestructionProof {
    pub device_id: DeviceId,
    pub key_index: u32,
    pub public_key: PublicKeyBytes,
    pub transaction_hash: TransactionHash,
    pub proof_type: ProofType,
    /// 32-byte key-encumbrance proof
    pub proof: EncumbranceProofBytes,
    pub timestamp: DateTime<Utc>,
    pub nonce: [u8; 32],
    pub hardware_signature: SignatureBytes,
}

impl DestructionProof {
    fn binding(
        proof_type: ProofType,
        device_id: &DeviceId,
        key_index: u32,
        public_key: &PublicKeyBytes,
        transaction_hash: &TransactionHash,
        nonce: &[u8; 32],
        timestamp: DateTime<Utc>,
    ) -> Option<EncumbranceProofBytes> {
        let index = key_index.to_le_bytes();
        let micros = timestamp.timestamp_micros().to_le_bytes();
        let parts: [&[u8]; 6] = [
            device_id.as_bytes(),
            &index,
            public_key,
            transaction_hash,
            nonce,
            &micros,
        ];
        match proof_type {
            ProofType::CryptographicCommitment => Some(sha256_parts(COMMITMENT_DOMAIN, &parts)),
            ProofType::HardwareAttestation => Some(blake3_derive(HARDWARE_PROOF_CONTEXT, &parts)),
            ProofType::ZeroKnowledge => None,
        }
    }

    /// Check the proof's internal binding and the hardware signature it carries.
    ///
    /// Says nothing about pool state; see [`KeyPoolManager::verify_encumbrance`].
    pub fn verify_binding(&self, verifier: &dyn SignatureVerifier) -> bool {
        let expected = Self::binding(
            self.proof_type,
            &self.device_id,
            self.key_index,
            &self.public_key,
            &self.transaction_hash,
            &self.nonce,
            self.timestamp,
        );
        expected == Some(self.proof)
            && verifier.verify(&self.public_key, &self.transaction_hash, &self.hardware_signature)
    }

    /// Canonical CBOR transport encoding.
    pub fn to_bytes(&self) -> Result<Vec<u8>, SerializationError> {
        serialization::to_canonical_cbor(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SerializationError> {
        serialization::from_canonical_cbor(bytes)
    }
}

/// Counters of a pool at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSummary {
    pub device_id: DeviceId,
    pub capacity: u32,
    pub total_keys: u32,
    pub available_keys: u32,
    pub used_keys: u32,
}

/// A device's one-time key pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPool {
    device_id: DeviceId,
    capacity: u32,
    keys: Vec<PoolKey>,
    encumbrances: BTreeMap<u32, DestructionProof>,
    created_at: DateTime<Utc>,
}

impl KeyPool {
    /// Create a pool with every key `Available`.
    ///
    /// Capacity is `default_capacity`, or the number of keys if more are supplied.
    pub fn new(
        device_id: DeviceId,
        public_keys: Vec<PublicKeyBytes>,
        default_capacity: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, EncumbranceError> {
        if public_keys.is_empty() {
            return Err(EncumbranceError::EmptyPool);
        }
        let count = u32::try_from(public_keys.len()).map_err(|_| EncumbranceError::CapacityExceeded {
            capacity: u32::MAX,
            requested: public_keys.len() as u64,
        })?;
        ensure_distinct(&HashSet::new(), &public_keys)?;

        let keys = public_keys
            .into_iter()
            .zip(0u32..)
            .map(|(public_key, index)| PoolKey {
                index,
                public_key,
                status: KeyStatus::Available,
            })
            .collect();

        Ok(Self {
            device_id,
            capacity: default_capacity.max(count),
            keys,
            encumbrances: BTreeMap::new(),
            created_at: now,
        })
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn total_keys(&self) -> u32 {
        // new() and replenish() keep len() within u32
        self.keys.len() as u32
    }

    pub fn used_keys(&self) -> u32 {
        self.keys
            .iter()
            .filter(|k| k.status == KeyStatus::Encumbered)
            .count() as u32
    }

    pub fn available_keys(&self) -> u32 {
        self.keys
            .iter()
            .filter(|k| k.status == KeyStatus::Available)
            .count() as u32
    }

    pub fn keys(&self) -> &[PoolKey] {
        &self.keys
    }

    pub fn key(&self, index: u32) -> Option<&PoolKey> {
        self.keys.get(index as usize)
    }

    /// Lowest available key index.
    pub fn next_available(&self) -> Option<u32> {
        self.keys
            .iter()
            .find(|k| k.status == KeyStatus::Available)
            .map(|k| k.index)
    }

    pub fn encumbrance(&self, index: u32) -> Option<&DestructionProof> {
        self.encumbrances.get(&index)
    }

    /// Destruction proof recorded for `transaction_hash`, if any key was burned for it.
    pub fn find_encumbrance(&self, transaction_hash: &TransactionHash) -> Option<&DestructionProof> {
        self.encumbrances
            .values()
            .find(|p| &p.transaction_hash == transaction_hash)
    }

    pub fn summary(&self) -> PoolSummary {
        PoolSummary {
            device_id: self.device_id,
            capacity: self.capacity,
            total_keys: self.total_keys(),
            available_keys: self.available_keys(),
            used_keys: self.used_keys(),
        }
    }

    /// Irreversibly retire key `key_index` for `transaction_hash`.
    ///
    /// Checks, in order: index range, key status, stored key equality, then
    /// the hardware signature over the transaction hash. Nothing is mutated
    /// unless all of them pass.
    #[allow(clippy::too_many_arguments)]
    pub fn encumber(
        &mut self,
        key_index: u32,
        public_key: &PublicKeyBytes,
        transaction_hash: &TransactionHash,
        hardware_signature: &SignatureBytes,
        proof_type: ProofType,
        verifier: &dyn SignatureVerifier,
        now: DateTime<Utc>,
    ) -> Result<DestructionProof, EncumbranceError> {
        let total = self.total_keys();
        let key = self
            .keys
            .get_mut(key_index as usize)
            .ok_or(EncumbranceError::KeyOutOfRange {
                index: key_index,
                total,
            })?;

        match key.status {
            KeyStatus::Available => {}
            KeyStatus::Encumbered => {
                return Err(EncumbranceError::KeyAlreadyEncumbered { index: key_index })
            }
        }
        if key.public_key != *public_key {
            return Err(EncumbranceError::KeyMismatch { index: key_index });
        }
        if !verifier.verify(public_key, transaction_hash, hardware_signature) {
            return Err(EncumbranceError::SignatureMismatch { index: key_index });
        }

        let nonce = random_nonce();
        let proof = DestructionProof::binding(
            proof_type,
            &self.device_id,
            key_index,
            public_key,
            transaction_hash,
            &nonce,
            now,
        )
        .ok_or(EncumbranceError::UnsupportedProofType(proof_type))?;

        key.status = KeyStatus::Encumbered;
        let destruction = DestructionProof {
            device_id: self.device_id,
            key_index,
            public_key: *public_key,
            transaction_hash: *transaction_hash,
            proof_type,
            proof,
            timestamp: now,
            nonce,
            hardware_signature: *hardware_signature,
        };
        self.encumbrances.insert(key_index, destruction.clone());
        Ok(destruction)
    }

    /// Append keys, all or nothing.
    pub fn replenish(&mut self, new_keys: Vec<PublicKeyBytes>) -> Result<(), EncumbranceError> {
        let requested = self.keys.len() as u64 + new_keys.len() as u64;
        if requested > u64::from(self.capacity) {
            return Err(EncumbranceError::CapacityExceeded {
                capacity: self.capacity,
                requested,
            });
        }
        let existing: HashSet<PublicKeyBytes> = self.keys.iter().map(|k| k.public_key).collect();
        ensure_distinct(&existing, &new_keys)?;

        let start = self.total_keys();
        self.keys.extend(new_keys.into_iter().zip(start..).map(|(public_key, index)| PoolKey {
            index,
            public_key,
            status: KeyStatus::Available,
        }));
        Ok(())
    }
}

fn ensure_distinct(
    existing: &HashSet<PublicKeyBytes>,
    batch: &[PublicKeyBytes],
) -> Result<(), EncumbranceError> {
    let mut seen = HashSet::with_capacity(batch.len());
    for key in batch {
        if existing.contains(key) || !seen.insert(*key) {
            return Err(EncumbranceError::DuplicateKey(*key));
        }
    }
    Ok(())
}

fn random_nonce() -> [u8; 32] {
    use rand::RngCore;
    let mut nonce = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Registry of key pools, one exclusive section per device.
pub struct KeyPoolManager {
    config: KeyPoolConfig,
    lock_timeout: Duration,
    verifier: Arc<dyn SignatureVerifier>,
    pools: RwLock<HashMap<DeviceId, Arc<Mutex<KeyPool>>>>,
}

impl KeyPoolManager {
    pub fn new(
        config: KeyPoolConfig,
        settlement: &SettlementConfig,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            config,
            lock_timeout: settlement.lock_timeout(),
            verifier,
            pools: RwLock::new(HashMap::new()),
        }
    }

    async fn pool(&self, device_id: &DeviceId) -> Result<Arc<Mutex<KeyPool>>, EncumbranceError> {
        self.pools
            .read()
            .await
            .get(device_id)
            .cloned()
            .ok_or(EncumbranceError::PoolNotFound(*device_id))
    }

    async fn lock(
        &self,
        device_id: &DeviceId,
    ) -> Result<tokio::sync::OwnedMutexGuard<KeyPool>, EncumbranceError> {
        let cell = self.pool(device_id).await?;
        Ok(acquire(&cell, self.lock_timeout, Resource::KeyPool(*device_id)).await?)
    }

    /// Create a device's pool from its one-time public keys.
    pub async fn initialize_pool(
        &self,
        device_id: DeviceId,
        public_keys: Vec<PublicKeyBytes>,
        now: DateTime<Utc>,
    ) -> Result<KeyPool, EncumbranceError> {
        let pool = KeyPool::new(device_id, public_keys, self.config.default_capacity, now)?;

        let mut pools = self.pools.write().await;
        if pools.contains_key(&device_id) {
            return Err(EncumbranceError::PoolExists(device_id));
        }
        pools.insert(device_id, Arc::new(Mutex::new(pool.clone())));

        tracing::info!(
            device = %device_id,
            keys = pool.total_keys(),
            capacity = pool.capacity(),
            "key pool initialized"
        );
        Ok(pool)
    }

    /// Encumber a key using the configured proof type.
    pub async fn encumber_key(
        &self,
        device_id: &DeviceId,
        key_index: u32,
        public_key: &PublicKeyBytes,
        transaction_hash: &TransactionHash,
        hardware_signature: &SignatureBytes,
        now: DateTime<Utc>,
    ) -> Result<DestructionProof, EncumbranceError> {
        let mut pool = self.lock(device_id).await?;
        let result = pool.encumber(
            key_index,
            public_key,
            transaction_hash,
            hardware_signature,
            self.config.proof_type,
            self.verifier.as_ref(),
            now,
        );

        match &result {
            Ok(proof) => tracing::debug!(
                device = %device_id,
                key_index,
                tx = %hex::encode(&transaction_hash[..8]),
                available = pool.available_keys(),
                proof_type = ?proof.proof_type,
                "key encumbered"
            ),
            Err(err) if err.is_double_spend_attempt() => tracing::warn!(
                target: DOUBLE_SPEND_TARGET,
                device = %device_id,
                key_index,
                tx = %hex::encode(&transaction_hash[..8]),
                "encumbered key presented again"
            ),
            Err(err) => tracing::debug!(device = %device_id, key_index, %err, "encumbrance rejected"),
        }
        result
    }

    /// Independently confirm a destruction proof: its binding, its signature,
    /// and that the pool holds the identical record with the key encumbered.
    pub async fn verify_encumbrance(&self, proof: &DestructionProof) -> Result<bool, EncumbranceError> {
        if !proof.verify_binding(self.verifier.as_ref()) {
            return Ok(false);
        }
        let pool = match self.lock(&proof.device_id).await {
            Ok(pool) => pool,
            Err(EncumbranceError::PoolNotFound(_)) => return Ok(false),
            Err(err) => return Err(err),
        };
        let recorded = pool.encumbrance(proof.key_index) == Some(proof);
        let burned = pool
            .key(proof.key_index)
            .is_some_and(|k| k.status == KeyStatus::Encumbered && k.public_key == proof.public_key);
        Ok(recorded && burned)
    }

    /// Append one-time keys to an existing pool.
    pub async fn replenish_pool(
        &self,
        device_id: &DeviceId,
        new_keys: Vec<PublicKeyBytes>,
    ) -> Result<KeyPool, EncumbranceError> {
        let mut pool = self.lock(device_id).await?;
        let added = new_keys.len();
        pool.replenish(new_keys)?;
        tracing::info!(
            device = %device_id,
            added,
            total = pool.total_keys(),
            "key pool replenished"
        );
        Ok(pool.clone())
    }

    pub async fn summary(&self, device_id: &DeviceId) -> Result<PoolSummary, EncumbranceError> {
        Ok(self.lock(device_id).await?.summary())
    }

    /// Point-in-time copy of a pool.
    pub async fn snapshot(&self, device_id: &DeviceId) -> Result<KeyPool, EncumbranceError> {
        Ok(self.lock(device_id).await?.clone())
    }

    pub async fn find_encumbrance(
        &self,
        device_id: &DeviceId,
        transaction_hash: &TransactionHash,
    ) -> Result<Option<DestructionProof>, EncumbranceError> {
        Ok(self.lock(device_id).await?.find_encumbrance(transaction_hash).cloned())
    }

    pub async fn has_available_keys(&self, device_id: &DeviceId) -> Result<bool, EncumbranceError> {
        Ok(self.lock(device_id).await?.next_available().is_some())
    }
}

impl std::fmt::Debug for KeyPoolManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPoolManager")
            .field("config", &self.config)
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}
