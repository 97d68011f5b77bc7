//! Transaction coordination: device registration, two-phase settlement and
//! crash recovery.
//!
//! ## Settlement
//! [`TransactionCoordinator::prepare_transaction`] records a transfer under its
//! canonical hash without moving funds. [`TransactionCoordinator::execute_transaction`]
//! then, holding the channel's exclusive section for the whole step:
//!
//! 1. returns the cached result if the hash already settled;
//! 2. checks the sender's attestation and the hardware signature;
//! 3. pre-checks the channel transfer;
//! 4. journals an intent, then irreversibly encumbers the one-time key;
//! 5. moves the balances and journals `Applied`.
//!
//! Lock order is channel, then key pool. The transaction and device tables are
//! only held for short critical sections, never across another lock.

use crate::attestation::{AttestationError, AttestationRecord, AttestationVerifier, DeviceCertificate};
use crate::channel::{Channel, ChannelError, ChannelLedger, DisputeSubject, Side};
use crate::config::SettlementConfig;
use crate::crypto::{sha256_parts, SignatureVerifier};
use crate::journal::{unresolved_intents, JournalEntry, JournalError, SettlementIntent, SettlementJournal};
use crate::keypool::{DestructionProof, EncumbranceError, KeyPoolManager};
use crate::lock::ConcurrencyError;
use crate::quote::AttestationQuote;
use crate::types::{
    AttestationProof, ChannelId, ChannelStatus, DeviceId, DisputeReason, HardwareType, PartyId, ProtocolState,
    PublicKeyBytes, RevocationReason, SignatureBytes, TransactionHash, TransactionStatus,
    ValidationError,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

const TRANSACTION_DOMAIN: &[u8] = b"shift/transaction/v1";

fn short(hash: &TransactionHash) -> String {
    hex::encode(&hash[..8])
}

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("Transaction {} not found", short(.0))]
    NotFound(TransactionHash),

    #[error("Transaction {} is {status}", short(.transaction))]
    WrongStatus {
        transaction: TransactionHash,
        status: TransactionStatus,
    },

    #[error("Sender attestation invalid: {0}")]
    AttestationInvalid(#[source] AttestationError),

    #[error("Hardware signature invalid")]
    InvalidHardwareSignature,

    #[error("Device {0} not registered")]
    DeviceNotFound(DeviceId),

    #[error("Device {0} is inactive")]
    DeviceInactive(DeviceId),

    #[error("Device {0} already registered")]
    DeviceAlreadyRegistered(DeviceId),

    #[error("Device {0} has no available one-time keys")]
    InsufficientKeyPool(DeviceId),

    #[error("Recipient device {0} is not owned by the channel counterparty")]
    UnauthorizedRecipient(DeviceId),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Attestation(#[from] AttestationError),

    #[error(transparent)]
    Encumbrance(#[from] EncumbranceError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    #[error(transparent)]
    Journal(#[from] JournalError),
}

impl SettlementError {
    /// Transient contention; retry with the same transaction hash.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SettlementError::Concurrency(_)
                | SettlementError::Encumbrance(EncumbranceError::Concurrency(_))
                | SettlementError::Channel(ChannelError::Concurrency(_))
        )
    }
}

/// A registered signing device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub owner: PartyId,
    pub hardware_type: HardwareType,
    pub attestation: AttestationRecord,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

/// Everything a device presents at registration. Ids are raw bytes and
/// validated here.
#[derive(Debug, Clone)]
pub struct DeviceRegistration {
    pub device_id: Vec<u8>,
    pub owner: PartyId,
    pub hardware_type: HardwareType,
    pub manufacturer_id: Vec<u8>,
    pub quote: AttestationQuote,
    pub certificate: DeviceCertificate,
    pub one_time_keys: Vec<PublicKeyBytes>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub device_id: DeviceId,
    pub owner: PartyId,
    pub attestation_expires_at: DateTime<Utc>,
    pub available_keys: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionHandle {
    pub transaction_hash: TransactionHash,
    pub channel_id: ChannelId,
    pub sender: DeviceId,
    pub recipient: DeviceId,
    pub amount: u64,
}

/// Outcome of a settlement, returned verbatim on replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub transaction_hash: TransactionHash,
    pub channel_id: ChannelId,
    pub amount: u64,
    pub completed_at: DateTime<Utc>,
    pub balance_a: u64,
    pub balance_b: u64,
    pub key_index: u32,
    pub destruction_proof: DestructionProof,
    pub attestation_proof: AttestationProof,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub transaction_hash: TransactionHash,
    pub channel_id: ChannelId,
    pub sender: DeviceId,
    pub recipient: DeviceId,
    pub amount: u64,
    /// Channel side debited, fixed at prepare time
    pub debit: Side,
    pub prepared_at: DateTime<Utc>,
    pub status: TransactionStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub hardware_signature: Option<SignatureBytes>,
    pub failure_reason: Option<String>,
    pub settlement: Option<SettlementResult>,
}

impl Transaction {
    pub fn handle(&self) -> TransactionHandle {
        TransactionHandle {
            transaction_hash: self.transaction_hash,
            channel_id: self.channel_id,
            sender: self.sender,
            recipient: self.recipient,
            amount: self.amount,
        }
    }
}

/// What [`TransactionCoordinator::recover`] did with each unresolved intent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Key was burned, settlement now applied
    pub completed: Vec<TransactionHash>,
    /// Key was burned but the channel could not take the transfer
    pub compensated: Vec<TransactionHash>,
    /// No key was burned; transaction left as it was
    pub aborted: Vec<TransactionHash>,
    /// Settlement had been applied, only the journal lagged
    pub already_applied: Vec<TransactionHash>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
            && self.compensated.is_empty()
            && self.aborted.is_empty()
            && self.already_applied.is_empty()
    }
}

/// Canonical transaction hash; also the idempotency key.
pub fn compute_transaction_hash(
    channel_id: &ChannelId,
    sender: &DeviceId,
    amount: u64,
    recipient: &DeviceId,
    timestamp: DateTime<Utc>,
) -> TransactionHash {
    sha256_parts(
        TRANSACTION_DOMAIN,
        &[
            channel_id.as_bytes(),
            sender.as_bytes(),
            &amount.to_le_bytes(),
            recipient.as_bytes(),
            &timestamp.timestamp_micros().to_le_bytes(),
        ],
    )
}

pub struct TransactionCoordinator {
    config: SettlementConfig,
    verifier: Arc<dyn SignatureVerifier>,
    attestations: Arc<AttestationVerifier>,
    key_pools: Arc<KeyPoolManager>,
    channels: Arc<ChannelLedger>,
    journal: Arc<dyn SettlementJournal>,
    devices: RwLock<HashMap<DeviceId, Device>>,
    transactions: RwLock<HashMap<TransactionHash, Transaction>>,
    state: RwLock<ProtocolState>,
}

impl TransactionCoordinator {
    pub fn new(
        config: SettlementConfig,
        verifier: Arc<dyn SignatureVerifier>,
        attestations: Arc<AttestationVerifier>,
        key_pools: Arc<KeyPoolManager>,
        channels: Arc<ChannelLedger>,
        journal: Arc<dyn SettlementJournal>,
    ) -> Self {
        Self {
            config,
            verifier,
            attestations,
            key_pools,
            channels,
            journal,
            devices: RwLock::new(HashMap::new()),
            transactions: RwLock::new(HashMap::new()),
            state: RwLock::new(ProtocolState::default()),
        }
    }

    pub fn config(&self) -> &SettlementConfig {
        &self.config
    }

    /// Attest a device and create its one-time key pool.
    pub async fn register_device(
        &self,
        registration: DeviceRegistration,
        now: DateTime<Utc>,
    ) -> Result<DeviceHandle, SettlementError> {
        let device_id = DeviceId::try_from(registration.device_id.as_slice())?;
        if self.devices.read().await.contains_key(&device_id) {
            return Err(SettlementError::DeviceAlreadyRegistered(device_id));
        }

        let attestation = self.attestations.create_attestation(
            device_id.as_bytes(),
            &registration.manufacturer_id,
            registration.certificate,
            registration.quote,
            now,
        )?;
        let pool = match self
            .key_pools
            .initialize_pool(device_id, registration.one_time_keys, now)
            .await
        {
            Err(EncumbranceError::PoolExists(id)) => {
                return Err(SettlementError::DeviceAlreadyRegistered(id))
            }
            other => other?,
        };

        let handle = DeviceHandle {
            device_id,
            owner: registration.owner,
            attestation_expires_at: attestation.expires_at,
            available_keys: pool.available_keys(),
        };
        self.devices.write().await.insert(
            device_id,
            Device {
                device_id,
                owner: registration.owner,
                hardware_type: registration.hardware_type,
                attestation,
                active: true,
                registered_at: now,
            },
        );
        self.state.write().await.total_devices += 1;

        tracing::info!(
            device = %device_id,
            owner = %registration.owner,
            hardware = %registration.hardware_type,
            keys = handle.available_keys,
            "device registered"
        );
        Ok(handle)
    }

    /// Revoke a device's attestation and deactivate it. The record is kept.
    pub async fn revoke_device(
        &self,
        device_id: &DeviceId,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> Result<Device, SettlementError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or(SettlementError::DeviceNotFound(*device_id))?;
        device.attestation = self.attestations.revoke(device.attestation.clone(), reason, now);
        device.active = false;
        Ok(device.clone())
    }

    pub async fn refresh_attestation(
        &self,
        device_id: &DeviceId,
        quote: AttestationQuote,
        now: DateTime<Utc>,
    ) -> Result<Device, SettlementError> {
        let mut devices = self.devices.write().await;
        let device = devices
            .get_mut(device_id)
            .ok_or(SettlementError::DeviceNotFound(*device_id))?;
        device.attestation = self
            .attestations
            .refresh(device.attestation.clone(), quote, now)?;
        Ok(device.clone())
    }

    pub async fn device(&self, device_id: &DeviceId) -> Option<Device> {
        self.devices.read().await.get(device_id).cloned()
    }

    pub async fn transaction(&self, transaction_hash: &TransactionHash) -> Option<Transaction> {
        self.transactions.read().await.get(transaction_hash).cloned()
    }

    pub async fn protocol_state(&self) -> ProtocolState {
        *self.state.read().await
    }

    /// Record a transfer from `sender`'s owner to the channel counterparty.
    /// No funds move and no key is consumed; an abandoned prepare costs nothing.
    pub async fn prepare_transaction(
        &self,
        channel_id: ChannelId,
        sender: DeviceId,
        amount: u64,
        recipient_device_id: &[u8],
        now: DateTime<Utc>,
    ) -> Result<TransactionHandle, SettlementError> {
        if amount == 0 {
            return Err(ValidationError::ZeroAmount.into());
        }
        let recipient = DeviceId::try_from(recipient_device_id)?;
        if recipient == sender {
            return Err(ValidationError::SelfTransfer.into());
        }

        let device = self
            .device(&sender)
            .await
            .ok_or(SettlementError::DeviceNotFound(sender))?;
        if !device.active {
            return Err(SettlementError::DeviceInactive(sender));
        }
        if !self.key_pools.has_available_keys(&sender).await? {
            return Err(SettlementError::InsufficientKeyPool(sender));
        }

        let channel = self.channels.channel(&channel_id).await?;
        let debit = channel
            .side_of(&device.owner)
            .ok_or(ChannelError::NotAParty(device.owner))?;
        if channel.status != ChannelStatus::Active {
            return Err(ChannelError::WrongStatus {
                channel: channel_id,
                status: channel.status,
            }
            .into());
        }
        if amount > channel.config.max_transaction_amount {
            return Err(ChannelError::AmountExceedsLimit {
                amount,
                limit: channel.config.max_transaction_amount,
            }
            .into());
        }
        if let Some(recipient_device) = self.device(&recipient).await {
            if recipient_device.owner != channel.party(debit.other()) {
                return Err(SettlementError::UnauthorizedRecipient(recipient));
            }
        }

        let transaction_hash = compute_transaction_hash(&channel_id, &sender, amount, &recipient, now);
        let mut transactions = self.transactions.write().await;
        let transaction = transactions.entry(transaction_hash).or_insert_with(|| {
            tracing::debug!(
                tx = %short(&transaction_hash),
                channel = %channel_id,
                sender = %sender,
                amount,
                "transaction prepared"
            );
            Transaction {
                transaction_hash,
                channel_id,
                sender,
                recipient,
                amount,
                debit,
                prepared_at: now,
                status: TransactionStatus::Prepared,
                completed_at: None,
                hardware_signature: None,
                failure_reason: None,
                settlement: None,
            }
        });
        Ok(transaction.handle())
    }

    /// Settle a prepared transaction. Replaying a settled hash returns the
    /// original result without touching any state.
    pub async fn execute_transaction(
        &self,
        handle: &TransactionHandle,
        hardware_signature: &[u8],
        key_index: u32,
        public_key: &PublicKeyBytes,
        now: DateTime<Utc>,
    ) -> Result<SettlementResult, SettlementError> {
        let hash = handle.transaction_hash;
        let transaction = self
            .transaction(&hash)
            .await
            .ok_or(SettlementError::NotFound(hash))?;
        if let Some(result) = &transaction.settlement {
            tracing::debug!(tx = %short(&hash), "replayed settled transaction");
            return Ok(result.clone());
        }

        let mut channel = self.channels.lock(&transaction.channel_id).await?;

        // Another caller may have settled or failed it while we waited.
        let transaction = self
            .transaction(&hash)
            .await
            .ok_or(SettlementError::NotFound(hash))?;
        if let Some(result) = &transaction.settlement {
            return Ok(result.clone());
        }
        if transaction.status != TransactionStatus::Prepared {
            return Err(SettlementError::WrongStatus {
                transaction: hash,
                status: transaction.status,
            });
        }

        let device = self
            .device(&transaction.sender)
            .await
            .ok_or(SettlementError::DeviceNotFound(transaction.sender))?;
        if let Err(err) = self.attestations.check(&device.attestation, now) {
            tracing::warn!(tx = %short(&hash), device = %device.device_id, %err, "settlement refused");
            self.mark_failed(&hash, format!("attestation: {err}")).await;
            return Err(SettlementError::AttestationInvalid(err));
        }

        let signature = SignatureBytes::try_from(hardware_signature)
            .map_err(|_| SettlementError::InvalidHardwareSignature)?;
        if !self.verifier.verify(public_key, &hash, &signature) {
            return Err(SettlementError::InvalidHardwareSignature);
        }

        channel.check_transfer(transaction.debit, transaction.amount)?;

        self.journal
            .append(JournalEntry::Intent(SettlementIntent {
                transaction_hash: hash,
                channel_id: transaction.channel_id,
                sender_device: transaction.sender,
                debit: transaction.debit,
                amount: transaction.amount,
                key_index,
                public_key: *public_key,
                hardware_signature: signature,
                recorded_at: now,
            }))
            .await?;

        let proof = match self
            .key_pools
            .encumber_key(&transaction.sender, key_index, public_key, &hash, &signature, now)
            .await
        {
            Ok(proof) => proof,
            Err(err) => {
                if !matches!(err, EncumbranceError::Concurrency(_)) {
                    self.mark_failed(&hash, err.to_string()).await;
                }
                self.append_best_effort(JournalEntry::Aborted {
                    transaction_hash: hash,
                    reason: err.to_string(),
                })
                .await;
                return Err(err.into());
            }
        };

        let attestation_proof = AttestationVerifier::attestation_proof(&device.attestation);
        let result = self
            .complete(transaction, &mut channel, proof, attestation_proof, signature, now)
            .await?;
        drop(channel);

        self.append_best_effort(JournalEntry::Applied { transaction_hash: hash })
            .await;
        Ok(result)
    }

    /// Apply the balance change of a transaction whose key is already burned.
    async fn complete(
        &self,
        mut transaction: Transaction,
        channel: &mut Channel,
        proof: DestructionProof,
        attestation_proof: AttestationProof,
        signature: SignatureBytes,
        now: DateTime<Utc>,
    ) -> Result<SettlementResult, SettlementError> {
        let hash = transaction.transaction_hash;
        if let Err(err) = channel.apply_transfer(transaction.debit, transaction.amount, hash, now) {
            tracing::error!(
                tx = %short(&hash),
                device = %transaction.sender,
                key_index = proof.key_index,
                %err,
                "key encumbered but transfer rejected, compensating"
            );
            self.mark_failed(&hash, format!("compensated: {err}")).await;
            self.append_best_effort(JournalEntry::Aborted {
                transaction_hash: hash,
                reason: format!("compensated: {err}"),
            })
            .await;
            return Err(err.into());
        }

        let result = SettlementResult {
            transaction_hash: hash,
            channel_id: transaction.channel_id,
            amount: transaction.amount,
            completed_at: now,
            balance_a: channel.balance_a,
            balance_b: channel.balance_b,
            key_index: proof.key_index,
            destruction_proof: proof,
            attestation_proof,
        };
        transaction.status = TransactionStatus::Completed;
        transaction.completed_at = Some(now);
        transaction.hardware_signature = Some(signature);
        transaction.settlement = Some(result.clone());
        self.transactions.write().await.insert(hash, transaction);
        self.state.write().await.total_transactions += 1;

        tracing::info!(
            tx = %short(&hash),
            channel = %result.channel_id,
            amount = result.amount,
            balance_a = result.balance_a,
            balance_b = result.balance_b,
            "transaction settled"
        );
        Ok(result)
    }

    async fn mark_failed(&self, transaction_hash: &TransactionHash, reason: String) {
        if let Some(transaction) = self.transactions.write().await.get_mut(transaction_hash) {
            if transaction.status == TransactionStatus::Prepared {
                transaction.status = TransactionStatus::Failed;
                transaction.failure_reason = Some(reason);
            }
        }
    }

    async fn append_best_effort(&self, entry: JournalEntry) {
        let hash = *entry.transaction_hash();
        if let Err(err) = self.journal.append(entry).await {
            tracing::warn!(tx = %short(&hash), %err, "journal append failed, recovery will reconcile");
        }
    }

    /// True iff the stored transaction hashes to both arguments and has settled.
    pub async fn verify_transaction(
        &self,
        transaction_hash: &TransactionHash,
        expected_hash: &TransactionHash,
    ) -> bool {
        let Some(transaction) = self.transaction(transaction_hash).await else {
            return false;
        };
        let recomputed = compute_transaction_hash(
            &transaction.channel_id,
            &transaction.sender,
            transaction.amount,
            &transaction.recipient,
            transaction.prepared_at,
        );
        transaction.status == TransactionStatus::Completed
            && recomputed == *transaction_hash
            && recomputed == *expected_hash
    }

    /// Flag a settled transaction; its channel freezes until arbitration.
    pub async fn dispute_transaction(
        &self,
        transaction_hash: &TransactionHash,
        disputer: &PartyId,
        reason: DisputeReason,
        now: DateTime<Utc>,
    ) -> Result<Transaction, SettlementError> {
        let channel_id = self
            .transaction(transaction_hash)
            .await
            .ok_or(SettlementError::NotFound(*transaction_hash))?
            .channel_id;
        let mut channel = self.channels.lock(&channel_id).await?;

        let mut transactions = self.transactions.write().await;
        let transaction = transactions
            .get_mut(transaction_hash)
            .ok_or(SettlementError::NotFound(*transaction_hash))?;
        if transaction.status != TransactionStatus::Completed {
            return Err(SettlementError::WrongStatus {
                transaction: *transaction_hash,
                status: transaction.status,
            });
        }
        channel.dispute(
            DisputeSubject::Transaction(*transaction_hash),
            disputer,
            reason,
            now,
        )?;
        transaction.status = TransactionStatus::Disputed;

        tracing::warn!(
            tx = %short(transaction_hash),
            channel = %channel_id,
            disputer = %disputer,
            ?reason,
            "transaction disputed"
        );
        Ok(transaction.clone())
    }

    /// Reconcile journaled intents that never reached `Applied` or `Aborted`.
    ///
    /// A key burned for an intent always ends with the transfer applied or the
    /// transaction compensated; an intent with no burn is aborted.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<RecoveryReport, SettlementError> {
        let entries = self.journal.entries().await?;
        let mut report = RecoveryReport::default();

        for intent in unresolved_intents(&entries) {
            let hash = intent.transaction_hash;
            let mut channel = match self.channels.lock(&intent.channel_id).await {
                Ok(channel) => Some(channel),
                Err(ChannelError::NotFound(_)) => None,
                Err(err) => return Err(err.into()),
            };

            // Read under the channel lock so a concurrent settlement is seen.
            let transaction = self.transaction(&hash).await;
            if transaction.as_ref().is_some_and(|t| t.settlement.is_some()) {
                self.journal
                    .append(JournalEntry::Applied { transaction_hash: hash })
                    .await?;
                report.already_applied.push(hash);
                continue;
            }

            let Some(proof) = self
                .key_pools
                .find_encumbrance(&intent.sender_device, &hash)
                .await?
            else {
                self.journal
                    .append(JournalEntry::Aborted {
                        transaction_hash: hash,
                        reason: "no key encumbered".to_string(),
                    })
                    .await?;
                tracing::info!(tx = %short(&hash), "recovery: intent aborted, no key burned");
                report.aborted.push(hash);
                continue;
            };

            match (transaction, channel.as_deref_mut()) {
                (Some(transaction), Some(channel)) if transaction.status == TransactionStatus::Prepared => {
                    let device = self
                        .device(&transaction.sender)
                        .await
                        .ok_or(SettlementError::DeviceNotFound(transaction.sender))?;
                    let attestation_proof = AttestationVerifier::attestation_proof(&device.attestation);
                    let signature = proof.hardware_signature;
                    match self
                        .complete(transaction, channel, proof, attestation_proof, signature, now)
                        .await
                    {
                        Ok(_) => {
                            self.journal
                                .append(JournalEntry::Applied { transaction_hash: hash })
                                .await?;
                            tracing::info!(tx = %short(&hash), "recovery: settlement completed");
                            report.completed.push(hash);
                        }
                        // `complete` already journaled the compensation
                        Err(_) => report.compensated.push(hash),
                    }
                }
                (None, Some(channel)) => {
                    match channel.apply_transfer(intent.debit, intent.amount, hash, now) {
                        Ok(()) => {
                            self.state.write().await.total_transactions += 1;
                            self.journal
                                .append(JournalEntry::Applied { transaction_hash: hash })
                                .await?;
                            tracing::warn!(
                                tx = %short(&hash),
                                channel = %intent.channel_id,
                                amount = intent.amount,
                                "recovery: settlement applied from journal, transaction record missing"
                            );
                            report.completed.push(hash);
                        }
                        Err(err) => {
                            self.compensate(&hash, proof.key_index, err.to_string()).await?;
                            report.compensated.push(hash);
                        }
                    }
                }
                (Some(transaction), _) if transaction.status != TransactionStatus::Prepared => {
                    self.compensate(&hash, proof.key_index, format!("transaction {}", transaction.status))
                        .await?;
                    report.compensated.push(hash);
                }
                _ => {
                    self.mark_failed(&hash, "compensated: channel not found".to_string()).await;
                    self.compensate(&hash, proof.key_index, "channel not found".to_string())
                        .await?;
                    report.compensated.push(hash);
                }
            }
        }
        Ok(report)
    }

    /// Record that a burned key will never move funds.
    async fn compensate(
        &self,
        transaction_hash: &TransactionHash,
        key_index: u32,
        reason: String,
    ) -> Result<(), SettlementError> {
        tracing::error!(
            tx = %short(transaction_hash),
            key_index,
            %reason,
            "recovery: key burned for unsettled transaction, compensating"
        );
        self.journal
            .append(JournalEntry::Aborted {
                transaction_hash: *transaction_hash,
                reason: format!("compensated: {reason}"),
            })
            .await?;
        Ok(())
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
