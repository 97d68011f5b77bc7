//! Bilateral payment channels.
//!
//! A [`Channel`] holds two balances and the rules that move them. Transfers
//! conserve the channel total; only [`Channel::deposit`] changes it. A channel
//! is closed at final balances both parties sign over, and the closing message
//! binds the root of the channel's settlement log so the signatures also fix
//! which transactions those balances include.
//!
//! ## Status machine
//! ```text
//! Active ──begin_close──▶ Closing ──close / window elapsed──▶ Closed
//!   │                        │
//!   └────────dispute─────────┴──▶ Disputed ──resolve──▶ Active | Closed
//! ```

use crate::config::SettlementConfig;
use crate::crypto::{sha256_parts, SignatureVerifier};
use crate::lock::{acquire, ConcurrencyError, Resource};
use crate::settlement_log::{InclusionProof, SettlementLog};
use crate::types::{
    ChannelId, ChannelStatus, DisputeReason, DisputeStatus, Hash256, PartyId, SignatureBytes,
    TransactionHash, ValidationError,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

const CLOSE_DOMAIN: &[u8] = b"shift/channel-close/v1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("Channel {0} not found")]
    NotFound(ChannelId),

    #[error("Channel {0} already exists")]
    AlreadyExists(ChannelId),

    #[error("Channel {channel} is {status}")]
    WrongStatus {
        channel: ChannelId,
        status: ChannelStatus,
    },

    #[error("Insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance { available: u64, requested: u64 },

    #[error("Final balances total {proposed}, channel holds {current}")]
    ConservationViolation { current: u128, proposed: u128 },

    #[error("{0} is not a party to this channel")]
    NotAParty(PartyId),

    #[error("Amount {amount} exceeds channel limit {limit}")]
    AmountExceedsLimit { amount: u64, limit: u64 },

    #[error("Missing closing signature from party {0}")]
    MissingSignature(Side),

    #[error("Closing signature from party {0} does not verify")]
    InvalidClosingSignature(Side),

    #[error("Balance overflow")]
    BalanceOverflow,

    #[error("A channel needs two distinct parties")]
    SameParty,

    #[error("Invalid channel config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
}

/// Which side of a channel a party sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    A,
    B,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::A => Side::B,
            Side::B => Side::A,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::A => write!(f, "A"),
            Side::B => write!(f, "B"),
        }
    }
}

/// Per-channel parameters fixed at open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long a unilateral close stays open to dispute (seconds)
    pub dispute_timeout_secs: i64,
    /// Idle time after which an active channel starts closing (seconds)
    pub auto_close_timeout_secs: i64,
    pub max_transaction_amount: u64,
    pub require_dual_signatures: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            dispute_timeout_secs: 86_400,
            auto_close_timeout_secs: 604_800,
            max_transaction_amount: 1_000_000_000_000,
            require_dual_signatures: false,
        }
    }
}

impl ChannelConfig {
    fn validate(&self) -> Result<(), ChannelError> {
        if self.dispute_timeout_secs <= 0 || self.auto_close_timeout_secs <= 0 {
            return Err(ChannelError::InvalidConfig("timeouts must be positive".to_string()));
        }
        if self.max_transaction_amount == 0 {
            return Err(ChannelError::InvalidConfig(
                "max_transaction_amount must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Closing signatures over [`Channel::closing_message`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClosingSignatures {
    pub party_a: Option<SignatureBytes>,
    pub party_b: Option<SignatureBytes>,
}

/// What a dispute is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisputeSubject {
    Transaction(TransactionHash),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisputeRecord {
    pub subject: DisputeSubject,
    pub disputer: PartyId,
    pub reason: DisputeReason,
    pub status: DisputeStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Outcome of external arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Resolution {
    /// Dispute upheld, channel resumes
    Reinstate,
    /// Close at arbitrated balances
    Settle { final_a: u64, final_b: u64 },
    /// Dispute rejected, channel resumes
    Dismiss,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub party_a: PartyId,
    pub party_b: PartyId,
    pub balance_a: u64,
    pub balance_b: u64,
    pub config: ChannelConfig,
    pub status: ChannelStatus,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub closing_started_at: Option<DateTime<Utc>>,
    pub transaction_count: u64,
    pub settlement_log: SettlementLog,
    pub dispute: Option<DisputeRecord>,
}

impl Channel {
    /// Open a channel funded entirely by the opener.
    pub fn open(
        channel_id: ChannelId,
        opener: PartyId,
        counterparty: PartyId,
        initial_deposit: u64,
        config: ChannelConfig,
        now: DateTime<Utc>,
    ) -> Result<Self, ChannelError> {
        if opener == counterparty {
            return Err(ChannelError::SameParty);
        }
        config.validate()?;
        Ok(Self {
            channel_id,
            party_a: opener,
            party_b: counterparty,
            balance_a: initial_deposit,
            balance_b: 0,
            config,
            status: ChannelStatus::Active,
            created_at: now,
            last_update: now,
            closing_started_at: None,
            transaction_count: 0,
            settlement_log: SettlementLog::new(),
            dispute: None,
        })
    }

    pub fn side_of(&self, party: &PartyId) -> Option<Side> {
        if *party == self.party_a {
            Some(Side::A)
        } else if *party == self.party_b {
            Some(Side::B)
        } else {
            None
        }
    }

    pub fn party(&self, side: Side) -> PartyId {
        match side {
            Side::A => self.party_a,
            Side::B => self.party_b,
        }
    }

    pub fn balance(&self, side: Side) -> u64 {
        match side {
            Side::A => self.balance_a,
            Side::B => self.balance_b,
        }
    }

    fn balance_mut(&mut self, side: Side) -> &mut u64 {
        match side {
            Side::A => &mut self.balance_a,
            Side::B => &mut self.balance_b,
        }
    }

    pub fn total(&self) -> u128 {
        u128::from(self.balance_a) + u128::from(self.balance_b)
    }

    fn require_party(&self, party: &PartyId) -> Result<Side, ChannelError> {
        self.side_of(party).ok_or(ChannelError::NotAParty(*party))
    }

    fn wrong_status(&self) -> ChannelError {
        ChannelError::WrongStatus {
            channel: self.channel_id,
            status: self.status,
        }
    }

    pub fn settlement_root(&self) -> Hash256 {
        self.settlement_log.root()
    }

    /// Add funds to one side. The only operation that changes the channel total.
    pub fn deposit(&mut self, party: &PartyId, amount: u64, now: DateTime<Utc>) -> Result<(), ChannelError> {
        if amount == 0 {
            return Err(ValidationError::ZeroAmount.into());
        }
        let side = self.require_party(party)?;
        if self.status != ChannelStatus::Active {
            return Err(self.wrong_status());
        }
        let balance = self.balance_mut(side);
        *balance = balance.checked_add(amount).ok_or(ChannelError::BalanceOverflow)?;
        self.last_update = now;
        Ok(())
    }

    /// Check that `from` could send `amount` right now, without mutating.
    pub fn check_transfer(&self, from: Side, amount: u64) -> Result<(), ChannelError> {
        if self.status != ChannelStatus::Active {
            return Err(self.wrong_status());
        }
        if amount > self.config.max_transaction_amount {
            return Err(ChannelError::AmountExceedsLimit {
                amount,
                limit: self.config.max_transaction_amount,
            });
        }
        let available = self.balance(from);
        if available < amount {
            return Err(ChannelError::InsufficientBalance {
                available,
                requested: amount,
            });
        }
        self.balance(from.other())
            .checked_add(amount)
            .ok_or(ChannelError::BalanceOverflow)?;
        Ok(())
    }

    /// Move `amount` from `from` to the other side and log the transaction.
    pub fn apply_transfer(
        &mut self,
        from: Side,
        amount: u64,
        transaction_hash: TransactionHash,
        now: DateTime<Utc>,
    ) -> Result<(), ChannelError> {
        self.check_transfer(from, amount)?;
        *self.balance_mut(from) -= amount;
        *self.balance_mut(from.other()) += amount;
        self.transaction_count += 1;
        self.settlement_log.append(transaction_hash);
        self.last_update = now;
        Ok(())
    }

    /// Message both parties sign to close at `(final_a, final_b)`.
    pub fn closing_message(&self, final_a: u64, final_b: u64) -> Hash256 {
        sha256_parts(
            CLOSE_DOMAIN,
            &[
                self.channel_id.as_bytes(),
                &final_a.to_le_bytes(),
                &final_b.to_le_bytes(),
                &self.settlement_root(),
                &self.transaction_count.to_le_bytes(),
            ],
        )
    }

    fn check_conservation(&self, final_a: u64, final_b: u64) -> Result<(), ChannelError> {
        let proposed = u128::from(final_a) + u128::from(final_b);
        if proposed != self.total() {
            return Err(ChannelError::ConservationViolation {
                current: self.total(),
                proposed,
            });
        }
        Ok(())
    }

    fn check_closing_signatures(
        &self,
        final_a: u64,
        final_b: u64,
        signatures: &ClosingSignatures,
        verifier: &dyn SignatureVerifier,
    ) -> Result<(), ChannelError> {
        let message = self.closing_message(final_a, final_b);
        let mut valid = 0;
        for (side, signature) in [(Side::A, signatures.party_a), (Side::B, signatures.party_b)] {
            match signature {
                Some(signature) => {
                    if !verifier.verify(self.party(side).as_bytes(), &message, &signature) {
                        return Err(ChannelError::InvalidClosingSignature(side));
                    }
                    valid += 1;
                }
                None if self.config.require_dual_signatures => {
                    return Err(ChannelError::MissingSignature(side))
                }
                None => {}
            }
        }
        if valid == 0 {
            return Err(ChannelError::MissingSignature(Side::A));
        }
        Ok(())
    }

    /// Close at signed final balances.
    pub fn close(
        &mut self,
        final_a: u64,
        final_b: u64,
        signatures: &ClosingSignatures,
        verifier: &dyn SignatureVerifier,
        now: DateTime<Utc>,
    ) -> Result<(), ChannelError> {
        match self.status {
            ChannelStatus::Active | ChannelStatus::Closing => {}
            ChannelStatus::Closed | ChannelStatus::Disputed => return Err(self.wrong_status()),
        }
        self.check_conservation(final_a, final_b)?;
        self.check_closing_signatures(final_a, final_b, signatures, verifier)?;

        self.balance_a = final_a;
        self.balance_b = final_b;
        self.status = ChannelStatus::Closed;
        self.last_update = now;
        Ok(())
    }

    /// Start a unilateral close; the dispute window runs from `now`.
    pub fn begin_close(&mut self, party: &PartyId, now: DateTime<Utc>) -> Result<(), ChannelError> {
        self.require_party(party)?;
        if self.status != ChannelStatus::Active {
            return Err(self.wrong_status());
        }
        self.status = ChannelStatus::Closing;
        self.closing_started_at = Some(now);
        self.last_update = now;
        Ok(())
    }

    /// Freeze the channel pending arbitration.
    pub fn dispute(
        &mut self,
        subject: DisputeSubject,
        party: &PartyId,
        reason: DisputeReason,
        now: DateTime<Utc>,
    ) -> Result<(), ChannelError> {
        self.require_party(party)?;
        match (self.status, subject) {
            (ChannelStatus::Active, DisputeSubject::Transaction(_))
            | (ChannelStatus::Closing, _) => {}
            _ => return Err(self.wrong_status()),
        }
        self.status = ChannelStatus::Disputed;
        self.dispute = Some(DisputeRecord {
            subject,
            disputer: *party,
            reason,
            status: DisputeStatus::Open,
            created_at: now,
            resolved_at: None,
        });
        self.last_update = now;
        Ok(())
    }

    /// Record an arbitration outcome.
    pub fn resolve(&mut self, resolution: Resolution, now: DateTime<Utc>) -> Result<(), ChannelError> {
        if self.status != ChannelStatus::Disputed {
            return Err(self.wrong_status());
        }
        let dispute_status = match resolution {
            Resolution::Settle { final_a, final_b } => {
                self.check_conservation(final_a, final_b)?;
                self.balance_a = final_a;
                self.balance_b = final_b;
                self.status = ChannelStatus::Closed;
                DisputeStatus::Resolved
            }
            Resolution::Reinstate => {
                self.status = ChannelStatus::Active;
                self.closing_started_at = None;
                DisputeStatus::Resolved
            }
            Resolution::Dismiss => {
                self.status = ChannelStatus::Active;
                self.closing_started_at = None;
                DisputeStatus::Dismissed
            }
        };
        if let Some(dispute) = self.dispute.as_mut() {
            dispute.status = dispute_status;
            dispute.resolved_at = Some(now);
        }
        self.last_update = now;
        Ok(())
    }

    pub fn close_window_elapsed(&self, now: DateTime<Utc>) -> bool {
        match (self.status, self.closing_started_at) {
            (ChannelStatus::Closing, Some(started)) => {
                window_elapsed(started, self.config.dispute_timeout_secs, now)
            }
            _ => false,
        }
    }

    pub fn is_idle(&self, now: DateTime<Utc>) -> bool {
        self.status == ChannelStatus::Active
            && window_elapsed(self.last_update, self.config.auto_close_timeout_secs, now)
    }
}

/// A window too long to represent never elapses.
fn window_elapsed(since: DateTime<Utc>, secs: i64, now: DateTime<Utc>) -> bool {
    Duration::try_seconds(secs)
        .and_then(|window| since.checked_add_signed(window))
        .is_some_and(|deadline| now >= deadline)
}

/// Identifies an open channel to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub channel_id: ChannelId,
    pub party_a: PartyId,
    pub party_b: PartyId,
}

/// Registry of channels, one exclusive section per channel.
pub struct ChannelLedger {
    lock_timeout: std::time::Duration,
    verifier: Arc<dyn SignatureVerifier>,
    channels: RwLock<HashMap<ChannelId, Arc<Mutex<Channel>>>>,
}

impl ChannelLedger {
    pub fn new(settlement: &SettlementConfig, verifier: Arc<dyn SignatureVerifier>) -> Self {
        Self {
            lock_timeout: settlement.lock_timeout(),
            verifier,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Exclusive access to one channel, bounded by the configured lock timeout.
    pub(crate) async fn lock(&self, channel_id: &ChannelId) -> Result<OwnedMutexGuard<Channel>, ChannelError> {
        let cell = self
            .channels
            .read()
            .await
            .get(channel_id)
            .cloned()
            .ok_or(ChannelError::NotFound(*channel_id))?;
        Ok(acquire(&cell, self.lock_timeout, Resource::Channel(*channel_id)).await?)
    }

    pub async fn open_channel(
        &self,
        channel_id: ChannelId,
        opener: PartyId,
        counterparty: PartyId,
        initial_deposit: u64,
        config: ChannelConfig,
        now: DateTime<Utc>,
    ) -> Result<ChannelHandle, ChannelError> {
        let channel = Channel::open(channel_id, opener, counterparty, initial_deposit, config, now)?;

        let mut channels = self.channels.write().await;
        if channels.contains_key(&channel_id) {
            return Err(ChannelError::AlreadyExists(channel_id));
        }
        channels.insert(channel_id, Arc::new(Mutex::new(channel)));

        tracing::info!(channel = %channel_id, initial_deposit, "channel opened");
        Ok(ChannelHandle {
            channel_id,
            party_a: opener,
            party_b: counterparty,
        })
    }

    pub async fn deposit(
        &self,
        channel_id: &ChannelId,
        party: &PartyId,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<Channel, ChannelError> {
        let mut channel = self.lock(channel_id).await?;
        channel.deposit(party, amount, now)?;
        tracing::debug!(channel = %channel_id, party = %party, amount, "deposit");
        Ok(channel.clone())
    }

    pub async fn begin_close(
        &self,
        channel_id: &ChannelId,
        party: &PartyId,
        now: DateTime<Utc>,
    ) -> Result<Channel, ChannelError> {
        let mut channel = self.lock(channel_id).await?;
        channel.begin_close(party, now)?;
        tracing::info!(channel = %channel_id, party = %party, "channel closing");
        Ok(channel.clone())
    }

    /// Cooperative close at signed final balances.
    pub async fn close_channel(
        &self,
        channel_id: &ChannelId,
        final_a: u64,
        final_b: u64,
        signatures: &ClosingSignatures,
        now: DateTime<Utc>,
    ) -> Result<Channel, ChannelError> {
        let mut channel = self.lock(channel_id).await?;
        if let Err(err) = channel.close(final_a, final_b, signatures, self.verifier.as_ref(), now) {
            tracing::debug!(channel = %channel_id, %err, "close rejected");
            return Err(err);
        }
        tracing::info!(channel = %channel_id, final_a, final_b, "channel closed");
        Ok(channel.clone())
    }

    /// Dispute an in-progress close.
    pub async fn dispute_close(
        &self,
        channel_id: &ChannelId,
        party: &PartyId,
        reason: DisputeReason,
        now: DateTime<Utc>,
    ) -> Result<Channel, ChannelError> {
        let mut channel = self.lock(channel_id).await?;
        channel.dispute(DisputeSubject::Close, party, reason, now)?;
        tracing::warn!(channel = %channel_id, party = %party, ?reason, "close disputed");
        Ok(channel.clone())
    }

    pub async fn resolve_dispute(
        &self,
        channel_id: &ChannelId,
        resolution: Resolution,
        now: DateTime<Utc>,
    ) -> Result<Channel, ChannelError> {
        let mut channel = self.lock(channel_id).await?;
        channel.resolve(resolution, now)?;
        tracing::info!(channel = %channel_id, ?resolution, status = %channel.status, "dispute resolved");
        Ok(channel.clone())
    }

    async fn cells(&self) -> Vec<(ChannelId, Arc<Mutex<Channel>>)> {
        self.channels
            .read()
            .await
            .iter()
            .map(|(id, cell)| (*id, Arc::clone(cell)))
            .collect()
    }

    /// Close every channel whose dispute window has elapsed, at its current balances.
    pub async fn finalize_expired_closes(&self, now: DateTime<Utc>) -> Vec<ChannelId> {
        let mut closed = Vec::new();
        for (channel_id, cell) in self.cells().await {
            let mut channel = match acquire(&cell, self.lock_timeout, Resource::Channel(channel_id)).await {
                Ok(channel) => channel,
                Err(err) => {
                    tracing::debug!(channel = %channel_id, %err, "channel busy, skipped");
                    continue;
                }
            };
            if channel.close_window_elapsed(now) {
                channel.status = ChannelStatus::Closed;
                channel.last_update = now;
                tracing::info!(channel = %channel_id, "dispute window elapsed, channel closed");
                closed.push(channel_id);
            }
        }
        closed
    }

    /// Start closing every channel idle past its auto-close timeout.
    pub async fn sweep_idle(&self, now: DateTime<Utc>) -> Vec<ChannelId> {
        let mut closing = Vec::new();
        for (channel_id, cell) in self.cells().await {
            let mut channel = match acquire(&cell, self.lock_timeout, Resource::Channel(channel_id)).await {
                Ok(channel) => channel,
                Err(err) => {
                    tracing::debug!(channel = %channel_id, %err, "channel busy, skipped");
                    continue;
                }
            };
            if channel.is_idle(now) {
                channel.status = ChannelStatus::Closing;
                channel.closing_started_at = Some(now);
                tracing::info!(channel = %channel_id, "idle channel closing");
                closing.push(channel_id);
            }
        }
        closing
    }

    /// Point-in-time copy of a channel.
    pub async fn channel(&self, channel_id: &ChannelId) -> Result<Channel, ChannelError> {
        Ok(self.lock(channel_id).await?.clone())
    }

    pub async fn settlement_root(&self, channel_id: &ChannelId) -> Result<Hash256, ChannelError> {
        Ok(self.lock(channel_id).await?.settlement_root())
    }

    pub async fn inclusion_proof(
        &self,
        channel_id: &ChannelId,
        transaction_hash: &TransactionHash,
    ) -> Result<Option<InclusionProof>, ChannelError> {
        Ok(self.lock(channel_id).await?.settlement_log.inclusion_proof(transaction_hash))
    }
}

impl fmt::Debug for ChannelLedger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelLedger")
            .field("lock_timeout", &self.lock_timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{Ed25519Verifier, Signer};
    use crate::testing::ts;
    use proptest::prelude::*;

    struct Parties {
        a: Signer,
        b: Signer,
    }

    impl Parties {
        fn new() -> Self {
            Self {
                a: Signer::generate(),
                b: Signer::generate(),
            }
        }

        fn a(&self) -> PartyId {
            PartyId(self.a.public_key())
        }

        fn b(&self) -> PartyId {
            PartyId(self.b.public_key())
        }

        fn sign_close(&self, channel: &Channel, final_a: u64, final_b: u64) -> ClosingSignatures {
            let message = channel.closing_message(final_a, final_b);
            ClosingSignatures {
                party_a: Some(self.a.sign(&message)),
                party_b: Some(self.b.sign(&message)),
            }
        }
    }

    fn ledger() -> ChannelLedger {
        ChannelLedger::new(&SettlementConfig::default(), Arc::new(Ed25519Verifier))
    }

    const CHANNEL: ChannelId = ChannelId([1; 32]);

    async fn funded(ledger: &ChannelLedger, parties: &Parties, config: ChannelConfig) {
        ledger
            .open_channel(CHANNEL, parties.a(), parties.b(), 1_000_000, config, ts(0))
            .await
            .unwrap();
        ledger
            .deposit(&CHANNEL, &parties.b(), 500_000, ts(1))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_open_funds_opener_only() {
        let ledger = ledger();
        let parties = Parties::new();
        ledger
            .open_channel(CHANNEL, parties.a(), parties.b(), 700, ChannelConfig::default(), ts(0))
            .await
            .unwrap();
        let channel = ledger.channel(&CHANNEL).await.unwrap();
        assert_eq!((channel.balance_a, channel.balance_b), (700, 0));
        assert_eq!(channel.status, ChannelStatus::Active);

        let err = ledger
            .open_channel(CHANNEL, parties.a(), parties.b(), 1, ChannelConfig::default(), ts(0))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::AlreadyExists(CHANNEL));
    }

    #[tokio::test]
    async fn test_open_rejects_same_party() {
        let parties = Parties::new();
        let err = ledger()
            .open_channel(CHANNEL, parties.a(), parties.a(), 1, ChannelConfig::default(), ts(0))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::SameParty);
    }

    #[tokio::test]
    async fn test_close_conserves_total() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;

        let channel = ledger.channel(&CHANNEL).await.unwrap();
        let signatures = parties.sign_close(&channel, 1_000_000, 400_000);
        let err = ledger
            .close_channel(&CHANNEL, 1_000_000, 400_000, &signatures, ts(2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChannelError::ConservationViolation {
                current: 1_500_000,
                proposed: 1_400_000
            }
        );
        let after = ledger.channel(&CHANNEL).await.unwrap();
        assert_eq!(after.status, ChannelStatus::Active);
        assert_eq!((after.balance_a, after.balance_b), (1_000_000, 500_000));
    }

    #[tokio::test]
    async fn test_close_with_signatures() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;

        let channel = ledger.channel(&CHANNEL).await.unwrap();
        let signatures = parties.sign_close(&channel, 750_000, 750_000);
        let closed = ledger
            .close_channel(&CHANNEL, 750_000, 750_000, &signatures, ts(2))
            .await
            .unwrap();
        assert_eq!(closed.status, ChannelStatus::Closed);
        assert_eq!((closed.balance_a, closed.balance_b), (750_000, 750_000));

        let err = ledger
            .close_channel(&CHANNEL, 750_000, 750_000, &signatures, ts(3))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::WrongStatus { status: ChannelStatus::Closed, .. }));
    }

    #[tokio::test]
    async fn test_dual_signature_requirement() {
        let ledger = ledger();
        let parties = Parties::new();
        let config = ChannelConfig {
            require_dual_signatures: true,
            ..ChannelConfig::default()
        };
        funded(&ledger, &parties, config).await;

        let channel = ledger.channel(&CHANNEL).await.unwrap();
        let mut signatures = parties.sign_close(&channel, 1_000_000, 500_000);
        signatures.party_b = None;
        let err = ledger
            .close_channel(&CHANNEL, 1_000_000, 500_000, &signatures, ts(2))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::MissingSignature(Side::B));

        // A signature over different balances is rejected
        let mut signatures = parties.sign_close(&channel, 1_000_000, 500_000);
        signatures.party_b = parties.sign_close(&channel, 0, 1_500_000).party_b;
        let err = ledger
            .close_channel(&CHANNEL, 1_000_000, 500_000, &signatures, ts(2))
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::InvalidClosingSignature(Side::B));
    }

    #[tokio::test]
    async fn test_single_signature_suffices_without_dual_requirement() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;
        let channel = ledger.channel(&CHANNEL).await.unwrap();

        let none = ClosingSignatures::default();
        assert!(matches!(
            ledger.close_channel(&CHANNEL, 1_000_000, 500_000, &none, ts(2)).await,
            Err(ChannelError::MissingSignature(_))
        ));

        let mut signatures = parties.sign_close(&channel, 1_000_000, 500_000);
        signatures.party_a = None;
        let closed = ledger
            .close_channel(&CHANNEL, 1_000_000, 500_000, &signatures, ts(2))
            .await
            .unwrap();
        assert_eq!(closed.status, ChannelStatus::Closed);
    }

    #[tokio::test]
    async fn test_closing_message_binds_settlement_log() {
        let parties = Parties::new();
        let mut channel =
            Channel::open(CHANNEL, parties.a(), parties.b(), 100, ChannelConfig::default(), ts(0)).unwrap();
        let before = channel.closing_message(60, 40);
        channel.apply_transfer(Side::A, 40, [5; 32], ts(1)).unwrap();
        assert_ne!(before, channel.closing_message(60, 40));

        let proof = channel.settlement_log.inclusion_proof(&[5; 32]).unwrap();
        assert!(proof.verify(&channel.settlement_root()));
    }

    #[tokio::test]
    async fn test_dispute_blocks_close_until_resolved() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;

        // Only a close in progress can be disputed
        assert!(matches!(
            ledger
                .dispute_close(&CHANNEL, &parties.b(), DisputeReason::FraudulentTransaction, ts(2))
                .await,
            Err(ChannelError::WrongStatus { status: ChannelStatus::Active, .. })
        ));

        ledger.begin_close(&CHANNEL, &parties.a(), ts(2)).await.unwrap();
        let disputed = ledger
            .dispute_close(&CHANNEL, &parties.b(), DisputeReason::FraudulentTransaction, ts(3))
            .await
            .unwrap();
        assert_eq!(disputed.status, ChannelStatus::Disputed);

        let signatures = parties.sign_close(&disputed, 1_000_000, 500_000);
        assert!(matches!(
            ledger
                .close_channel(&CHANNEL, 1_000_000, 500_000, &signatures, ts(4))
                .await,
            Err(ChannelError::WrongStatus { status: ChannelStatus::Disputed, .. })
        ));

        let settled = ledger
            .resolve_dispute(&CHANNEL, Resolution::Settle { final_a: 900_000, final_b: 600_000 }, ts(5))
            .await
            .unwrap();
        assert_eq!(settled.status, ChannelStatus::Closed);
        assert_eq!(settled.balance_b, 600_000);
        let dispute = settled.dispute.unwrap();
        assert_eq!(dispute.status, DisputeStatus::Resolved);
        assert_eq!(dispute.resolved_at, Some(ts(5)));
    }

    #[tokio::test]
    async fn test_dismissed_dispute_reactivates() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;
        ledger.begin_close(&CHANNEL, &parties.a(), ts(2)).await.unwrap();
        ledger
            .dispute_close(&CHANNEL, &parties.b(), DisputeReason::Other, ts(3))
            .await
            .unwrap();

        let channel = ledger
            .resolve_dispute(&CHANNEL, Resolution::Dismiss, ts(4))
            .await
            .unwrap();
        assert_eq!(channel.status, ChannelStatus::Active);
        assert_eq!(channel.closing_started_at, None);
        assert_eq!(channel.dispute.map(|d| d.status), Some(DisputeStatus::Dismissed));
    }

    #[tokio::test]
    async fn test_outsider_cannot_dispute() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;
        ledger.begin_close(&CHANNEL, &parties.a(), ts(2)).await.unwrap();

        let outsider = PartyId([0xee; 32]);
        assert_eq!(
            ledger
                .dispute_close(&CHANNEL, &outsider, DisputeReason::Other, ts(3))
                .await
                .unwrap_err(),
            ChannelError::NotAParty(outsider)
        );
    }

    #[tokio::test]
    async fn test_finalize_after_dispute_window() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;
        ledger.begin_close(&CHANNEL, &parties.a(), ts(100)).await.unwrap();

        assert!(ledger.finalize_expired_closes(ts(100 + 86_399)).await.is_empty());
        assert_eq!(ledger.finalize_expired_closes(ts(100 + 86_400)).await, vec![CHANNEL]);

        let channel = ledger.channel(&CHANNEL).await.unwrap();
        assert_eq!(channel.status, ChannelStatus::Closed);
        assert_eq!((channel.balance_a, channel.balance_b), (1_000_000, 500_000));
    }

    #[tokio::test]
    async fn test_sweep_idle_channels() {
        let ledger = ledger();
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;

        assert!(ledger.sweep_idle(ts(1 + 604_799)).await.is_empty());
        assert_eq!(ledger.sweep_idle(ts(1 + 604_800)).await, vec![CHANNEL]);
        assert_eq!(
            ledger.channel(&CHANNEL).await.unwrap().status,
            ChannelStatus::Closing
        );
    }

    #[tokio::test]
    async fn test_unrepresentable_timeouts_never_elapse() {
        let ledger = ledger();
        let parties = Parties::new();
        let config = ChannelConfig {
            dispute_timeout_secs: i64::MAX,
            auto_close_timeout_secs: i64::MAX,
            ..ChannelConfig::default()
        };
        funded(&ledger, &parties, config).await;

        assert!(ledger.sweep_idle(ts(10)).await.is_empty());
        ledger.begin_close(&CHANNEL, &parties.a(), ts(20)).await.unwrap();
        assert!(ledger.finalize_expired_closes(ts(4_000_000_000)).await.is_empty());
        assert_eq!(
            ledger.channel(&CHANNEL).await.unwrap().status,
            ChannelStatus::Closing
        );
    }

    #[tokio::test]
    async fn test_sweeps_skip_busy_channels() {
        let ledger = ChannelLedger::new(&SettlementConfig { lock_timeout_ms: 20 }, Arc::new(Ed25519Verifier));
        let parties = Parties::new();
        funded(&ledger, &parties, ChannelConfig::default()).await;

        let held = ledger.lock(&CHANNEL).await.unwrap();
        assert!(ledger.sweep_idle(ts(1 + 604_800)).await.is_empty());
        drop(held);
        assert_eq!(ledger.sweep_idle(ts(1 + 604_800)).await, vec![CHANNEL]);
    }

    #[test]
    fn test_transfer_limits() {
        let parties = Parties::new();
        let config = ChannelConfig {
            max_transaction_amount: 50,
            ..ChannelConfig::default()
        };
        let channel = Channel::open(CHANNEL, parties.a(), parties.b(), 100, config, ts(0)).unwrap();
        assert_eq!(
            channel.check_transfer(Side::A, 51),
            Err(ChannelError::AmountExceedsLimit { amount: 51, limit: 50 })
        );
        assert_eq!(
            channel.check_transfer(Side::B, 10),
            Err(ChannelError::InsufficientBalance { available: 0, requested: 10 })
        );
    }

    proptest! {
        #[test]
        fn prop_transfers_conserve_total(
            deposit_a in 0u64..1_000_000,
            deposit_b in 0u64..1_000_000,
            moves in proptest::collection::vec((any::<bool>(), 0u64..300_000), 0..30),
        ) {
            let a = PartyId([1; 32]);
            let b = PartyId([2; 32]);
            let mut channel = Channel::open(CHANNEL, a, b, deposit_a, ChannelConfig::default(), ts(0)).unwrap();
            if deposit_b > 0 {
                channel.deposit(&b, deposit_b, ts(0)).unwrap();
            }
            let total = channel.total();

            for (i, (from_a, amount)) in moves.into_iter().enumerate() {
                let from = if from_a { Side::A } else { Side::B };
                let before = (channel.balance_a, channel.balance_b);
                let result = channel.apply_transfer(from, amount, [i as u8; 32], ts(1));
                if result.is_err() {
                    prop_assert_eq!((channel.balance_a, channel.balance_b), before);
                }
                prop_assert_eq!(channel.total(), total);
            }
        }
    }
}
