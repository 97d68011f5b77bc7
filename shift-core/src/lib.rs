//! # Shift Core
//!
//! Settlement core for peer-to-peer payment channels backed by attested
//! signing hardware and single-use keys.
//!
//! ## Key Features
//! - **Hardware attestation**: Quotes verified against manufacturer trust roots
//! - **Key encumbrance**: Every one-time key signs exactly one settlement
//! - **Idempotent settlement**: Transaction hash doubles as the replay key
//! - **Crash recovery**: Write-ahead journal reconciles burned keys with balances
//! - **Settlement log**: Per-channel Merkle root bound into closing signatures
//!
//! Components are constructed independently and wired together by the
//! caller; see `demos/settle_transfer.rs`.

pub mod attestation;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod journal;
pub mod keypool;
pub mod lock;
pub mod quote;
pub mod serialization;
pub mod settlement_log;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use attestation::{
    AttestationError, AttestationRecord, AttestationVerifier, DeviceCertificate, Manufacturer,
    ManufacturerRegistry, TrustRoots,
};
pub use channel::{
    Channel, ChannelConfig, ChannelError, ChannelHandle, ChannelLedger, ClosingSignatures,
    Resolution, Side,
};
pub use config::{ConfigError, ShiftConfig};
pub use coordinator::{
    Device, DeviceHandle, DeviceRegistration, RecoveryReport, SettlementError, SettlementResult,
    Transaction, TransactionCoordinator, TransactionHandle,
};
pub use crypto::{Ed25519Verifier, SignatureVerifier, Signer};
pub use journal::{JournalEntry, JournalError, MemoryJournal, SettlementJournal};
pub use keypool::{DestructionProof, EncumbranceError, KeyPool, KeyPoolManager};
pub use lock::ConcurrencyError;
pub use quote::{AttestationQuote, QuoteBuilder};
pub use types::*;
