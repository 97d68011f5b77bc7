//! Core types shared by the attestation, encumbrance and settlement layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// SHA-256 hash (32 bytes)
pub type Hash256 = [u8; 32];

/// Canonical transaction hash, also the idempotency key of a settlement.
pub type TransactionHash = Hash256;

/// Ed25519 public key bytes of a one-time or hardware key.
pub type PublicKeyBytes = [u8; 32];

/// Key-encumbrance proof (32 bytes)
pub type EncumbranceProofBytes = [u8; 32];

/// Length of every identifier in the protocol.
pub const ID_LEN: usize = 32;

/// Length of a hardware signature.
pub const SIGNATURE_LEN: usize = 64;

/// Length of an attestation proof.
pub const ATTESTATION_PROOF_LEN: usize = 128;

/// Boundary validation failures. Nothing is mutated when one of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field} must be {expected} bytes, got {actual}")]
    InvalidLength {
        field: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Amount must be greater than zero")]
    ZeroAmount,

    #[error("Sender and recipient device must differ")]
    SelfTransfer,

    #[error("Quote carries no measurements")]
    EmptyMeasurements,

    #[error("Quote carries {actual} measurements, at most {max} allowed")]
    TooManyMeasurements { max: usize, actual: usize },

    #[error("Unsupported quote version {0}")]
    UnsupportedQuoteVersion(u32),
}

/// Copy a slice into a fixed-size array, reporting the offending field.
pub fn fixed_bytes<const N: usize>(
    field: &'static str,
    bytes: &[u8],
) -> Result<[u8; N], ValidationError> {
    bytes.try_into().map_err(|_| ValidationError::InvalidLength {
        field,
        expected: N,
        actual: bytes.len(),
    })
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $field:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; ID_LEN]);

        impl $name {
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl From<[u8; ID_LEN]> for $name {
            fn from(bytes: [u8; ID_LEN]) -> Self {
                $name(bytes)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = ValidationError;

            fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
                fixed_bytes($field, bytes).map($name)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", hex::encode(&self.0[..8]))
            }
        }
    };
}

define_id!(
    /// Hardware device identifier (globally unique)
    DeviceId,
    "device_id"
);
define_id!(
    /// Hardware manufacturer identifier
    ManufacturerId,
    "manufacturer_id"
);
define_id!(
    /// Payment channel identifier
    ChannelId,
    "channel_id"
);
define_id!(
    /// Account identity of a channel party; doubles as the party's Ed25519 public key.
    PartyId,
    "party_id"
);

/// Ed25519 signature (64 bytes) - wrapped for Serde support
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureBytes(#[serde(with = "serde_arrays")] pub [u8; SIGNATURE_LEN]);

impl From<[u8; SIGNATURE_LEN]> for SignatureBytes {
    fn from(bytes: [u8; SIGNATURE_LEN]) -> Self {
        SignatureBytes(bytes)
    }
}

impl TryFrom<&[u8]> for SignatureBytes {
    type Error = ValidationError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        fixed_bytes("hardware_signature", bytes).map(SignatureBytes)
    }
}

impl AsRef<[u8; SIGNATURE_LEN]> for SignatureBytes {
    fn as_ref(&self) -> &[u8; SIGNATURE_LEN] {
        &self.0
    }
}

/// Attestation proof (128 bytes) handed to counterparties alongside a settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationProof(#[serde(with = "serde_arrays")] pub [u8; ATTESTATION_PROOF_LEN]);

impl AsRef<[u8]> for AttestationProof {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

// Serde support for arrays longer than 32 elements
pub(crate) mod serde_arrays {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<const N: usize, S: Serializer>(
        bytes: &[u8; N],
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        bytes.as_slice().serialize(serializer)
    }

    pub fn deserialize<'de, const N: usize, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<[u8; N], D::Error> {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let len = bytes.len();
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom(format!("expected {} bytes, got {}", N, len)))
    }
}

/// Kind of signing hardware behind a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareType {
    /// Purpose-built Shift signing device
    ShiftDevice,
    /// Ledger-class secure element wallet
    LedgerV2,
    /// Generic TEE (SGX, TrustZone, ...)
    TrustedExecutionEnvironment,
}

impl fmt::Display for HardwareType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareType::ShiftDevice => write!(f, "Shift-Device"),
            HardwareType::LedgerV2 => write!(f, "Ledger-V2"),
            HardwareType::TrustedExecutionEnvironment => write!(f, "TEE"),
        }
    }
}

/// Lifecycle status of an attestation record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttestationStatus {
    Valid,
    Expired,
    Revoked,
    Pending,
}

impl AttestationStatus {
    /// Allowed transitions: Pending -> Valid, Valid -> Expired, and anything -> Revoked.
    /// Revoked is terminal; re-revoking is a no-op.
    pub fn can_transition_to(self, next: AttestationStatus) -> bool {
        use AttestationStatus::*;
        match (self, next) {
            (Revoked, Revoked) => true,
            (Revoked, _) => false,
            (_, Revoked) => true,
            (Pending, Valid) => true,
            (Valid, Expired) => true,
            (Pending, Pending) | (Valid, Valid) | (Expired, Expired) => true,
            (Pending, Expired) | (Valid, Pending) | (Expired, Valid) | (Expired, Pending) => false,
        }
    }
}

impl fmt::Display for AttestationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttestationStatus::Valid => write!(f, "valid"),
            AttestationStatus::Expired => write!(f, "expired"),
            AttestationStatus::Revoked => write!(f, "revoked"),
            AttestationStatus::Pending => write!(f, "pending"),
        }
    }
}

/// Why an attestation was revoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Compromised,
    Expired,
    ManufacturerRevoked,
    UserRequested,
    Other,
}

/// How a destruction proof binds a key to the transaction that consumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProofType {
    /// Reserved for SNARK-based proofs; never produced, never verifies.
    ZeroKnowledge,
    /// BLAKE3 derived-key binding, for hardware that reports destruction itself
    HardwareAttestation,
    /// SHA-256 commitment over the binding fields
    CryptographicCommitment,
}

/// Status of a one-time key inside a pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Available,
    Encumbered,
}

/// Status of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Prepared,
    Completed,
    Failed,
    Disputed,
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionStatus::Prepared => write!(f, "prepared"),
            TransactionStatus::Completed => write!(f, "completed"),
            TransactionStatus::Failed => write!(f, "failed"),
            TransactionStatus::Disputed => write!(f, "disputed"),
        }
    }
}

/// Status of a payment channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    Active,
    Closing,
    Closed,
    Disputed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelStatus::Active => write!(f, "active"),
            ChannelStatus::Closing => write!(f, "closing"),
            ChannelStatus::Closed => write!(f, "closed"),
            ChannelStatus::Disputed => write!(f, "disputed"),
        }
    }
}

/// Grounds on which a party disputes a channel or transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeReason {
    InvalidSignature,
    InvalidAttestation,
    DoubleSpending,
    FraudulentTransaction,
    Other,
}

/// Arbitration progress of a dispute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisputeStatus {
    Open,
    Resolved,
    Dismissed,
}

/// Process-wide summary counters. Informational only, never consulted for authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProtocolState {
    pub total_devices: u64,
    pub total_transactions: u64,
    /// Shift charges no protocol fee
    pub protocol_fee: u64,
}
