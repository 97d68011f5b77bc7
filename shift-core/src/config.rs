//! Runtime configuration for the settlement core.
//!
//! Every section has defaults, so an empty JSON object is a valid config:
//!
//! ```
//! let config = shift_core::ShiftConfig::from_json("{}").unwrap();
//! assert_eq!(config.key_pool.default_capacity, 1000);
//! ```

use crate::types::ProofType;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Default attestation lifetime: 30 days.
pub const DEFAULT_VALIDITY_PERIOD_SECS: i64 = 86_400 * 30;

/// Default one-time key pool capacity per device.
pub const DEFAULT_POOL_CAPACITY: u32 = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Top-level configuration, one section per component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShiftConfig {
    pub attestation: AttestationConfig,
    pub key_pool: KeyPoolConfig,
    pub settlement: SettlementConfig,
}

/// Configuration for [`crate::AttestationVerifier`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttestationConfig {
    /// Lifetime of a freshly created or refreshed attestation (seconds)
    pub validity_period_secs: i64,
    /// Upper bound on measurement digests carried by one quote
    pub max_measurements: usize,
}

impl Default for AttestationConfig {
    fn default() -> Self {
        Self {
            validity_period_secs: DEFAULT_VALIDITY_PERIOD_SECS,
            max_measurements: 8,
        }
    }
}

impl AttestationConfig {
    /// Expiry of an attestation created or refreshed at `from`. Saturates at
    /// the latest representable time.
    pub fn expires_at(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        chrono::Duration::try_seconds(self.validity_period_secs)
            .and_then(|period| from.checked_add_signed(period))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Configuration for [`crate::KeyPoolManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyPoolConfig {
    /// Capacity given to a new pool unless more keys are supplied up front
    pub default_capacity: u32,
    /// Proof type emitted by `encumber_key`
    pub proof_type: ProofType,
}

impl Default for KeyPoolConfig {
    fn default() -> Self {
        Self {
            default_capacity: DEFAULT_POOL_CAPACITY,
            proof_type: ProofType::CryptographicCommitment,
        }
    }
}

/// Configuration shared by the lock-holding registries and the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Upper bound on waiting for a per-device or per-channel lock (milliseconds)
    pub lock_timeout_ms: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self { lock_timeout_ms: 2_000 }
    }
}

impl SettlementConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl ShiftConfig {
    /// Parse and validate a JSON config.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ShiftConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.attestation.validity_period_secs <= 0 {
            return Err(ConfigError::Invalid(
                "attestation.validity_period_secs must be positive".to_string(),
            ));
        }
        if self.attestation.max_measurements == 0 {
            return Err(ConfigError::Invalid(
                "attestation.max_measurements must be at least 1".to_string(),
            ));
        }
        if self.key_pool.default_capacity == 0 {
            return Err(ConfigError::Invalid(
                "key_pool.default_capacity must be at least 1".to_string(),
            ));
        }
        if self.key_pool.proof_type == ProofType::ZeroKnowledge {
            return Err(ConfigError::Invalid(
                "key_pool.proof_type zero_knowledge cannot be produced".to_string(),
            ));
        }
        if self.settlement.lock_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "settlement.lock_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ts;

    #[test]
    fn test_defaults() {
        let config = ShiftConfig::default();
        assert_eq!(
            config.attestation.expires_at(ts(0)),
            ts(0) + chrono::Duration::days(30)
        );
        assert_eq!(config.key_pool.default_capacity, 1000);
        assert_eq!(config.settlement.lock_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ShiftConfig::from_json(
            r#"{ "key_pool": { "default_capacity": 16, "proof_type": "hardware_attestation" } }"#,
        )
        .unwrap();
        assert_eq!(config.key_pool.default_capacity, 16);
        assert_eq!(config.key_pool.proof_type, ProofType::HardwareAttestation);
        assert_eq!(config.attestation, AttestationConfig::default());
    }

    #[test]
    fn test_rejects_zero_knowledge_proofs() {
        let err = ShiftConfig::from_json(r#"{ "key_pool": { "proof_type": "zero_knowledge" } }"#)
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            ShiftConfig::from_json("{ not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_huge_validity_period_saturates() {
        let config = AttestationConfig {
            validity_period_secs: i64::MAX,
            ..AttestationConfig::default()
        };
        assert_eq!(config.expires_at(ts(1_700_000_000)), DateTime::<Utc>::MAX_UTC);
    }
}
