//! Hardware attestation: quote verification against manufacturer trust roots
//! and the lifecycle of a device's attestation record.
//!
//! ## Trust chain
//! 1. A manufacturer registers a root key with a [`TrustRoots`] registry.
//! 2. The root endorses a per-device attestation key in a [`DeviceCertificate`].
//! 3. The device signs quotes with that attestation key.
//!
//! ## Record lifecycle
//! `Pending → Valid → Expired`, with `Revoked` reachable from every state and
//! terminal. The verifier performs no I/O and makes no persistence decisions;
//! it takes a record and returns the updated record.

use crate::config::AttestationConfig;
use crate::crypto::{blake3_xof, SignatureVerifier, Signer};
use crate::quote::{quote_message, AttestationQuote};
use crate::types::{
    AttestationProof, AttestationStatus, DeviceId, ManufacturerId, PublicKeyBytes,
    RevocationReason, SignatureBytes, ValidationError, ATTESTATION_PROOF_LEN,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

const CERT_DOMAIN: &[u8] = b"shift/device-cert/v1";
const ATTESTATION_PROOF_CONTEXT: &str = "shift-core 2024-06 attestation proof v1";

/// Errors that can occur while creating or checking an attestation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttestationError {
    #[error("Malformed attestation input: {0}")]
    MalformedInput(#[from] ValidationError),

    #[error("Quote signature does not verify under the certified attestation key")]
    InvalidSignature,

    #[error("Untrusted certificate: {0}")]
    UntrustedCertificate(String),

    #[error("Attestation expired")]
    Expired,

    #[error("Attestation revoked")]
    Revoked,

    #[error("Attestation is {0}, expected valid")]
    NotValid(AttestationStatus),

    #[error("Refresh quote is not fresh: {0}")]
    StaleQuote(&'static str),
}

/// Source of manufacturer trust roots.
pub trait TrustRoots: Send + Sync {
    /// Root public key of an active manufacturer, or `None` if unknown or deactivated.
    fn root_key(&self, manufacturer_id: &ManufacturerId) -> Option<PublicKeyBytes>;
}

/// A hardware manufacturer whose root key is trusted to certify devices.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manufacturer {
    pub manufacturer_id: ManufacturerId,
    pub name: String,
    pub root_key: PublicKeyBytes,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
}

/// In-memory manufacturer registry.
///
/// Mutable through `&self`, so it stays administrable after being handed to
/// an [`AttestationVerifier`] as `Arc<dyn TrustRoots>`.
pub struct ManufacturerRegistry {
    manufacturers: RwLock<HashMap<ManufacturerId, Manufacturer>>,
}

impl ManufacturerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            manufacturers: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<ManufacturerId, Manufacturer>> {
        self.manufacturers.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<ManufacturerId, Manufacturer>> {
        self.manufacturers.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register (or replace) a manufacturer's trust root.
    pub fn register(&self, manufacturer: Manufacturer) {
        tracing::info!(
            manufacturer = %manufacturer.manufacturer_id,
            name = %manufacturer.name,
            "trusted manufacturer registered"
        );
        self.write().insert(manufacturer.manufacturer_id, manufacturer);
    }

    /// Stop trusting a manufacturer. Returns false if it was never registered.
    pub fn deactivate(&self, manufacturer_id: &ManufacturerId) -> bool {
        match self.write().get_mut(manufacturer_id) {
            Some(manufacturer) => {
                manufacturer.active = false;
                tracing::warn!(manufacturer = %manufacturer_id, "manufacturer deactivated");
                true
            }
            None => false,
        }
    }

    pub fn get(&self, manufacturer_id: &ManufacturerId) -> Option<Manufacturer> {
        self.read().get(manufacturer_id).cloned()
    }

    /// Names of all registered manufacturers.
    pub fn names(&self) -> Vec<String> {
        self.read().values().map(|m| m.name.clone()).collect()
    }
}

impl TrustRoots for ManufacturerRegistry {
    fn root_key(&self, manufacturer_id: &ManufacturerId) -> Option<PublicKeyBytes> {
        self.read()
            .get(manufacturer_id)
            .filter(|m| m.active)
            .map(|m| m.root_key)
    }
}

impl Default for ManufacturerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ManufacturerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManufacturerRegistry")
            .field("manufacturers", &self.names())
            .finish()
    }
}

/// Manufacturer endorsement of a device's attestation key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCertificate {
    pub device_id: DeviceId,
    pub manufacturer_id: ManufacturerId,
    /// Key the device signs quotes with
    pub attestation_key: PublicKeyBytes,
    /// Manufacturer root signature over [`DeviceCertificate::endorsement_message`]
    pub endorsement: SignatureBytes,
}

impl DeviceCertificate {
    /// Issue a certificate by signing with the manufacturer root.
    pub fn issue(
        root: &Signer,
        manufacturer_id: ManufacturerId,
        device_id: DeviceId,
        attestation_key: PublicKeyBytes,
    ) -> Self {
        let message = Self::endorsement_message(&manufacturer_id, &device_id, &attestation_key);
        Self {
            device_id,
            manufacturer_id,
            attestation_key,
            endorsement: root.sign(&message),
        }
    }

    pub fn endorsement_message(
        manufacturer_id: &ManufacturerId,
        device_id: &DeviceId,
        attestation_key: &PublicKeyBytes,
    ) -> Vec<u8> {
        let mut message = Vec::with_capacity(CERT_DOMAIN.len() + 96);
        message.extend_from_slice(CERT_DOMAIN);
        message.extend_from_slice(manufacturer_id.as_bytes());
        message.extend_from_slice(device_id.as_bytes());
        message.extend_from_slice(attestation_key);
        message
    }
}

/// A device's attestation state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationRecord {
    pub device_id: DeviceId,
    pub manufacturer_id: ManufacturerId,
    pub attestation_quote: AttestationQuote,
    pub device_certificate: DeviceCertificate,
    pub status: AttestationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<RevocationReason>,
}

impl AttestationRecord {
    pub fn is_revoked(&self) -> bool {
        self.status == AttestationStatus::Revoked
    }

    fn transition(&mut self, next: AttestationStatus) -> Result<(), AttestationError> {
        if !self.status.can_transition_to(next) {
            return Err(match self.status {
                AttestationStatus::Revoked => AttestationError::Revoked,
                AttestationStatus::Expired => AttestationError::Expired,
                other => AttestationError::NotValid(other),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Validates quotes against manufacturer trust roots and drives record status.
pub struct AttestationVerifier {
    config: AttestationConfig,
    trust_roots: Arc<dyn TrustRoots>,
    verifier: Arc<dyn SignatureVerifier>,
}

impl AttestationVerifier {
    pub fn new(
        config: AttestationConfig,
        trust_roots: Arc<dyn TrustRoots>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        Self {
            config,
            trust_roots,
            verifier,
        }
    }

    pub fn config(&self) -> &AttestationConfig {
        &self.config
    }

    /// Verify a quote and certificate and return a `Valid` record expiring
    /// `validity_period` after `now`.
    pub fn create_attestation(
        &self,
        device_id: &[u8],
        manufacturer_id: &[u8],
        certificate: DeviceCertificate,
        quote: AttestationQuote,
        now: DateTime<Utc>,
    ) -> Result<AttestationRecord, AttestationError> {
        let pending = self.create_pending(device_id, manufacturer_id, certificate, quote, now)?;
        self.activate(pending, now)
    }

    /// Boundary-validate the inputs and return a `Pending` record. No
    /// cryptographic checks happen until [`AttestationVerifier::activate`].
    pub fn create_pending(
        &self,
        device_id: &[u8],
        manufacturer_id: &[u8],
        certificate: DeviceCertificate,
        quote: AttestationQuote,
        now: DateTime<Utc>,
    ) -> Result<AttestationRecord, AttestationError> {
        let device_id = DeviceId::try_from(device_id)?;
        let manufacturer_id = ManufacturerId::try_from(manufacturer_id)?;
        self.validate_quote_shape(&quote)?;

        Ok(AttestationRecord {
            device_id,
            manufacturer_id,
            attestation_quote: quote,
            device_certificate: certificate,
            status: AttestationStatus::Pending,
            created_at: now,
            expires_at: self.config.expires_at(now),
            revoked_at: None,
            revocation_reason: None,
        })
    }

    /// Verify certificate chain and quote signature, moving `Pending → Valid`.
    pub fn activate(
        &self,
        mut record: AttestationRecord,
        now: DateTime<Utc>,
    ) -> Result<AttestationRecord, AttestationError> {
        if record.status != AttestationStatus::Pending {
            return Err(match record.status {
                AttestationStatus::Revoked => AttestationError::Revoked,
                other => AttestationError::NotValid(other),
            });
        }

        self.verify_quote(
            &record.device_id,
            &record.manufacturer_id,
            &record.device_certificate,
            &record.attestation_quote,
        )?;

        record.transition(AttestationStatus::Valid)?;
        record.created_at = now;
        record.expires_at = self.config.expires_at(now);

        tracing::info!(
            device = %record.device_id,
            manufacturer = %record.manufacturer_id,
            expires_at = %record.expires_at,
            "device attestation created"
        );
        Ok(record)
    }

    /// True iff the record is `Valid` and `now < expires_at`.
    pub fn verify_attestation(&self, record: &AttestationRecord, now: DateTime<Utc>) -> bool {
        self.check(record, now).is_ok()
    }

    /// Like [`AttestationVerifier::verify_attestation`], but reports why a record cannot settle.
    pub fn check(&self, record: &AttestationRecord, now: DateTime<Utc>) -> Result<(), AttestationError> {
        match record.status {
            AttestationStatus::Valid if now < record.expires_at => Ok(()),
            AttestationStatus::Valid | AttestationStatus::Expired => Err(AttestationError::Expired),
            AttestationStatus::Revoked => Err(AttestationError::Revoked),
            AttestationStatus::Pending => Err(AttestationError::NotValid(AttestationStatus::Pending)),
        }
    }

    /// Revoke a record. Idempotent: the first revocation's time and reason are kept.
    pub fn revoke(
        &self,
        mut record: AttestationRecord,
        reason: RevocationReason,
        now: DateTime<Utc>,
    ) -> AttestationRecord {
        if record.is_revoked() {
            return record;
        }
        record.status = AttestationStatus::Revoked;
        record.revoked_at = Some(now);
        record.revocation_reason = Some(reason);
        tracing::warn!(device = %record.device_id, ?reason, "device attestation revoked");
        record
    }

    /// Persist the passage of time: a `Valid` record past its expiry becomes `Expired`.
    pub fn mark_expired(&self, mut record: AttestationRecord, now: DateTime<Utc>) -> AttestationRecord {
        if record.status == AttestationStatus::Valid && now >= record.expires_at {
            record.status = AttestationStatus::Expired;
            tracing::debug!(device = %record.device_id, "device attestation expired");
        }
        record
    }

    /// Replace the quote of a `Valid` record with a fresh one and extend its expiry.
    ///
    /// The new quote must carry a different nonce and a later timestamp than the stored one.
    pub fn refresh(
        &self,
        mut record: AttestationRecord,
        quote: AttestationQuote,
        now: DateTime<Utc>,
    ) -> Result<AttestationRecord, AttestationError> {
        match record.status {
            AttestationStatus::Valid => {}
            AttestationStatus::Revoked => return Err(AttestationError::Revoked),
            AttestationStatus::Expired => return Err(AttestationError::Expired),
            AttestationStatus::Pending => {
                return Err(AttestationError::NotValid(AttestationStatus::Pending))
            }
        }

        self.validate_quote_shape(&quote)?;
        if quote.nonce == record.attestation_quote.nonce {
            return Err(AttestationError::StaleQuote("nonce already used"));
        }
        if quote.timestamp <= record.attestation_quote.timestamp {
            return Err(AttestationError::StaleQuote("timestamp not after current quote"));
        }
        self.verify_quote(
            &record.device_id,
            &record.manufacturer_id,
            &record.device_certificate,
            &quote,
        )?;

        record.attestation_quote = quote;
        record.expires_at = self.config.expires_at(now);
        tracing::info!(device = %record.device_id, expires_at = %record.expires_at, "device attestation refreshed");
        Ok(record)
    }

    /// Derive the 128-byte attestation proof handed to counterparties.
    pub fn attestation_proof(record: &AttestationRecord) -> AttestationProof {
        let created = record.created_at.timestamp_micros().to_le_bytes();
        let expires = record.expires_at.timestamp_micros().to_le_bytes();
        let mut out = [0u8; ATTESTATION_PROOF_LEN];
        blake3_xof(
            ATTESTATION_PROOF_CONTEXT,
            &[
                record.device_id.as_bytes(),
                record.manufacturer_id.as_bytes(),
                &record.device_certificate.attestation_key,
                &record.attestation_quote.nonce,
                &record.attestation_quote.signature,
                &created,
                &expires,
            ],
            &mut out,
        );
        AttestationProof(out)
    }

    /// Check that `proof` was derived from `record`.
    pub fn verify_attestation_proof(record: &AttestationRecord, proof: &AttestationProof) -> bool {
        Self::attestation_proof(record) == *proof
    }

    fn validate_quote_shape(&self, quote: &AttestationQuote) -> Result<(), AttestationError> {
        if quote.version == 0 {
            return Err(ValidationError::UnsupportedQuoteVersion(quote.version).into());
        }
        SignatureBytes::try_from(quote.signature.as_slice())?;
        if quote.measurements.is_empty() {
            return Err(ValidationError::EmptyMeasurements.into());
        }
        if quote.measurements.len() > self.config.max_measurements {
            return Err(ValidationError::TooManyMeasurements {
                max: self.config.max_measurements,
                actual: quote.measurements.len(),
            }
            .into());
        }
        Ok(())
    }

    fn verify_quote(
        &self,
        device_id: &DeviceId,
        manufacturer_id: &ManufacturerId,
        certificate: &DeviceCertificate,
        quote: &AttestationQuote,
    ) -> Result<(), AttestationError> {
        if certificate.device_id != *device_id {
            return Err(AttestationError::UntrustedCertificate(
                "certificate issued for another device".to_string(),
            ));
        }
        if certificate.manufacturer_id != *manufacturer_id {
            return Err(AttestationError::UntrustedCertificate(
                "certificate issued by another manufacturer".to_string(),
            ));
        }
        let root_key = self.trust_roots.root_key(manufacturer_id).ok_or_else(|| {
            AttestationError::UntrustedCertificate(format!(
                "manufacturer {manufacturer_id} is not a trusted root"
            ))
        })?;
        let endorsement = DeviceCertificate::endorsement_message(
            manufacturer_id,
            device_id,
            &certificate.attestation_key,
        );
        if !self.verifier.verify(&root_key, &endorsement, &certificate.endorsement) {
            return Err(AttestationError::UntrustedCertificate(
                "endorsement does not verify under manufacturer root".to_string(),
            ));
        }

        let signature = SignatureBytes::try_from(quote.signature.as_slice())?;
        let message = quote_message(device_id, manufacturer_id, &quote.nonce, &quote.measurements);
        if !self
            .verifier
            .verify(&certificate.attestation_key, &message, &signature)
        {
            tracing::debug!(device = %device_id, "quote signature rejected");
            return Err(AttestationError::InvalidSignature);
        }
        Ok(())
    }
}

impl fmt::Debug for AttestationVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttestationVerifier")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
