//! Test fixtures shared across modules.

use crate::attestation::{AttestationVerifier, DeviceCertificate, Manufacturer, ManufacturerRegistry};
use crate::config::AttestationConfig;
use crate::crypto::{sha256, Ed25519Verifier, SignatureVerifier, Signer};
use crate::quote::{AttestationQuote, QuoteBuilder};
use crate::types::{DeviceId, ManufacturerId, PublicKeyBytes, SignatureBytes};
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;

/// Unix seconds to a UTC timestamp.
pub(crate) fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Verifier double that accepts every signature.
pub(crate) struct AcceptAll;

impl SignatureVerifier for AcceptAll {
    fn verify(&self, _: &PublicKeyBytes, _: &[u8], _: &SignatureBytes) -> bool {
        true
    }
}

pub(crate) fn one_time_keys(n: usize) -> Vec<Signer> {
    (0..n).map(|_| Signer::generate()).collect()
}

pub(crate) fn public_keys(signers: &[Signer]) -> Vec<PublicKeyBytes> {
    signers.iter().map(Signer::public_key).collect()
}

/// A manufacturer with its root key and one attestation key it certifies devices with.
pub(crate) struct TestManufacturer {
    pub id: ManufacturerId,
    pub root: Signer,
    pub attestation_key: Signer,
}

impl TestManufacturer {
    pub fn new(tag: u8) -> Self {
        Self {
            id: ManufacturerId([tag; 32]),
            root: Signer::generate(),
            attestation_key: Signer::generate(),
        }
    }

    pub fn registry(&self) -> ManufacturerRegistry {
        let registry = ManufacturerRegistry::new();
        registry.register(Manufacturer {
            manufacturer_id: self.id,
            name: format!("test-manufacturer-{}", self.id.0[0]),
            root_key: self.root.public_key(),
            active: true,
            registered_at: ts(0),
        });
        registry
    }

    pub fn attestation_verifier(&self) -> AttestationVerifier {
        AttestationVerifier::new(
            AttestationConfig::default(),
            Arc::new(self.registry()),
            Arc::new(Ed25519Verifier),
        )
    }

    pub fn certificate(&self, device: DeviceId) -> DeviceCertificate {
        DeviceCertificate::issue(&self.root, self.id, device, self.attestation_key.public_key())
    }

    pub fn quote(&self, device: DeviceId) -> AttestationQuote {
        self.quote_at(device, ts(0))
    }

    /// A quote with a fresh random nonce, stamped `timestamp`.
    pub fn quote_at(&self, device: DeviceId, timestamp: DateTime<Utc>) -> AttestationQuote {
        QuoteBuilder::new()
            .device_id(device)
            .manufacturer_id(self.id)
            .public_key(self.attestation_key.public_key())
            .timestamp(timestamp)
            .measurement(sha256(b"shift-boot 1.2.0"))
            .measurement(sha256(b"shift-os 4.1.3"))
            .build_and_sign(&self.attestation_key)
            .unwrap()
    }
}
