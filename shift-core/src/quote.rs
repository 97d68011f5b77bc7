//! Hardware attestation quotes.
//!
//! A quote is device-produced evidence of identity and integrity: a nonce, a
//! timestamp and an ordered list of measurement digests (boot chain, firmware,
//! signing applet), signed with the manufacturer-certified attestation key.
//!
//! ## Signed message
//! `device_id ∥ manufacturer_id ∥ nonce ∥ measurement_0 ∥ … ∥ measurement_n`
//!
//! Every component is exactly 32 bytes, so the message is unambiguous without
//! length prefixes.

use crate::crypto::Signer;
use crate::types::{DeviceId, Hash256, ManufacturerId, PublicKeyBytes, SignatureBytes};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Quote format version
pub const QUOTE_VERSION: u32 = 1;

/// A device attestation quote as received at the boundary.
///
/// `signature` stays a byte vector here: its length is validated by
/// [`crate::AttestationVerifier::create_attestation`], not by the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationQuote {
    /// Quote format version (must be non-zero)
    pub version: u32,
    /// Signature by the certified attestation key over [`quote_message`]
    pub signature: Vec<u8>,
    /// Device hardware identity key
    pub public_key: PublicKeyBytes,
    /// Freshness nonce
    pub nonce: [u8; 32],
    /// Device clock at quote time (informational)
    pub timestamp: DateTime<Utc>,
    /// Ordered measurement digests (PCR-style)
    pub measurements: Vec<Hash256>,
}

/// Build the byte string an attestation key signs for a quote.
pub fn quote_message(
    device_id: &DeviceId,
    manufacturer_id: &ManufacturerId,
    nonce: &[u8; 32],
    measurements: &[Hash256],
) -> Vec<u8> {
    let mut message = Vec::with_capacity(32 * (3 + measurements.len()));
    message.extend_from_slice(device_id.as_bytes());
    message.extend_from_slice(manufacturer_id.as_bytes());
    message.extend_from_slice(nonce);
    for measurement in measurements {
        message.extend_from_slice(measurement);
    }
    message
}

/// Builder for signed quotes, as a device would produce them.
#[derive(Debug, Default)]
pub struct QuoteBuilder {
    device_id: Option<DeviceId>,
    manufacturer_id: Option<ManufacturerId>,
    public_key: Option<PublicKeyBytes>,
    nonce: Option<[u8; 32]>,
    timestamp: Option<DateTime<Utc>>,
    measurements: Vec<Hash256>,
}

impl QuoteBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device_id(mut self, id: DeviceId) -> Self {
        self.device_id = Some(id);
        self
    }

    pub fn manufacturer_id(mut self, id: ManufacturerId) -> Self {
        self.manufacturer_id = Some(id);
        self
    }

    pub fn public_key(mut self, key: PublicKeyBytes) -> Self {
        self.public_key = Some(key);
        self
    }

    pub fn nonce(mut self, nonce: [u8; 32]) -> Self {
        self.nonce = Some(nonce);
        self
    }

    pub fn timestamp(mut self, ts: DateTime<Utc>) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Append one measurement digest; order is significant.
    pub fn measurement(mut self, digest: Hash256) -> Self {
        self.measurements.push(digest);
        self
    }

    /// Build and sign the quote with the device's certified attestation key.
    ///
    /// A missing nonce is drawn from the OS RNG.
    pub fn build_and_sign(self, attestation_key: &Signer) -> Result<AttestationQuote, BuildError> {
        let device_id = self.device_id.ok_or(BuildError::MissingField("device_id"))?;
        let manufacturer_id = self
            .manufacturer_id
            .ok_or(BuildError::MissingField("manufacturer_id"))?;
        let public_key = self.public_key.ok_or(BuildError::MissingField("public_key"))?;
        if self.measurements.is_empty() {
            return Err(BuildError::MissingField("measurements"));
        }
        let nonce = self.nonce.unwrap_or_else(|| {
            use rand::RngCore;
            let mut nonce = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut nonce);
            nonce
        });

        let message = quote_message(&device_id, &manufacturer_id, &nonce, &self.measurements);
        let SignatureBytes(signature) = attestation_key.sign(&message);

        Ok(AttestationQuote {
            version: QUOTE_VERSION,
            signature: signature.to_vec(),
            public_key,
            nonce,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            measurements: self.measurements,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{sha256, Ed25519Verifier, SignatureVerifier};

    #[test]
    fn test_quote_signature_covers_message() {
        let attestation_key = Signer::generate();
        let device = DeviceId([1u8; 32]);
        let manufacturer = ManufacturerId([2u8; 32]);

        let quote = QuoteBuilder::new()
            .device_id(device)
            .manufacturer_id(manufacturer)
            .public_key([3u8; 32])
            .nonce([4u8; 32])
            .measurement(sha256(b"bootloader"))
            .measurement(sha256(b"firmware"))
            .build_and_sign(&attestation_key)
            .unwrap();

        let message = quote_message(&device, &manufacturer, &quote.nonce, &quote.measurements);
        let signature = SignatureBytes::try_from(quote.signature.as_slice()).unwrap();
        assert!(Ed25519Verifier.verify(&attestation_key.public_key(), &message, &signature));
        assert_eq!(quote.version, QUOTE_VERSION);
    }

    #[test]
    fn test_measurement_order_matters() {
        let device = DeviceId([1u8; 32]);
        let manufacturer = ManufacturerId([2u8; 32]);
        let a = sha256(b"a");
        let b = sha256(b"b");
        assert_ne!(
            quote_message(&device, &manufacturer, &[0; 32], &[a, b]),
            quote_message(&device, &manufacturer, &[0; 32], &[b, a]),
        );
    }

    #[test]
    fn test_missing_fields() {
        let signer = Signer::generate();
        let err = QuoteBuilder::new().build_and_sign(&signer).unwrap_err();
        assert!(matches!(err, BuildError::MissingField("device_id")));

        let err = QuoteBuilder::new()
            .device_id(DeviceId([1; 32]))
            .manufacturer_id(ManufacturerId([2; 32]))
            .public_key([3; 32])
            .build_and_sign(&signer)
            .unwrap_err();
        assert!(matches!(err, BuildError::MissingField("measurements")));
    }
}
