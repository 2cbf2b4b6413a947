//! Synchronous signer handles and the rcgen bridge.
//!
//! Certificate assembly happens inside rcgen, which drives signing through
//! its [`rcgen::SigningKey`] trait. [`RemoteSigner`] adapts any
//! [`KeySigner`] to that trait so the TBS bytes are signed by the backend
//! without the private key ever crossing into the CA core.

use crate::Result;
use std::sync::Arc;

/// Signature algorithms supported across KMS backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    /// ECDSA over P-256 with SHA-256.
    EcdsaP256Sha256,
    /// ECDSA over P-384 with SHA-384.
    EcdsaP384Sha384,
    /// Ed25519.
    Ed25519,
}

impl SignatureAlgorithm {
    /// The matching rcgen algorithm descriptor.
    pub fn rcgen(&self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcdsaP256Sha256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcdsaP384Sha384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }

    /// Stable name used in key URIs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EcdsaP256Sha256 => "ECDSA_P256_SHA256",
            Self::EcdsaP384Sha384 => "ECDSA_P384_SHA384",
            Self::Ed25519 => "ED25519",
        }
    }
}

impl std::fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A synchronous handle to one signing key.
///
/// Obtained from [`crate::Kms::key_signer`]; backends that sign over the
/// network block inside [`KeySigner::sign`], so callers route through
/// `tokio::task::spawn_blocking` when latency matters.
pub trait KeySigner: Send + Sync {
    /// The key URI this signer operates on.
    fn key_uri(&self) -> &str;

    /// Raw public key bytes (the `subjectPublicKey` content).
    fn public_key(&self) -> &[u8];

    /// The algorithm signatures are produced with.
    fn algorithm(&self) -> SignatureAlgorithm;

    /// Signs `message`, returning the encoded signature.
    fn sign(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Bridges a [`KeySigner`] into rcgen certificate assembly.
pub struct RemoteSigner {
    inner: Arc<dyn KeySigner>,
}

impl RemoteSigner {
    /// Wraps a signer handle for use as an [`rcgen::SigningKey`].
    pub fn new(inner: Arc<dyn KeySigner>) -> Self {
        Self { inner }
    }

    /// Returns this signer for use directly as an rcgen signing key.
    pub fn into_key_pair(self) -> std::result::Result<RemoteSigner, rcgen::Error> {
        Ok(self)
    }
}

impl rcgen::PublicKeyData for RemoteSigner {
    fn der_bytes(&self) -> &[u8] {
        self.inner.public_key()
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        self.inner.algorithm().rcgen()
    }
}

impl rcgen::SigningKey for RemoteSigner {
    fn sign(&self, msg: &[u8]) -> std::result::Result<Vec<u8>, rcgen::Error> {
        self.inner.sign(msg).map_err(|e| {
            tracing::error!(key_uri = self.inner.key_uri(), error = %e, "remote signing failed");
            rcgen::Error::RemoteKeyError
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn algorithm_names_roundtrip_display() {
        for alg in [
            SignatureAlgorithm::EcdsaP256Sha256,
            SignatureAlgorithm::EcdsaP384Sha384,
            SignatureAlgorithm::Ed25519,
        ] {
            assert_eq!(alg.to_string(), alg.as_str());
        }
    }
}
