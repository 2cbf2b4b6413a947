//! In-process software KMS.
//!
//! Keys live in memory as PKCS#8-derived ring key pairs. This backend is the
//! default for development and for CAs whose threat model accepts on-host
//! keys; production deployments substitute a PKCS#11 or cloud backend behind
//! the same [`Kms`] trait.

use crate::signer::{KeySigner, SignatureAlgorithm};
use crate::uri::KeyUri;
use crate::{CreateKeyRequest, Error, Kms, Result, SignerHandle};
use async_trait::async_trait;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

/// Upper bound on concurrent signing operations.
const SIGN_PERMITS: usize = 32;

/// The `softkms` URI scheme.
pub const SCHEME: &str = "softkms";

/// An in-process KMS backend holding software keys.
pub struct SoftKms {
    keys: RwLock<HashMap<String, Arc<SoftKey>>>,
    permits: Arc<Semaphore>,
    rng: SystemRandom,
}

enum KeyInner {
    Ecdsa(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
}

struct SoftKey {
    key_uri: String,
    algorithm: SignatureAlgorithm,
    public_key: Vec<u8>,
    inner: KeyInner,
    rng: SystemRandom,
}

impl SoftKey {
    fn generate(key_uri: String, algorithm: SignatureAlgorithm, rng: &SystemRandom) -> Result<Self> {
        let pkcs8 = match algorithm {
            SignatureAlgorithm::EcdsaP256Sha256 => {
                EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, rng)
                    .map_err(|_| Error::SignatureFailed("P-256 key generation failed".into()))?
                    .as_ref()
                    .to_vec()
            }
            SignatureAlgorithm::EcdsaP384Sha384 => {
                EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P384_SHA384_ASN1_SIGNING, rng)
                    .map_err(|_| Error::SignatureFailed("P-384 key generation failed".into()))?
                    .as_ref()
                    .to_vec()
            }
            SignatureAlgorithm::Ed25519 => Ed25519KeyPair::generate_pkcs8(rng)
                .map_err(|_| Error::SignatureFailed("Ed25519 key generation failed".into()))?
                .as_ref()
                .to_vec(),
        };
        Self::from_pkcs8(key_uri, algorithm, &pkcs8, rng)
    }

    fn from_pkcs8(
        key_uri: String,
        algorithm: SignatureAlgorithm,
        pkcs8: &[u8],
        rng: &SystemRandom,
    ) -> Result<Self> {
        let inner = match algorithm {
            SignatureAlgorithm::EcdsaP256Sha256 => KeyInner::Ecdsa(
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, pkcs8, rng)
                    .map_err(|_| Error::SignatureFailed("invalid P-256 PKCS#8 key".into()))?,
            ),
            SignatureAlgorithm::EcdsaP384Sha384 => KeyInner::Ecdsa(
                EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P384_SHA384_ASN1_SIGNING, pkcs8, rng)
                    .map_err(|_| Error::SignatureFailed("invalid P-384 PKCS#8 key".into()))?,
            ),
            SignatureAlgorithm::Ed25519 => KeyInner::Ed25519(
                Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)
                    .map_err(|_| Error::SignatureFailed("invalid Ed25519 PKCS#8 key".into()))?,
            ),
        };
        let public_key = match &inner {
            KeyInner::Ecdsa(kp) => kp.public_key().as_ref().to_vec(),
            KeyInner::Ed25519(kp) => kp.public_key().as_ref().to_vec(),
        };
        Ok(Self {
            key_uri,
            algorithm,
            public_key,
            inner,
            rng: rng.clone(),
        })
    }
}

impl KeySigner for SoftKey {
    fn key_uri(&self) -> &str {
        &self.key_uri
    }

    fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        match &self.inner {
            KeyInner::Ecdsa(kp) => kp
                .sign(&self.rng, message)
                .map(|sig| sig.as_ref().to_vec())
                .map_err(|_| Error::SignatureFailed(format!("ECDSA sign with {}", self.key_uri))),
            KeyInner::Ed25519(kp) => Ok(kp.sign(message).as_ref().to_vec()),
        }
    }
}

impl SoftKms {
    /// Creates an empty software KMS.
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(SIGN_PERMITS)),
            rng: SystemRandom::new(),
        }
    }

    /// Imports an existing PKCS#8 key under the given name.
    pub async fn import_pkcs8(
        &self,
        name: &str,
        algorithm: SignatureAlgorithm,
        pkcs8: &[u8],
    ) -> Result<SignerHandle> {
        let key_uri = KeyUri::new(SCHEME, name).to_string();
        let key = Arc::new(SoftKey::from_pkcs8(key_uri.clone(), algorithm, pkcs8, &self.rng)?);
        self.insert(key_uri.clone(), key.clone()).await?;
        Ok(SignerHandle {
            key_uri,
            public_key: key.public_key.clone(),
            algorithm,
        })
    }

    async fn insert(&self, key_uri: String, key: Arc<SoftKey>) -> Result<()> {
        let mut keys = self.keys.write().await;
        if keys.contains_key(&key_uri) {
            return Err(Error::NotSupported(format!("key already exists: {key_uri}")));
        }
        keys.insert(key_uri, key);
        Ok(())
    }

    fn lookup(&self, key_uri: &str) -> Result<Arc<SoftKey>> {
        // Lock acquisition is synchronous so `key_signer` can stay sync for
        // the rcgen seam; the map is read-mostly after startup.
        self.keys
            .try_read()
            .map_err(|_| Error::Transient("key registry busy".into()))?
            .get(key_uri)
            .cloned()
            .ok_or_else(|| Error::KeyNotFound(key_uri.to_string()))
    }
}

impl Default for SoftKms {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Kms for SoftKms {
    async fn create_key(&self, req: &CreateKeyRequest) -> Result<SignerHandle> {
        let key_uri = KeyUri::new(SCHEME, &req.name).to_string();
        let key = Arc::new(SoftKey::generate(key_uri.clone(), req.algorithm, &self.rng)?);
        let public_key = key.public_key.clone();
        self.insert(key_uri.clone(), key).await?;
        tracing::debug!(%key_uri, algorithm = %req.algorithm, "created software key");
        Ok(SignerHandle {
            key_uri,
            public_key,
            algorithm: req.algorithm,
        })
    }

    async fn get_public_key(&self, key_uri: &str) -> Result<Vec<u8>> {
        KeyUri::parse(key_uri)?;
        let keys = self.keys.read().await;
        keys.get(key_uri)
            .map(|k| k.public_key.clone())
            .ok_or_else(|| Error::KeyNotFound(key_uri.to_string()))
    }

    async fn sign(&self, key_uri: &str, message: &[u8]) -> Result<Vec<u8>> {
        let key = {
            let keys = self.keys.read().await;
            keys.get(key_uri)
                .cloned()
                .ok_or_else(|| Error::KeyNotFound(key_uri.to_string()))?
        };
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Transient("signer pool closed".into()))?;
        key.sign(message)
    }

    fn key_signer(&self, key_uri: &str) -> Result<Arc<dyn KeySigner>> {
        Ok(self.lookup(key_uri)?)
    }
}
