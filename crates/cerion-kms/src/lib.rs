//! Key management seam for the Cerion certificate authority.
//!
//! Every signing key the CA uses is owned by a KMS backend; the rest of the
//! system only ever sees a key URI and a public key. Backends implement the
//! [`Kms`] trait; in-process software keys are provided by [`SoftKms`], and
//! hardware or cloud backends plug in behind the same operations.
//!
//! # Components
//!
//! - [`uri`] - key URI parsing (`softkms:leaf-ca`, `pkcs11:token=hsm;object=ca`)
//! - [`signer`] - the [`KeySigner`] handle and the rcgen bridge
//! - [`soft`] - [`SoftKms`], the in-process backend
//!
//! # Example
//!
//! ```
//! use cerion_kms::{CreateKeyRequest, Kms, SignatureAlgorithm, SoftKms};
//!
//! # tokio_test::block_on(async {
//! let kms = SoftKms::new();
//! let handle = kms
//!     .create_key(&CreateKeyRequest {
//!         name: "leaf-ca".into(),
//!         algorithm: SignatureAlgorithm::EcdsaP256Sha256,
//!     })
//!     .await
//!     .unwrap();
//!
//! let sig = kms.sign(&handle.key_uri, b"to be signed").await.unwrap();
//! assert!(!sig.is_empty());
//! # });
//! ```

pub mod signer;
pub mod soft;
pub mod uri;

pub use signer::{KeySigner, RemoteSigner, SignatureAlgorithm};
pub use soft::SoftKms;
pub use uri::KeyUri;

use async_trait::async_trait;
use std::sync::Arc;

/// Errors that can occur in KMS operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No key exists for the given URI.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// The backend failed to produce a signature.
    ///
    /// Callers must not retry transparently: the backend may already have
    /// emitted a signature.
    #[error("signature operation failed: {0}")]
    SignatureFailed(String),

    /// A retryable backend failure (connection loss, throttling).
    #[error("transient KMS error: {0}")]
    Transient(String),

    /// The key URI could not be parsed.
    #[error("invalid key URI: {0}")]
    InvalidUri(String),

    /// The backend does not support the requested algorithm or operation.
    #[error("not supported: {0}")]
    NotSupported(String),
}

/// Result type for KMS operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Request to create a new asymmetric signing key.
#[derive(Debug, Clone)]
pub struct CreateKeyRequest {
    /// Backend-scoped key name; becomes part of the key URI.
    pub name: String,
    /// Signature algorithm the key will be used with.
    pub algorithm: SignatureAlgorithm,
}

/// Handle to a signing key held by a KMS backend.
///
/// The private key material never leaves the backend; the handle carries
/// everything the CA core needs to reference and verify against the key.
#[derive(Debug, Clone)]
pub struct SignerHandle {
    /// URI identifying the key within its backend.
    pub key_uri: String,
    /// Raw public key bytes (the `subjectPublicKey` content).
    pub public_key: Vec<u8>,
    /// Algorithm the key signs with.
    pub algorithm: SignatureAlgorithm,
}

/// A key management backend.
///
/// All variants implement the same operations; callers never branch on the
/// backend kind. Signing is idempotent and has no side effects on CA state.
#[async_trait]
pub trait Kms: Send + Sync {
    /// Creates a new signing key and returns its handle.
    async fn create_key(&self, req: &CreateKeyRequest) -> Result<SignerHandle>;

    /// Returns the raw public key bytes for the given key URI.
    ///
    /// Public keys may be cached by implementations; private material is
    /// never cached outside the backend.
    async fn get_public_key(&self, key_uri: &str) -> Result<Vec<u8>>;

    /// Signs `message` with the key identified by `key_uri`.
    ///
    /// Implementations bound concurrent signing with an internal semaphore
    /// sized to the backend's limits; callers queue rather than fail.
    async fn sign(&self, key_uri: &str, message: &[u8]) -> Result<Vec<u8>>;

    /// Returns a synchronous [`KeySigner`] for use at the rcgen seam.
    fn key_signer(&self, key_uri: &str) -> Result<Arc<dyn KeySigner>>;
}
