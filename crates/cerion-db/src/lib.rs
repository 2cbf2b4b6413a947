//! Transactional key-value seam backing all Cerion CA state.
//!
//! The CA persists certificates, provisioners, and the ACME state machine
//! into named buckets of an opaque KV store. The store is treated as a
//! transactional map: the only primitives the core relies on are get, put,
//! conditional compare-and-swap, delete, list, and prefix scans over
//! secondary indexes. Horizontal scalability is whatever the backing store
//! provides; the reference [`MemoryDb`] is a single-process implementation
//! used in tests and development.
//!
//! All status transitions in the CA are CAS writes keyed on the previously
//! read value, so a conforming backend must implement [`Db::cmp_and_swap`]
//! atomically (or emulate it with per-key version counters).

mod memory;
mod value;

pub use memory::MemoryDb;
pub use value::{decode, encode, CURRENT_VERSION};

use async_trait::async_trait;

/// Errors returned by the database seam.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The key does not exist in the bucket.
    #[error("not found: {bucket}/{key}")]
    NotFound { bucket: Bucket, key: String },

    /// A compare-and-swap lost the race: the stored value no longer matches
    /// the expected one.
    #[error("conflict on {bucket}/{key}")]
    Conflict { bucket: Bucket, key: String },

    /// A retryable backend failure.
    #[error("transient database error: {0}")]
    Transient(String),

    /// A stored value failed to decode.
    #[error("corrupt value in {bucket}: {detail}")]
    Corrupt { bucket: Bucket, detail: String },
}

impl Error {
    pub(crate) fn not_found(bucket: Bucket, key: &[u8]) -> Self {
        Self::NotFound {
            bucket,
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    pub(crate) fn conflict(bucket: Bucket, key: &[u8]) -> Self {
        Self::Conflict {
            bucket,
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    /// True when the error is a CAS conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// True when the error is a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The fixed set of buckets the CA stores state in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Certs,
    RevokedCerts,
    Crl,
    Provisioners,
    Admins,
    AcmeAccounts,
    AcmeOrders,
    AcmeAuthzs,
    AcmeChallenges,
    AcmeNonces,
    AcmeEabKeys,
    /// Secondary index: account key-ID hash -> account ID.
    AcmeAccountByKeyId,
    /// Secondary index: `provisioner/reference` -> EAB key ID.
    AcmeEabKeyByReference,
    /// Consumed token IDs (`jti`) with expiry, for single-use enforcement.
    UsedTokens,
    /// SCEP transaction IDs mapped to the certificate they produced, so a
    /// replayed PKCSReq returns the same certificate.
    ScepTransactions,
}

impl Bucket {
    /// All buckets, for backends that pre-create them.
    pub const ALL: [Bucket; 15] = [
        Bucket::Certs,
        Bucket::RevokedCerts,
        Bucket::Crl,
        Bucket::Provisioners,
        Bucket::Admins,
        Bucket::AcmeAccounts,
        Bucket::AcmeOrders,
        Bucket::AcmeAuthzs,
        Bucket::AcmeChallenges,
        Bucket::AcmeNonces,
        Bucket::AcmeEabKeys,
        Bucket::AcmeAccountByKeyId,
        Bucket::AcmeEabKeyByReference,
        Bucket::UsedTokens,
        Bucket::ScepTransactions,
    ];

    /// The on-disk bucket name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Bucket::Certs => "certs",
            Bucket::RevokedCerts => "revoked_certs",
            Bucket::Crl => "crl",
            Bucket::Provisioners => "provisioners",
            Bucket::Admins => "admins",
            Bucket::AcmeAccounts => "acme_accounts",
            Bucket::AcmeOrders => "acme_orders",
            Bucket::AcmeAuthzs => "acme_authzs",
            Bucket::AcmeChallenges => "acme_challenges",
            Bucket::AcmeNonces => "acme_nonces",
            Bucket::AcmeEabKeys => "acme_eab_keys",
            Bucket::AcmeAccountByKeyId => "acme_account_by_key_id",
            Bucket::AcmeEabKeyByReference => "acme_eab_key_by_reference",
            Bucket::UsedTokens => "used_tokens",
            Bucket::ScepTransactions => "scep_transactions",
        }
    }
}

impl std::fmt::Display for Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transactional key-value store.
///
/// Implementations must provide atomic `cmp_and_swap`; everything else in
/// the CA builds on that. Values are opaque byte strings (the CA prefixes
/// them with a version byte, see [`encode`]).
#[async_trait]
pub trait Db: Send + Sync {
    /// Reads the value at `bucket/key`.
    async fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>>;

    /// Writes `value` at `bucket/key`, unconditionally.
    async fn put(&self, bucket: Bucket, key: &[u8], value: Vec<u8>) -> Result<()>;

    /// Atomically replaces the value at `bucket/key` if it currently equals
    /// `old`.
    ///
    /// `old == None` asserts the key is absent (insert-if-missing);
    /// `new == None` deletes the key (CAS-delete). Returns
    /// [`Error::Conflict`] when the current value does not match.
    async fn cmp_and_swap(
        &self,
        bucket: Bucket,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<()>;

    /// Deletes `bucket/key`. Deleting a missing key is not an error.
    async fn del(&self, bucket: Bucket, key: &[u8]) -> Result<()>;

    /// Lists all entries in a bucket in key order.
    async fn list(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Lists entries whose key starts with `prefix`, in key order.
    async fn scan_prefix(&self, bucket: Bucket, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}
