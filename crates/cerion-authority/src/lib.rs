//! The Cerion certificate authority.
//!
//! Orchestrates the issuance pipeline: a provisioner validates the
//! client's proof, a template renders the candidate certificate, policy
//! and claims constrain it, the KMS signs it, and the database records it.
//! The same pipeline backs the token API (`/1.0/*`), the ACME front end,
//! and the SCEP front end.
//!
//! # Components
//!
//! - [`registry`] - the copy-on-write provisioner registry
//! - [`records`] - persisted certificate and revocation records
//! - [`authority`] - the [`Authority`] and its sign/renew/revoke pipeline
//! - [`crl`] - certificate revocation list maintenance
//! - [`api`] - axum handlers for `/1.0/sign`, `/1.0/renew`, `/1.0/revoke`

pub mod api;
pub mod authority;
pub mod crl;
pub mod records;
pub mod registry;

pub use authority::{Authority, AuthorityConfig, SignedChain};
pub use records::{CertificateRecord, RevocationRecord};
pub use registry::Registry;

/// Error kinds for the issuance pipeline, mapped onto HTTP statuses by the
/// API layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed input (unparseable CSR, bad PEM, unknown fields).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Proof validation failed.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request is authentic but policy or claims forbid it.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// CAS or uniqueness violation.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Retryable upstream failure.
    #[error("transient: {0}")]
    Transient(String),

    /// Unexpected internal failure. No certificate was persisted.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The HTTP status the API layer serves this error with.
    pub fn status(&self) -> u16 {
        match self {
            Error::BadRequest(_) => 400,
            Error::Unauthorized(_) => 401,
            Error::Forbidden(_) => 403,
            Error::NotFound(_) => 404,
            Error::Conflict(_) => 409,
            Error::Transient(_) => 503,
            Error::Internal(_) => 500,
        }
    }
}

impl From<cerion_provisioner::Error> for Error {
    fn from(e: cerion_provisioner::Error) -> Self {
        use cerion_provisioner::Error as PE;
        match e {
            PE::Malformed(d) => Error::BadRequest(d),
            PE::Unauthorized(d) => Error::Unauthorized(d),
            PE::Forbidden(d) => Error::Forbidden(d),
            PE::Transient(d) => Error::Transient(d),
            PE::Config(d) => Error::Internal(format!("provisioner configuration: {d}")),
            PE::Db(e) => Error::from(e),
            PE::Policy(e) => Error::from(e),
        }
    }
}

impl From<cerion_db::Error> for Error {
    fn from(e: cerion_db::Error) -> Self {
        match e {
            cerion_db::Error::NotFound { .. } => Error::NotFound(e.to_string()),
            cerion_db::Error::Conflict { .. } => Error::Conflict(e.to_string()),
            cerion_db::Error::Transient(d) => Error::Transient(d),
            cerion_db::Error::Corrupt { .. } => {
                tracing::error!(error = %e, "corrupt database value");
                Error::Internal("corrupt database value".into())
            }
        }
    }
}

impl From<cerion_cert::Error> for Error {
    fn from(e: cerion_cert::Error) -> Self {
        match e {
            cerion_cert::Error::Denied { .. } => Error::Forbidden(e.to_string()),
            cerion_cert::Error::Template(d) => Error::BadRequest(format!("template: {d}")),
            cerion_cert::Error::InvalidLeaf(d) => Error::BadRequest(format!("leaf: {d}")),
            other => Error::Internal(other.to_string()),
        }
    }
}

impl From<cerion_kms::Error> for Error {
    fn from(e: cerion_kms::Error) -> Self {
        match e {
            cerion_kms::Error::Transient(d) => Error::Transient(d),
            // a signature may already have been emitted; never retried
            other => {
                tracing::error!(error = %other, "KMS failure");
                Error::Internal("signing backend failure".into())
            }
        }
    }
}

/// Result type for authority operations.
pub type Result<T> = std::result::Result<T, Error>;

/// PEM-encodes a DER blob under the given label.
pub(crate) fn pem_encode(label: &str, der: &[u8]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    let b64 = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).expect("base64 is ascii"));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// Decodes the first PEM block with the given label.
pub(crate) fn pem_decode(label: &str, pem: &str) -> Result<Vec<u8>> {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    let begin = format!("-----BEGIN {label}-----");
    let end = format!("-----END {label}-----");
    let mut body = String::new();
    let mut inside = false;
    for line in pem.lines() {
        let line = line.trim();
        if line == begin {
            inside = true;
        } else if line == end {
            if inside {
                return STANDARD
                    .decode(body.as_bytes())
                    .map_err(|e| Error::BadRequest(format!("invalid PEM body: {e}")));
            }
        } else if inside {
            body.push_str(line);
        }
    }
    Err(Error::BadRequest(format!("no {label} PEM block found")))
}
