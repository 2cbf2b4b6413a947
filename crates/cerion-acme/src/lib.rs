//! RFC 8555 (ACME) server core.
//!
//! Implements the server side of the ACME protocol on top of the Cerion
//! database seam and provisioner framework: accounts, orders,
//! authorizations, challenges, nonces, External Account Binding, and
//! finalization through the issuance pipeline. Every state transition is a
//! compare-and-swap keyed on the previously read record, so concurrent
//! polls and finalize calls race deterministically.
//!
//! # Components
//!
//! - [`types`] - wire/persisted resource types and their state machines
//! - [`db`] - typed access to the ACME buckets
//! - [`nonce`] - anti-replay nonces (DB-backed, LRU-fronted)
//! - [`jws`] - flattened JWS parsing and account binding
//! - [`eab`] - External Account Binding keys and verification
//! - [`order`] - order creation, canonicalization, finalization
//! - [`challenge`] - challenge validation (http-01, dns-01, tls-alpn-01,
//!   device-attest-01, wire-oidc-01, wire-dpop-01)
//! - [`api`] - axum handlers and routers (ACME + EAB admin)

pub mod api;
pub mod challenge;
pub mod db;
pub mod eab;
pub mod jws;
pub mod nonce;
pub mod order;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use db::AcmeDb;
pub use nonce::NonceService;

use async_trait::async_trait;
use cerion_cert::San;
use cerion_provisioner::{AcmeProvisioner, Provisioner as _, WireProvisioner};
use std::sync::Arc;

/// RFC 8555 error types (the `urn:ietf:params:acme:error:<kind>` registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    AccountDoesNotExist,
    AlreadyRevoked,
    BadCsr,
    BadNonce,
    BadPublicKey,
    BadRevocationReason,
    BadSignatureAlgorithm,
    ExternalAccountRequired,
    Malformed,
    OrderNotReady,
    RejectedIdentifier,
    ServerInternal,
    Unauthorized,
    UnsupportedIdentifier,
}

impl ErrorKind {
    /// The registry label after `urn:ietf:params:acme:error:`.
    pub fn label(&self) -> &'static str {
        match self {
            ErrorKind::AccountDoesNotExist => "accountDoesNotExist",
            ErrorKind::AlreadyRevoked => "alreadyRevoked",
            ErrorKind::BadCsr => "badCSR",
            ErrorKind::BadNonce => "badNonce",
            ErrorKind::BadPublicKey => "badPublicKey",
            ErrorKind::BadRevocationReason => "badRevocationReason",
            ErrorKind::BadSignatureAlgorithm => "badSignatureAlgorithm",
            ErrorKind::ExternalAccountRequired => "externalAccountRequired",
            ErrorKind::Malformed => "malformed",
            ErrorKind::OrderNotReady => "orderNotReady",
            ErrorKind::RejectedIdentifier => "rejectedIdentifier",
            ErrorKind::ServerInternal => "serverInternal",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::UnsupportedIdentifier => "unsupportedIdentifier",
        }
    }

    /// HTTP status the problem document is served with.
    pub fn status(&self) -> u16 {
        match self {
            ErrorKind::AccountDoesNotExist => 400,
            ErrorKind::AlreadyRevoked => 400,
            ErrorKind::BadCsr => 400,
            ErrorKind::BadNonce => 400,
            ErrorKind::BadPublicKey => 400,
            ErrorKind::BadRevocationReason => 400,
            ErrorKind::BadSignatureAlgorithm => 400,
            ErrorKind::ExternalAccountRequired => 403,
            ErrorKind::Malformed => 400,
            ErrorKind::OrderNotReady => 403,
            ErrorKind::RejectedIdentifier => 400,
            ErrorKind::ServerInternal => 500,
            ErrorKind::Unauthorized => 403,
            ErrorKind::UnsupportedIdentifier => 400,
        }
    }
}

/// An ACME problem, rendered as RFC 7807 problem+json.
#[derive(Debug, thiserror::Error)]
#[error("{}: {detail}", kind.label())]
pub struct Error {
    pub kind: ErrorKind,
    pub detail: String,
    /// Per-identifier subproblems (finalize can fail several at once).
    pub subproblems: Vec<Subproblem>,
}

/// A per-identifier problem inside a compound error.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Subproblem {
    #[serde(rename = "type")]
    pub type_urn: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<types::Identifier>,
}

impl Error {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
            subproblems: Vec::new(),
        }
    }

    pub fn malformed(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Malformed, detail)
    }

    pub fn unauthorized(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, detail)
    }

    pub fn server_internal(detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServerInternal, detail)
    }

    /// The full `urn:ietf:params:acme:error:<kind>` URN.
    pub fn type_urn(&self) -> String {
        format!("urn:ietf:params:acme:error:{}", self.kind.label())
    }
}

impl From<cerion_db::Error> for Error {
    fn from(e: cerion_db::Error) -> Self {
        match e {
            cerion_db::Error::NotFound { .. } => Error::malformed("resource not found"),
            cerion_db::Error::Conflict { .. } => {
                Error::new(ErrorKind::OrderNotReady, "resource was modified concurrently")
            }
            // detail stays bounded; backend errors are logged, not leaked
            other => {
                tracing::error!(error = %other, "database failure");
                Error::server_internal("database failure")
            }
        }
    }
}

impl From<cerion_provisioner::Error> for Error {
    fn from(e: cerion_provisioner::Error) -> Self {
        use cerion_provisioner::Error as PE;
        match e {
            PE::Malformed(d) => Error::malformed(d),
            PE::Unauthorized(d) | PE::Forbidden(d) => Error::unauthorized(d),
            PE::Transient(d) => {
                tracing::warn!(detail = %d, "transient upstream failure");
                Error::server_internal("upstream dependency failed")
            }
            other => {
                tracing::error!(error = %other, "provisioner failure");
                Error::server_internal("provisioner failure")
            }
        }
    }
}

/// Result type for ACME operations.
pub type Result<T> = std::result::Result<T, Error>;

/// A certificate minted for a finalized order.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    /// Hex serial, the key into the `certs` bucket.
    pub serial: String,
    /// Leaf plus chain, PEM.
    pub chain_pem: String,
    /// Leaf DER.
    pub leaf_der: Vec<u8>,
}

/// The issuance pipeline, as the ACME core sees it.
///
/// Implemented by the authority; keeps this crate free of a dependency on
/// the pipeline internals.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    /// Signs a finalized order's CSR under the named provisioner.
    ///
    /// `sans` are the order's identifiers in canonical form; the pipeline
    /// re-checks them against provisioner policy before signing.
    async fn sign_acme(
        &self,
        provisioner_name: &str,
        account_id: &str,
        csr_der: &[u8],
        sans: &[San],
    ) -> Result<IssuedCertificate>;

    /// Revokes a certificate by serial.
    ///
    /// `owner_account` carries the requesting ACME account when the request
    /// was signed by the account key; `None` means proof-of-possession by
    /// the certificate key.
    async fn revoke_acme(
        &self,
        serial: &str,
        reason_code: u8,
        owner_account: Option<&str>,
    ) -> Result<()>;

    /// Returns the PEM chain for an issued certificate, or `None` for
    /// unknown or revoked serials.
    async fn acme_certificate(&self, serial: &str, account_id: &str) -> Result<Option<String>>;
}

/// ACME-capable provisioners, as resolved from the registry.
#[derive(Clone)]
pub enum AcmeIssuer {
    Acme(Arc<AcmeProvisioner>),
    Wire(Arc<WireProvisioner>),
}

impl AcmeIssuer {
    /// The registry name of the provisioner.
    pub fn name(&self) -> &str {
        match self {
            AcmeIssuer::Acme(p) => p.name(),
            AcmeIssuer::Wire(p) => p.name(),
        }
    }

    /// Whether a challenge type is offered.
    pub fn challenge_enabled(&self, challenge: types::ChallengeType) -> bool {
        match self {
            AcmeIssuer::Acme(p) => p.challenge_enabled(challenge.as_str()),
            AcmeIssuer::Wire(_) => matches!(
                challenge,
                types::ChallengeType::WireOidc01 | types::ChallengeType::WireDpop01
            ),
        }
    }

    /// Whether new accounts must present External Account Binding.
    pub fn require_eab(&self) -> bool {
        match self {
            AcmeIssuer::Acme(p) => p.require_eab(),
            AcmeIssuer::Wire(_) => false,
        }
    }
}

/// Resolves provisioner names in ACME URLs to registry instances.
pub trait ProvisionerDirectory: Send + Sync {
    fn lookup(&self, name: &str) -> Option<AcmeIssuer>;
}
