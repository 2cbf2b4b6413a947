//! Pluggable identity brokers for the Cerion CA.
//!
//! A provisioner binds a proof of identity to an issuance policy: it
//! validates whatever credential a client presents (a signed token, an
//! instance-identity document, an ACME challenge, a SCEP challenge
//! password) and returns the template data, policy, and lifetime bounds the
//! issuance pipeline enforces.
//!
//! # Components
//!
//! - [`claims`] - per-provisioner certificate claims (lifetimes, key policy)
//! - [`options`] - template and policy options shared by all kinds
//! - [`jose`] - JWK handling, compact JWS verification, jti single-use
//! - [`jwk`] / [`oidc`] / [`x5c`] / [`k8s_sa`] / [`nebula`] - token brokers
//! - [`cloud`] - AWS / GCP / Azure instance-identity brokers
//! - [`acme`] / [`scep`] - enrollment-protocol brokers
//! - [`sshpop`] - proof-of-possession broker for renew/revoke
//! - [`wire`] - Wire messenger client identities (OIDC + DPoP)

pub mod acme;
pub mod claims;
pub mod cloud;
pub mod jose;
pub mod jwk;
pub mod k8s_sa;
pub mod nebula;
pub mod oidc;
pub mod options;
pub mod scep;
pub mod sshpop;
pub mod wire;
pub mod x5c;

#[cfg(test)]
pub(crate) mod testutil;

pub use acme::{AcmeConfig, AcmeProvisioner};
pub use claims::{Claims, KeyType};
pub use cloud::{
    AwsConfig, AwsProvisioner, AzureConfig, AzureProvisioner, GcpConfig, GcpProvisioner,
};
pub use jose::{Jwk, JwkSet};
pub use jwk::{JwkConfig, JwkProvisioner};
pub use k8s_sa::{K8sSaConfig, K8sSaProvisioner};
pub use nebula::{NebulaConfig, NebulaProvisioner};
pub use oidc::{OidcConfig, OidcProvisioner};
pub use options::Options;
pub use scep::{ScepConfig, ScepProvisioner};
pub use sshpop::{SshPopConfig, SshPopProvisioner};
pub use wire::{ClientId, DeviceId, UserId, WireConfig, WireProvisioner};
pub use x5c::{X5cConfig, X5cProvisioner};

use async_trait::async_trait;
use cerion_cert::{Policy, San};
use cerion_db::Db;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Errors returned by provisioner authorization.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The credential was structurally malformed.
    #[error("malformed credential: {0}")]
    Malformed(String),

    /// Proof validation failed: bad signature, wrong audience, expired,
    /// replayed, or untrusted signer.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The credential is valid but the request violates provisioner claims
    /// or configuration.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// An upstream dependency (JWKS endpoint, discovery document) failed;
    /// retryable.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// The provisioner configuration is invalid.
    #[error("invalid provisioner configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Db(#[from] cerion_db::Error),

    #[error(transparent)]
    Policy(#[from] cerion_cert::Error),
}

/// Result type for provisioner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The provisioner kinds Cerion knows how to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Kind {
    Jwk,
    Oidc,
    X5c,
    K8ssa,
    Nebula,
    Aws,
    Gcp,
    Azure,
    Acme,
    Scep,
    Sshpop,
    Wire,
}

impl Kind {
    /// Stable lower-case name, used in provisioner IDs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Jwk => "jwk",
            Kind::Oidc => "oidc",
            Kind::X5c => "x5c",
            Kind::K8ssa => "k8ssa",
            Kind::Nebula => "nebula",
            Kind::Aws => "aws",
            Kind::Gcp => "gcp",
            Kind::Azure => "azure",
            Kind::Acme => "acme",
            Kind::Scep => "scep",
            Kind::Sshpop => "sshpop",
            Kind::Wire => "wire",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Looks up previously issued certificates, for proof-of-possession flows.
///
/// Implemented by the authority; provisioners must not depend on the
/// certificate record layout.
#[async_trait]
pub trait CertLookup: Send + Sync {
    /// Returns the DER of the issued, unrevoked certificate with this
    /// serial, if any.
    async fn cert_der_by_serial(&self, serial: &str) -> Result<Option<Vec<u8>>>;
}

/// Ambient state authorization runs against.
pub struct AuthorizeContext<'a> {
    /// Store used for single-use token bookkeeping.
    pub db: &'a dyn Db,
    /// The audience URL tokens must be addressed to (this CA).
    pub audience: &'a str,
    /// Certificate lookup for proof-of-possession provisioners.
    pub certs: Option<&'a dyn CertLookup>,
}

/// What the pipeline needs to mint a certificate after authorization.
#[derive(Debug, Clone, Default)]
pub struct SignOptions {
    /// Leaf template; `None` selects the default.
    pub template: Option<String>,
    /// Provisioner-configured template data.
    pub template_data: serde_json::Map<String, serde_json::Value>,
    /// Validated (and possibly transformed) token claims for the template.
    pub token_claims: serde_json::Value,
    /// Compiled issuance policy.
    pub policy: Policy,
    /// Resolved certificate claims (lifetimes, key policy, renewal flags).
    pub claims: Claims,
    /// When set, the CSR subject common name must equal this value.
    pub subject: Option<String>,
    /// When set, the CSR SANs must be a subset of these.
    pub sans: Option<Vec<San>>,
}

/// Summary of a certificate presented for renewal or revocation.
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub serial: String,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub sans: Vec<San>,
    /// ID of the provisioner that authorized the original issuance.
    pub provisioner_id: String,
}

/// Proof presented with a revocation request.
pub enum RevokeProof<'a> {
    /// A provisioner token naming the serial to revoke.
    Token(&'a str),
    /// Possession of the certificate's own key, already verified by the
    /// transport layer (ACME revoke-cert signed with the certificate key).
    CertificateKey,
}

/// The enrollment contract every identity broker implements.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Stable identifier, unique within the registry.
    fn id(&self) -> &str;

    /// Human-chosen name, unique within the registry.
    fn name(&self) -> &str;

    /// The provisioner kind.
    fn kind(&self) -> Kind;

    /// The configured certificate claims.
    fn claims(&self) -> &Claims;

    /// Validates an enrollment proof and returns the issuance bundle.
    async fn authorize_sign(&self, ctx: &AuthorizeContext<'_>, token: &str)
        -> Result<SignOptions>;

    /// Decides whether the bearer of a still-valid certificate may renew it.
    async fn authorize_renew(&self, ctx: &AuthorizeContext<'_>, cert: &LeafInfo) -> Result<()> {
        let _ = ctx;
        let claims = self.claims();
        if claims.disable_renewal {
            return Err(Error::Forbidden(format!(
                "renewal is disabled for provisioner {}",
                self.name()
            )));
        }
        if !claims.allow_renewal_after_expiry && cert.not_after < Utc::now() {
            return Err(Error::Forbidden(format!(
                "certificate {} is expired",
                cert.serial
            )));
        }
        Ok(())
    }

    /// Validates a revocation proof.
    async fn authorize_revoke(
        &self,
        ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()>;

    /// For provisioners that distribute a JWE-encrypted private key:
    /// `(kid, encrypted key)`.
    fn encrypted_key(&self) -> Option<(String, String)> {
        None
    }
}

/// Loadable provisioner configuration, persisted in the `provisioners`
/// bucket. Each mutation bumps `config_version`; the registry swaps whole
/// instances, never mutates in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionerRecord {
    pub id: String,
    pub name: String,
    pub kind: Kind,
    #[serde(default)]
    pub config_version: u64,
    #[serde(default)]
    pub claims: Claims,
    #[serde(default)]
    pub options: Options,
    /// Kind-specific configuration, decoded by the matching constructor.
    #[serde(default)]
    pub config: serde_json::Value,
}
