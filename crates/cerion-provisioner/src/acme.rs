//! ACME provisioner: configuration for the RFC 8555 front end.
//!
//! Proof for ACME issuance is the order's validated authorizations, not a
//! token, so `authorize_sign` here only assembles the issuance options.
//! The provisioner decides which challenge types are offered, whether
//! accounts require External Account Binding, and which vendor roots
//! anchor `device-attest-01` attestations.

use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use cerion_cert::Policy;
use serde::{Deserialize, Serialize};

/// Challenge types an ACME provisioner can offer.
pub const DEFAULT_CHALLENGES: &[&str] = &["http-01", "dns-01", "tls-alpn-01"];

/// Kind-specific configuration for [`AcmeProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AcmeConfig {
    /// Require External Account Binding on new-account.
    pub require_eab: bool,
    /// Offered challenge types; empty selects [`DEFAULT_CHALLENGES`].
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub challenges: Vec<String>,
    /// Accepted attestation formats for `device-attest-01`.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attestation_formats: Vec<String>,
    /// PEM bundle of vendor roots anchoring attestation chains.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attestation_roots: Option<String>,
    /// Force the first DNS identifier into the subject common name.
    pub force_cn: bool,
}

pub struct AcmeProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    config: AcmeConfig,
}

impl AcmeProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: AcmeConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        Ok(Self {
            id: format!("{}/{}", Kind::Acme, name),
            name,
            claims,
            options,
            policy,
            config,
        })
    }

    /// Whether new accounts must present External Account Binding.
    pub fn require_eab(&self) -> bool {
        self.config.require_eab
    }

    /// Whether a challenge type is offered by this provisioner.
    pub fn challenge_enabled(&self, challenge: &str) -> bool {
        if self.config.challenges.is_empty() {
            DEFAULT_CHALLENGES.contains(&challenge)
        } else {
            self.config.challenges.iter().any(|c| c == challenge)
        }
    }

    /// Whether an attestation format is accepted for `device-attest-01`.
    pub fn attestation_format_enabled(&self, format: &str) -> bool {
        self.config
            .attestation_formats
            .iter()
            .any(|f| f == format)
    }

    /// PEM bundle of attestation vendor roots.
    pub fn attestation_roots(&self) -> Option<&str> {
        self.config.attestation_roots.as_deref()
    }

    /// Whether the subject CN is forced from the first DNS identifier.
    pub fn force_cn(&self) -> bool {
        self.config.force_cn
    }
}

#[async_trait]
impl Provisioner for AcmeProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Acme
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        _ctx: &AuthorizeContext<'_>,
        order_ref: &str,
    ) -> Result<SignOptions> {
        // The front end has already validated the order's authorizations;
        // `order_ref` only feeds the audit trail.
        tracing::debug!(provisioner = %self.name, order = order_ref, "assembling ACME sign options");
        Ok(SignOptions {
            template: self.options.template.clone(),
            template_data: self.options.template_data.clone(),
            token_claims: serde_json::Value::Null,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject: None,
            sans: None,
        })
    }

    async fn authorize_revoke(
        &self,
        _ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            // ACME revocation proof is the account or certificate key
            // signature on the revoke-cert JWS, checked by the front end.
            RevokeProof::Token(_) | RevokeProof::CertificateKey => Ok(()),
        }
    }
}
