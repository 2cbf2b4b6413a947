//! SCEP provisioner: shared-secret challenge for RFC 8894 enrollment.
//!
//! The PKCS#7 plumbing lives in the SCEP front end; this provisioner holds
//! the challenge password, the key-size floor, and the issuance options the
//! pipeline applies to enrolled CSRs.

use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use cerion_cert::Policy;
use serde::{Deserialize, Serialize};

/// Kind-specific configuration for [`ScepProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScepConfig {
    /// The challenge password clients must present in their CSR.
    pub challenge: String,
    /// Minimum RSA modulus size in bits accepted from clients.
    pub min_public_key_length: Option<u32>,
    /// Additional intermediate certificate (PEM) returned by `GetCACert`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_ca_cert: Option<String>,
}

pub struct ScepProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    config: ScepConfig,
}

impl ScepProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: ScepConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        if config.challenge.is_empty() {
            return Err(Error::Config(format!(
                "scep provisioner {name}: challenge must not be empty"
            )));
        }
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        Ok(Self {
            id: format!("{}/{}", Kind::Scep, name),
            name,
            claims,
            options,
            policy,
            config,
        })
    }

    /// Constant-time comparison of the presented challenge password.
    pub fn validate_challenge(&self, challenge: &str) -> Result<()> {
        ring::constant_time::verify_slices_are_equal(
            challenge.as_bytes(),
            self.config.challenge.as_bytes(),
        )
        .map_err(|_| Error::Unauthorized("invalid SCEP challenge password".into()))
    }

    /// Minimum accepted RSA modulus size (bits).
    pub fn min_public_key_length(&self) -> u32 {
        self.config.min_public_key_length.unwrap_or(2048)
    }

    /// Extra CA certificate advertised by `GetCACert`, if configured.
    pub fn additional_ca_cert(&self) -> Option<&str> {
        self.config.additional_ca_cert.as_deref()
    }

    /// Issuance options for a CSR whose challenge the SCEP front end has
    /// already validated.
    pub fn sign_options(&self) -> SignOptions {
        SignOptions {
            template: self.options.template.clone(),
            template_data: self.options.template_data.clone(),
            token_claims: serde_json::Value::Null,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject: None,
            sans: None,
        }
    }
}

#[async_trait]
impl Provisioner for ScepProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Scep
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        _ctx: &AuthorizeContext<'_>,
        token: &str,
    ) -> Result<SignOptions> {
        // For SCEP the "token" is the challenge password extracted from the
        // CSR by the front end.
        self.validate_challenge(token)?;
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
            RevokeProof::Token(challenge) => self.validate_challenge(challenge),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerion_db::MemoryDb;

    fn provisioner() -> ScepProvisioner {
        ScepProvisioner::new(
            "mdm",
            ScepConfig {
                challenge: "secret".into(),
                ..Default::default()
            },
            Claims::default(),
            Options::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn challenge_password_gates_enrollment() {
        let p = provisioner();
        let db = MemoryDb::new();
        let ctx = AuthorizeContext {
            db: &db,
            audience: "https://ca.example.com",
            certs: None,
        };

        p.authorize_sign(&ctx, "secret").await.unwrap();
        let err = p.authorize_sign(&ctx, "wrong").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn empty_challenge_is_a_config_error() {
        assert!(ScepProvisioner::new(
            "mdm",
            ScepConfig::default(),
            Claims::default(),
            Options::default()
        )
        .is_err());
    }

    #[test]
    fn key_length_floor_defaults_to_2048() {
        assert_eq!(provisioner().min_public_key_length(), 2048);
    }
}
