//! Kubernetes service-account provisioner.
//!
//! Validates projected service-account tokens against the cluster's public
//! keys (configured statically; clusters rarely expose their JWKS outside
//! the API server). The token subject
//! (`system:serviceaccount:<ns>:<name>`) becomes the certificate subject.

use crate::jose::{self, Expected, JwkSet};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use cerion_cert::Policy;
use serde::{Deserialize, Serialize};

const SA_ISSUER: &str = "kubernetes/serviceaccount";
const SA_SUBJECT_PREFIX: &str = "system:serviceaccount:";

/// Kind-specific configuration for [`K8sSaProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct K8sSaConfig {
    /// Cluster signing keys.
    pub jwks: JwkSet,
    /// Expected audience of projected tokens; unchecked when `None`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
}

pub struct K8sSaProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    config: K8sSaConfig,
}

impl K8sSaProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: K8sSaConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        if config.jwks.keys.is_empty() {
            return Err(Error::Config(format!("k8ssa provisioner {name}: no keys")));
        }
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        Ok(Self {
            id: format!("{}/{}", Kind::K8ssa, name),
            name,
            claims,
            options,
            policy,
            config,
        })
    }

    fn verify(&self, token: &str) -> Result<serde_json::Value> {
        let header = jose::decode_header(token)?;
        let key = self
            .config
            .jwks
            .find(header.kid.as_deref())
            .ok_or_else(|| Error::Unauthorized(format!("unknown kid {:?}", header.kid)))?;
        let claims = jose::verify_compact(
            token,
            key,
            &Expected {
                issuer: Some(SA_ISSUER.to_string()),
                audience: self.config.audience.clone(),
                require_subject: true,
            },
        )?;
        let sub = claims.get("sub").and_then(|v| v.as_str()).unwrap_or("");
        if !sub.starts_with(SA_SUBJECT_PREFIX) {
            return Err(Error::Unauthorized(format!(
                "subject {sub:?} is not a service account"
            )));
        }
        Ok(claims)
    }
}

#[async_trait]
impl Provisioner for K8sSaProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::K8ssa
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        _ctx: &AuthorizeContext<'_>,
        token: &str,
    ) -> Result<SignOptions> {
        let claims = self.verify(token)?;
        // Service-account tokens are reused by the workload for their whole
        // lifetime; single-use bookkeeping does not apply here.
        let subject = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        Ok(SignOptions {
            template: self.options.template.clone(),
            template_data: self.options.template_data.clone(),
            token_claims: claims,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject,
            sans: None,
        })
    }

    async fn authorize_revoke(
        &self,
        _ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(token) => self.verify(token).map(|_| ()),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{base_claims, TestKey};
    use cerion_db::MemoryDb;

    fn provisioner(key: &TestKey) -> K8sSaProvisioner {
        K8sSaProvisioner::new(
            "kube",
            K8sSaConfig {
                jwks: JwkSet {
                    keys: vec![key.jwk.clone()],
                },
                audience: None,
            },
            Claims::default(),
            Options::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn service_account_token_is_accepted() {
        let key = TestKey::generate_p256(Some("kube-1"));
        let p = provisioner(&key);
        let db = MemoryDb::new();
        let ctx = AuthorizeContext {
            db: &db,
            audience: "https://ca.example.com",
            certs: None,
        };

        let mut claims = base_claims(SA_ISSUER, "", "system:serviceaccount:apps:worker");
        claims.as_object_mut().unwrap().remove("aud");
        let token = key.sign_claims(&claims);

        let opts = p.authorize_sign(&ctx, &token).await.unwrap();
        assert_eq!(
            opts.subject.as_deref(),
            Some("system:serviceaccount:apps:worker")
        );
        // the token is reusable
        p.authorize_sign(&ctx, &token).await.unwrap();
    }

    #[tokio::test]
    async fn non_service_account_subject_is_rejected() {
        let key = TestKey::generate_p256(Some("kube-1"));
        let p = provisioner(&key);
        let db = MemoryDb::new();
        let ctx = AuthorizeContext {
            db: &db,
            audience: "https://ca.example.com",
            certs: None,
        };

        let mut claims = base_claims(SA_ISSUER, "", "system:node:worker-0");
        claims.as_object_mut().unwrap().remove("aud");
        let err = p
            .authorize_sign(&ctx, &key.sign_claims(&claims))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }
}
