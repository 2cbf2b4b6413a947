//! JWK provisioner: tokens signed by statically configured public keys.
//!
//! The classic "step token" flow: an operator holds the private half of a
//! configured JWK and mints short-lived, single-use tokens naming the
//! subject and SANs to certify. The provisioner may also distribute the
//! private key as a password-encrypted JWE blob for `GetEncryptedKey`.

use crate::jose::{self, Expected, Jwk, JwkSet};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use cerion_cert::{Policy, San};
use serde::{Deserialize, Serialize};

/// Kind-specific configuration for [`JwkProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JwkConfig {
    /// Trusted public keys; tokens must be signed by one of them.
    pub keys: Vec<Jwk>,
    /// Optional JWE blob holding the encrypted private key, distributed to
    /// clients through `GetEncryptedKey`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,
}

/// A provisioner trusting tokens signed by configured JWKs.
pub struct JwkProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    keys: JwkSet,
    encrypted_key: Option<String>,
}

impl JwkProvisioner {
    /// Builds the provisioner from its configuration.
    pub fn new(name: impl Into<String>, config: JwkConfig, claims: Claims, options: Options) -> Result<Self> {
        let name = name.into();
        if config.keys.is_empty() {
            return Err(Error::Config(format!("jwk provisioner {name}: no keys")));
        }
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        Ok(Self {
            id: format!("{}/{}", Kind::Jwk, name),
            name,
            claims,
            options,
            policy,
            keys: JwkSet { keys: config.keys },
            encrypted_key: config.encrypted_key,
        })
    }

    fn verify(&self, ctx: &AuthorizeContext<'_>, token: &str) -> Result<serde_json::Value> {
        let header = jose::decode_header(token)?;
        let key = self
            .keys
            .find(header.kid.as_deref())
            .ok_or_else(|| Error::Unauthorized(format!("unknown kid {:?}", header.kid)))?;
        jose::verify_compact(
            token,
            key,
            &Expected {
                issuer: Some(self.name.clone()),
                audience: Some(ctx.audience.to_string()),
                require_subject: true,
            },
        )
    }
}

#[async_trait]
impl Provisioner for JwkProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Jwk
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        ctx: &AuthorizeContext<'_>,
        token: &str,
    ) -> Result<SignOptions> {
        let claims = self.verify(ctx, token)?;

        let jti = claims
            .get("jti")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Unauthorized("token is missing jti".into()))?;
        let exp = claims.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);
        jose::consume_once(ctx.db, &self.id, jti, exp).await?;

        let subject = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let sans = claims.get("sans").and_then(|v| v.as_array()).map(|list| {
            list.iter()
                .filter_map(|v| v.as_str())
                .map(San::detect)
                .collect::<Vec<_>>()
        });

        Ok(SignOptions {
            template: self.options.template.clone(),
            template_data: self.options.template_data.clone(),
            token_claims: claims,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject,
            sans,
        })
    }

    async fn authorize_revoke(
        &self,
        ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(token) => {
                let claims = self.verify(ctx, token)?;
                if let Some(jti) = claims.get("jti").and_then(|v| v.as_str()) {
                    let exp = claims.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);
                    jose::consume_once(ctx.db, &self.id, jti, exp).await?;
                }
                Ok(())
            }
            RevokeProof::CertificateKey => Ok(()),
        }
    }

    fn encrypted_key(&self) -> Option<(String, String)> {
        let blob = self.encrypted_key.clone()?;
        let kid = self.keys.keys.first().and_then(|k| k.kid.clone())?;
        Some((kid, blob))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{base_claims, TestKey};
    use cerion_db::MemoryDb;

    const AUD: &str = "https://ca.example.com/1.0/sign";

    fn provisioner(key: &TestKey) -> JwkProvisioner {
        JwkProvisioner::new(
            "ops",
            JwkConfig {
                keys: vec![key.jwk.clone()],
                encrypted_key: Some("eyJhbGciOiJQQkVT...".into()),
            },
            Claims::default(),
            Options::default(),
        )
        .unwrap()
    }

    fn ctx(db: &MemoryDb) -> AuthorizeContext<'_> {
        AuthorizeContext {
            db,
            audience: AUD,
            certs: None,
        }
    }

    #[tokio::test]
    async fn authorize_sign_happy_path() {
        let key = TestKey::generate_p256(Some("k1"));
        let p = provisioner(&key);
        let db = MemoryDb::new();

        let mut claims = base_claims("ops", AUD, "dev-1.example.com");
        claims["sans"] = serde_json::json!(["dev-1.example.com", "10.0.0.8"]);
        let token = key.sign_claims(&claims);

        let opts = p.authorize_sign(&ctx(&db), &token).await.unwrap();
        assert_eq!(opts.subject.as_deref(), Some("dev-1.example.com"));
        assert_eq!(
            opts.sans,
            Some(vec![
                San::Dns("dev-1.example.com".into()),
                San::Ip("10.0.0.8".parse().unwrap()),
            ])
        );
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let key = TestKey::generate_p256(Some("k1"));
        let p = provisioner(&key);
        let db = MemoryDb::new();
        let token = key.sign_claims(&base_claims("ops", AUD, "dev-1"));

        p.authorize_sign(&ctx(&db), &token).await.unwrap();
        let err = p.authorize_sign(&ctx(&db), &token).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)), "{err}");
    }

    #[tokio::test]
    async fn rejects_wrong_audience_and_issuer() {
        let key = TestKey::generate_p256(Some("k1"));
        let p = provisioner(&key);
        let db = MemoryDb::new();

        let token = key.sign_claims(&base_claims("ops", "https://other.example.com", "dev-1"));
        assert!(p.authorize_sign(&ctx(&db), &token).await.is_err());

        let token = key.sign_claims(&base_claims("someone-else", AUD, "dev-1"));
        assert!(p.authorize_sign(&ctx(&db), &token).await.is_err());
    }

    #[tokio::test]
    async fn rejects_expired_token() {
        let key = TestKey::generate_p256(Some("k1"));
        let p = provisioner(&key);
        let db = MemoryDb::new();

        let mut claims = base_claims("ops", AUD, "dev-1");
        let past = chrono::Utc::now().timestamp() - 600;
        claims["exp"] = serde_json::json!(past);
        let token = key.sign_claims(&claims);
        assert!(p.authorize_sign(&ctx(&db), &token).await.is_err());
    }

    #[tokio::test]
    async fn rejects_unknown_key() {
        let trusted = TestKey::generate_p256(Some("k1"));
        let rogue = TestKey::generate_p256(Some("k2"));
        let p = provisioner(&trusted);
        let db = MemoryDb::new();

        let token = rogue.sign_claims(&base_claims("ops", AUD, "dev-1"));
        assert!(p.authorize_sign(&ctx(&db), &token).await.is_err());

        // same kid, different key: signature must fail
        let mut impostor = TestKey::generate_p256(Some("k1"));
        impostor.jwk.kid = Some("k1".into());
        let token = impostor.sign_claims(&base_claims("ops", AUD, "dev-1"));
        assert!(p.authorize_sign(&ctx(&db), &token).await.is_err());
    }

    #[tokio::test]
    async fn revoke_by_token_and_by_key() {
        let key = TestKey::generate_p256(Some("k1"));
        let p = provisioner(&key);
        let db = MemoryDb::new();

        let token = key.sign_claims(&base_claims("ops", AUD, "dev-1"));
        p.authorize_revoke(&ctx(&db), &RevokeProof::Token(&token))
            .await
            .unwrap();
        p.authorize_revoke(&ctx(&db), &RevokeProof::CertificateKey)
            .await
            .unwrap();
    }

    #[test]
    fn encrypted_key_is_exposed() {
        let key = TestKey::generate_p256(Some("k1"));
        let p = provisioner(&key);
        let (kid, blob) = p.encrypted_key().unwrap();
        assert_eq!(kid, "k1");
        assert!(blob.starts_with("eyJ"));
    }

    #[test]
    fn requires_at_least_one_key() {
        assert!(JwkProvisioner::new(
            "ops",
            JwkConfig::default(),
            Claims::default(),
            Options::default()
        )
        .is_err());
    }
}
