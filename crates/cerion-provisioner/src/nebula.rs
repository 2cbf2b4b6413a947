//! Nebula provisioner: tokens signed by a Nebula network's CA keys.
//!
//! Nebula CAs sign with Ed25519; the provisioner is configured with the
//! network's curve25519 public keys and accepts EdDSA tokens minted by
//! hosts holding a Nebula credential. SANs are taken from the token, which
//! names the host's overlay IP and DNS name.

use crate::jose::{self, Expected, Jwk};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use cerion_cert::{Policy, San};
use serde::{Deserialize, Serialize};

/// Kind-specific configuration for [`NebulaProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NebulaConfig {
    /// Base64url Ed25519 public keys of the Nebula CA(s).
    pub roots: Vec<String>,
}

pub struct NebulaProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    keys: Vec<Jwk>,
}

impl NebulaProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: NebulaConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        if config.roots.is_empty() {
            return Err(Error::Config(format!("nebula provisioner {name}: no roots")));
        }
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        let keys = config
            .roots
            .iter()
            .map(|x| Jwk {
                kty: "OKP".into(),
                crv: Some("Ed25519".into()),
                x: Some(x.clone()),
                ..Default::default()
            })
            .collect();
        Ok(Self {
            id: format!("{}/{}", Kind::Nebula, name),
            name,
            claims,
            options,
            policy,
            keys,
        })
    }

    fn verify(&self, ctx: &AuthorizeContext<'_>, token: &str) -> Result<serde_json::Value> {
        let expected = Expected {
            issuer: None,
            audience: Some(ctx.audience.to_string()),
            require_subject: true,
        };
        let mut last = Error::Unauthorized("no nebula root verified the token".into());
        for key in &self.keys {
            match jose::verify_compact(token, key, &expected) {
                Ok(claims) => return Ok(claims),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[async_trait]
impl Provisioner for NebulaProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Nebula
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
            RevokeProof::Token(token) => self.verify(ctx, token).map(|_| ()),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{base_claims, TestKey};
    use cerion_db::MemoryDb;

    const AUD: &str = "https://ca.example.com/1.0/sign";

    #[tokio::test]
    async fn eddsa_token_from_known_root() {
        let key = TestKey::generate_ed25519(None);
        let p = NebulaProvisioner::new(
            "mesh",
            NebulaConfig {
                roots: vec![key.jwk.x.clone().unwrap()],
            },
            Claims::default(),
            Options::default(),
        )
        .unwrap();
        let db = MemoryDb::new();
        let ctx = AuthorizeContext {
            db: &db,
            audience: AUD,
            certs: None,
        };

        let mut claims = base_claims("nebula", AUD, "host-1");
        claims["sans"] = serde_json::json!(["host-1.mesh.internal", "192.168.100.7"]);
        let token = key.sign_claims(&claims);

        let opts = p.authorize_sign(&ctx, &token).await.unwrap();
        assert_eq!(opts.subject.as_deref(), Some("host-1"));
        assert_eq!(
            opts.sans,
            Some(vec![
                San::Dns("host-1.mesh.internal".into()),
                San::Ip("192.168.100.7".parse().unwrap()),
            ])
        );

        // single use
        assert!(p.authorize_sign(&ctx, &token).await.is_err());
    }

    #[tokio::test]
    async fn unknown_root_is_rejected() {
        let trusted = TestKey::generate_ed25519(None);
        let rogue = TestKey::generate_ed25519(None);
        let p = NebulaProvisioner::new(
            "mesh",
            NebulaConfig {
                roots: vec![trusted.jwk.x.clone().unwrap()],
            },
            Claims::default(),
            Options::default(),
        )
        .unwrap();
        let db = MemoryDb::new();
        let ctx = AuthorizeContext {
            db: &db,
            audience: AUD,
            certs: None,
        };

        let token = rogue.sign_claims(&base_claims("nebula", AUD, "host-1"));
        assert!(p.authorize_sign(&ctx, &token).await.is_err());
    }
}
