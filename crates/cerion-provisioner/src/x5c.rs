//! X5C provisioner: tokens signed by a certificate chained to configured
//! roots.
//!
//! The token header carries the signing certificate chain (`x5c`); the
//! chain must verify to one of the provisioner's root certificates and the
//! token signature must verify with the leaf's public key.

use crate::jose::{self, jwk_from_spki, Expected};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cerion_cert::{Policy, San};
use serde::{Deserialize, Serialize};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Kind-specific configuration for [`X5cProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct X5cConfig {
    /// PEM bundle of trusted root certificates.
    pub roots: String,
}

/// A provisioner trusting certificate-chain-signed tokens.
pub struct X5cProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    root_ders: Vec<Vec<u8>>,
}

impl X5cProvisioner {
    /// Builds the provisioner, parsing the configured root bundle.
    pub fn new(
        name: impl Into<String>,
        config: X5cConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        let root_ders = pem_to_ders(&config.roots)?;
        if root_ders.is_empty() {
            return Err(Error::Config(format!("x5c provisioner {name}: no roots")));
        }
        // fail fast on roots that do not parse
        for der in &root_ders {
            X509Certificate::from_der(der)
                .map_err(|e| Error::Config(format!("x5c provisioner {name}: bad root: {e}")))?;
        }
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        Ok(Self {
            id: format!("{}/{}", Kind::X5c, name),
            name,
            claims,
            options,
            policy,
            root_ders,
        })
    }

    /// Verifies the `x5c` chain and the token signature; returns the claims.
    fn verify(&self, ctx: &AuthorizeContext<'_>, token: &str) -> Result<serde_json::Value> {
        let header = jose::decode_header(token)?;
        let chain_b64 = header
            .x5c
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Malformed("token is missing the x5c chain".into()))?;
        let chain_der: Vec<Vec<u8>> = chain_b64
            .iter()
            .map(|entry| {
                STANDARD
                    .decode(entry.as_bytes())
                    .map_err(|e| Error::Malformed(format!("x5c entry: {e}")))
            })
            .collect::<Result<_>>()?;

        let mut chain = Vec::with_capacity(chain_der.len());
        for der in &chain_der {
            let (_, cert) = X509Certificate::from_der(der)
                .map_err(|e| Error::Malformed(format!("x5c certificate: {e}")))?;
            if !cert.validity().is_valid() {
                return Err(Error::Unauthorized(format!(
                    "certificate {} is not currently valid",
                    cert.subject()
                )));
            }
            chain.push(cert);
        }

        // Each certificate must be signed by its successor; the last one by
        // one of the configured roots.
        for pair in chain.windows(2) {
            pair[0]
                .verify_signature(Some(pair[1].public_key()))
                .map_err(|_| Error::Unauthorized("broken x5c chain".into()))?;
        }
        let last = chain.last().expect("chain is non-empty");
        let anchored = self.root_ders.iter().any(|root_der| {
            X509Certificate::from_der(root_der)
                .map(|(_, root)| {
                    root.subject() == last.issuer()
                        && last.verify_signature(Some(root.public_key())).is_ok()
                })
                .unwrap_or(false)
        });
        if !anchored {
            return Err(Error::Unauthorized(
                "x5c chain does not terminate at a configured root".into(),
            ));
        }

        let leaf_jwk = jwk_from_spki(chain[0].public_key())?;
        jose::verify_compact(
            token,
            &leaf_jwk,
            &Expected {
                issuer: None,
                audience: Some(ctx.audience.to_string()),
                require_subject: true,
            },
        )
    }
}

fn pem_to_ders(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut body = String::new();
    let mut inside = false;
    for line in pem.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN CERTIFICATE-----") {
            inside = true;
            body.clear();
        } else if line.starts_with("-----END CERTIFICATE-----") {
            if inside {
                let der = STANDARD
                    .decode(body.as_bytes())
                    .map_err(|e| Error::Config(format!("invalid PEM body: {e}")))?;
                out.push(der);
            }
            inside = false;
        } else if inside {
            body.push_str(line);
        }
    }
    Ok(out)
}

#[async_trait]
impl Provisioner for X5cProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::X5c
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
