//! SSH-POP provisioner: proof of possession of a previously issued key.
//!
//! Tokens are signed with the private key of a certificate this CA issued
//! earlier; the `x5s` header names the certificate serial and the stored
//! certificate's public key verifies the signature. The provisioner only
//! authorizes renewal and revocation, never first issuance.

use crate::jose::{self, jwk_from_spki, Expected};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use x509_parser::prelude::FromDer;

/// Kind-specific configuration for [`SshPopProvisioner`] (none today).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SshPopConfig {}

pub struct SshPopProvisioner {
    id: String,
    name: String,
    claims: Claims,
    #[allow(dead_code)]
    options: Options,
}

impl SshPopProvisioner {
    pub fn new(
        name: impl Into<String>,
        _config: SshPopConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        claims.validate().map_err(Error::Config)?;
        Ok(Self {
            id: format!("{}/{}", Kind::Sshpop, name),
            name,
            claims,
            options,
        })
    }

    /// Verifies a possession token and returns the proven serial.
    async fn verify(&self, ctx: &AuthorizeContext<'_>, token: &str) -> Result<String> {
        let header = jose::decode_header(token)?;
        let serial = header
            .x5s
            .ok_or_else(|| Error::Malformed("token is missing the x5s serial header".into()))?;

        let certs = ctx.certs.ok_or_else(|| {
            Error::Config("sshpop requires a certificate lookup".into())
        })?;
        let der = certs
            .cert_der_by_serial(&serial)
            .await?
            .ok_or_else(|| Error::Unauthorized(format!("no issued certificate {serial}")))?;
        let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&der)
            .map_err(|e| Error::Malformed(format!("stored certificate {serial}: {e}")))?;

        let jwk = jwk_from_spki(cert.public_key())?;
        let claims = jose::verify_compact(
            token,
            &jwk,
            &Expected {
                issuer: None,
                audience: Some(ctx.audience.to_string()),
                require_subject: true,
            },
        )?;
        let sub = claims.get("sub").and_then(|v| v.as_str()).unwrap_or("");
        if sub != serial {
            return Err(Error::Unauthorized(format!(
                "token subject {sub:?} does not match certificate serial {serial}"
            )));
        }
        if let Some(jti) = claims.get("jti").and_then(|v| v.as_str()) {
            let exp = claims.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);
            jose::consume_once(ctx.db, &self.id, jti, exp).await?;
        }
        Ok(serial)
    }
}

#[async_trait]
impl Provisioner for SshPopProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Sshpop
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        _ctx: &AuthorizeContext<'_>,
        _token: &str,
    ) -> Result<SignOptions> {
        Err(Error::Forbidden(
            "sshpop only authorizes renewal and revocation".into(),
        ))
    }

    async fn authorize_revoke(
        &self,
        ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(token) => self.verify(ctx, token).await.map(|_| ()),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CertLookup;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    use cerion_db::MemoryDb;
    use ring::rand::SystemRandom;
    use ring::signature::{self, EcdsaKeyPair};

    const AUD: &str = "https://ca.example.com/1.0/revoke";

    struct OneCert {
        serial: String,
        der: Vec<u8>,
    }

    #[async_trait]
    impl CertLookup for OneCert {
        async fn cert_der_by_serial(&self, serial: &str) -> Result<Option<Vec<u8>>> {
            Ok((serial == self.serial).then(|| self.der.clone()))
        }
    }

    fn issue_cert(pkcs8: &[u8]) -> Vec<u8> {
        let kp = rcgen::KeyPair::try_from(pkcs8).unwrap();
        let mut params = rcgen::CertificateParams::new(vec![]).unwrap();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "host-1");
        params.self_signed(&kp).unwrap().der().to_vec()
    }

    fn possession_token(pkcs8: &[u8], serial: &str, aud: &str) -> String {
        let rng = SystemRandom::new();
        let kp =
            EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, pkcs8, &rng)
                .unwrap();
        let header = serde_json::json!({"alg": "ES256", "x5s": serial});
        let claims = crate::testutil::base_claims("host-1", aud, serial);
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string().as_bytes()),
            URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes()),
        );
        let sig = kp.sign(&rng, signing_input.as_bytes()).unwrap();
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig.as_ref()))
    }

    #[tokio::test]
    async fn possession_token_authorizes_revocation() {
        let rng = SystemRandom::new();
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .unwrap()
                .as_ref()
                .to_vec();
        let lookup = OneCert {
            serial: "0a1b2c".into(),
            der: issue_cert(&pkcs8),
        };
        let db = MemoryDb::new();
        let ctx = AuthorizeContext {
            db: &db,
            audience: AUD,
            certs: Some(&lookup),
        };
        let p = SshPopProvisioner::new(
            "pop",
            SshPopConfig::default(),
            Claims::default(),
            Options::default(),
        )
        .unwrap();

        let token = possession_token(&pkcs8, "0a1b2c", AUD);
        p.authorize_revoke(&ctx, &RevokeProof::Token(&token))
            .await
            .unwrap();

        // unknown serial fails
        let token = possession_token(&pkcs8, "ffffff", AUD);
        assert!(p
            .authorize_revoke(&ctx, &RevokeProof::Token(&token))
            .await
            .is_err());

        // a different key fails against the stored certificate
        let other_pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .unwrap()
                .as_ref()
                .to_vec();
        let token = possession_token(&other_pkcs8, "0a1b2c", AUD);
        assert!(p
            .authorize_revoke(&ctx, &RevokeProof::Token(&token))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn sign_is_always_forbidden() {
        let db = MemoryDb::new();
        let ctx = AuthorizeContext {
            db: &db,
            audience: AUD,
            certs: None,
        };
        let p = SshPopProvisioner::new(
            "pop",
            SshPopConfig::default(),
            Claims::default(),
            Options::default(),
        )
        .unwrap();
        assert!(matches!(
            p.authorize_sign(&ctx, "anything").await,
            Err(Error::Forbidden(_))
        ));
    }
}
