//! Shared test helpers: in-memory signing keys producing compact tokens.

use crate::jose::Jwk;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, Ed25519KeyPair, KeyPair};

pub(crate) enum TestKeyInner {
    P256(EcdsaKeyPair),
    Ed25519(Ed25519KeyPair),
}

/// A signing key plus its public JWK, for building test tokens.
pub(crate) struct TestKey {
    inner: TestKeyInner,
    rng: SystemRandom,
    pub jwk: Jwk,
}

impl TestKey {
    pub fn generate_p256(kid: Option<&str>) -> Self {
        let rng = SystemRandom::new();
        // JOSE ES256 uses fixed-width (r || s) signatures
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .unwrap();
        let kp = EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            pkcs8.as_ref(),
            &rng,
        )
        .unwrap();
        let point = kp.public_key().as_ref().to_vec();
        assert_eq!(point[0], 0x04);
        let mut jwk = Jwk::ec_p256(
            URL_SAFE_NO_PAD.encode(&point[1..33]),
            URL_SAFE_NO_PAD.encode(&point[33..65]),
        );
        jwk.kid = kid.map(str::to_string);
        Self {
            inner: TestKeyInner::P256(kp),
            rng,
            jwk,
        }
    }

    pub fn generate_ed25519(kid: Option<&str>) -> Self {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).unwrap();
        let kp = Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).unwrap();
        let jwk = Jwk {
            kty: "OKP".into(),
            crv: Some("Ed25519".into()),
            x: Some(URL_SAFE_NO_PAD.encode(kp.public_key().as_ref())),
            kid: kid.map(str::to_string),
            ..Default::default()
        };
        Self {
            inner: TestKeyInner::Ed25519(kp),
            rng,
            jwk,
        }
    }

    pub fn alg(&self) -> &'static str {
        match self.inner {
            TestKeyInner::P256(_) => "ES256",
            TestKeyInner::Ed25519(_) => "EdDSA",
        }
    }

    /// Signs `header`/`claims` into a compact JWS. Extra header members are
    /// preserved verbatim, so tests can set `x5c`, `x5s`, `nonce`, etc.
    pub fn sign(&self, header: &serde_json::Value, claims: &serde_json::Value) -> String {
        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string().as_bytes()),
            URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes()),
        );
        let sig = match &self.inner {
            TestKeyInner::P256(kp) => kp
                .sign(&self.rng, signing_input.as_bytes())
                .unwrap()
                .as_ref()
                .to_vec(),
            TestKeyInner::Ed25519(kp) => kp.sign(signing_input.as_bytes()).as_ref().to_vec(),
        };
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig))
    }

    /// Signs a standard token with the usual claim set.
    pub fn sign_claims(&self, claims: &serde_json::Value) -> String {
        let mut header = serde_json::json!({"alg": self.alg(), "typ": "JWT"});
        if let Some(kid) = &self.jwk.kid {
            header["kid"] = serde_json::Value::String(kid.clone());
        }
        self.sign(&header, claims)
    }
}

/// Standard claim set helper: `iss`/`aud`/`sub` plus fresh timestamps and a
/// unique `jti`.
pub(crate) fn base_claims(iss: &str, aud: &str, sub: &str) -> serde_json::Value {
    let now = chrono::Utc::now().timestamp();
    serde_json::json!({
        "iss": iss,
        "aud": aud,
        "sub": sub,
        "iat": now,
        "nbf": now,
        "exp": now + 300,
        "jti": uuid::Uuid::new_v4().to_string(),
    })
}
