//! Test helpers: ACME account keys that sign flattened JWS requests.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cerion_provisioner::Jwk;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair};

/// A P-256 ACME account key.
pub(crate) struct AccountKey {
    kp: EcdsaKeyPair,
    rng: SystemRandom,
    jwk: Jwk,
}

impl AccountKey {
    pub fn generate() -> Self {
        let rng = SystemRandom::new();
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
        let jwk = Jwk::ec_p256(
            URL_SAFE_NO_PAD.encode(&point[1..33]),
            URL_SAFE_NO_PAD.encode(&point[33..65]),
        );
        Self { kp, rng, jwk }
    }

    pub fn jwk(&self) -> Jwk {
        self.jwk.clone()
    }

    pub fn thumbprint(&self) -> String {
        self.jwk.thumbprint().unwrap()
    }

    fn sign_parts(&self, protected: &serde_json::Value, payload_b64: &str) -> Vec<u8> {
        let protected_b64 = URL_SAFE_NO_PAD.encode(protected.to_string().as_bytes());
        let message = format!("{protected_b64}.{payload_b64}");
        let sig = self.kp.sign(&self.rng, message.as_bytes()).unwrap();
        serde_json::json!({
            "protected": protected_b64,
            "payload": payload_b64,
            "signature": URL_SAFE_NO_PAD.encode(sig.as_ref()),
        })
        .to_string()
        .into_bytes()
    }

    /// A signed request carrying `jwk` (kid == None) or `kid`.
    pub fn signed_request(
        &self,
        url: &str,
        nonce: &str,
        kid: Option<&str>,
        payload: &serde_json::Value,
    ) -> Vec<u8> {
        let mut protected = serde_json::json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        match kid {
            Some(kid) => protected["kid"] = serde_json::json!(kid),
            None => protected["jwk"] = serde_json::to_value(&self.jwk).unwrap(),
        }
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        self.sign_parts(&protected, &payload_b64)
    }

    /// Like [`Self::signed_request`] but with explicit control over which
    /// key bindings appear (for exclusivity tests).
    pub fn signed_request_raw(
        &self,
        url: &str,
        nonce: &str,
        kid: Option<&str>,
        include_jwk: bool,
        payload: &serde_json::Value,
    ) -> Vec<u8> {
        let mut protected = serde_json::json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        if let Some(kid) = kid {
            protected["kid"] = serde_json::json!(kid);
        }
        if include_jwk {
            protected["jwk"] = serde_json::to_value(&self.jwk).unwrap();
        }
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload.to_string().as_bytes());
        self.sign_parts(&protected, &payload_b64)
    }

    /// POST-as-GET: empty payload, kid binding.
    pub fn signed_post_as_get(&self, url: &str, nonce: &str, kid: &str) -> Vec<u8> {
        let protected = serde_json::json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
            "kid": kid,
        });
        self.sign_parts(&protected, "")
    }
}
