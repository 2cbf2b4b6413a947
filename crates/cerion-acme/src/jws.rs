//! Flattened JWS parsing and verification.
//!
//! Every ACME request body is a flattened JWS JSON object. The protected
//! header must carry the anti-replay nonce, the canonical request URL, and
//! exactly one of `jwk` (new-account, revoke by certificate key) or `kid`
//! (everything else). Verification happens against whichever key the
//! caller resolves; URL and nonce checks live here so every handler gets
//! them uniformly.

use crate::{Error, ErrorKind, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cerion_provisioner::Jwk;
use serde::Deserialize;

/// A flattened JWS JSON object, as posted by clients.
#[derive(Debug, Clone, Deserialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// The decoded protected header.
#[derive(Debug, Clone, Deserialize)]
pub struct ProtectedHeader {
    pub alg: String,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub jwk: Option<Jwk>,
    #[serde(default)]
    pub kid: Option<String>,
}

impl ProtectedHeader {
    /// Enforces the jwk/kid exclusivity rule.
    pub fn key_binding(&self) -> Result<KeyBinding<'_>> {
        match (&self.jwk, &self.kid) {
            (Some(jwk), None) => Ok(KeyBinding::Jwk(jwk)),
            (None, Some(kid)) => Ok(KeyBinding::Kid(kid)),
            (Some(_), Some(_)) => Err(Error::malformed(
                "protected header carries both jwk and kid",
            )),
            (None, None) => Err(Error::malformed(
                "protected header carries neither jwk nor kid",
            )),
        }
    }
}

/// How the request binds to a key.
pub enum KeyBinding<'a> {
    /// The signing key itself is embedded (new-account, key rollover inner
    /// JWS, revoke by certificate key).
    Jwk(&'a Jwk),
    /// The account URL; the key comes from the account record.
    Kid(&'a str),
}

/// Parses a request body into the JWS and its protected header.
pub fn parse(body: &[u8]) -> Result<(FlattenedJws, ProtectedHeader)> {
    let jws: FlattenedJws = serde_json::from_slice(body)
        .map_err(|e| Error::malformed(format!("request is not a flattened JWS: {e}")))?;
    let header_raw = URL_SAFE_NO_PAD
        .decode(jws.protected.as_bytes())
        .map_err(|e| Error::malformed(format!("protected header: {e}")))?;
    let header: ProtectedHeader = serde_json::from_slice(&header_raw)
        .map_err(|e| Error::malformed(format!("protected header: {e}")))?;
    if header.alg.eq_ignore_ascii_case("none") {
        return Err(Error::new(
            ErrorKind::BadSignatureAlgorithm,
            "the none algorithm is not acceptable",
        ));
    }
    Ok((jws, header))
}

/// Verifies the signature with `key` and checks the `url` binding; returns
/// the decoded payload bytes (empty for POST-as-GET).
pub fn verify(jws: &FlattenedJws, header: &ProtectedHeader, key: &Jwk, expected_url: &str) -> Result<Vec<u8>> {
    let url = header
        .url
        .as_deref()
        .ok_or_else(|| Error::malformed("protected header is missing url"))?;
    if url != expected_url {
        return Err(Error::unauthorized(format!(
            "request url {url:?} does not match {expected_url:?}"
        )));
    }

    let alg: jsonwebtoken::Algorithm = header.alg.parse().map_err(|_| {
        Error::new(
            ErrorKind::BadSignatureAlgorithm,
            format!("unknown algorithm {:?}", header.alg),
        )
    })?;
    let allowed = key
        .allowed_algorithms()
        .map_err(|e| Error::new(ErrorKind::BadPublicKey, e.to_string()))?;
    if !allowed.contains(&alg) {
        return Err(Error::new(
            ErrorKind::BadSignatureAlgorithm,
            format!("algorithm {:?} does not match the key type", header.alg),
        ));
    }

    let message = format!("{}.{}", jws.protected, jws.payload);
    let decoding_key = key
        .decoding_key()
        .map_err(|e| Error::new(ErrorKind::BadPublicKey, e.to_string()))?;
    let ok = jsonwebtoken::crypto::verify(&jws.signature, message.as_bytes(), &decoding_key, alg)
        .map_err(|e| Error::malformed(format!("signature verification: {e}")))?;
    if !ok {
        return Err(Error::unauthorized("JWS signature is invalid"));
    }

    URL_SAFE_NO_PAD
        .decode(jws.payload.as_bytes())
        .map_err(|e| Error::malformed(format!("payload: {e}")))
}

/// Decodes a JSON payload, treating the empty payload as an error.
pub fn json_payload<T: serde::de::DeserializeOwned>(payload: &[u8]) -> Result<T> {
    if payload.is_empty() {
        return Err(Error::malformed("request payload must not be empty"));
    }
    serde_json::from_slice(payload).map_err(|e| Error::malformed(format!("payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::AccountKey;

    const URL: &str = "https://ca.example.com/acme/web/new-order";

    #[test]
    fn parse_and_verify_roundtrip() {
        let key = AccountKey::generate();
        let body = key.signed_request(URL, "nonce-1", None, &serde_json::json!({"n": 1}));
        let (jws, header) = parse(&body).unwrap();
        assert_eq!(header.nonce.as_deref(), Some("nonce-1"));

        let payload = verify(&jws, &header, &key.jwk(), URL).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn url_mismatch_is_rejected() {
        let key = AccountKey::generate();
        let body = key.signed_request(URL, "nonce-1", None, &serde_json::json!({}));
        let (jws, header) = parse(&body).unwrap();
        let err = verify(&jws, &header, &key.jwk(), "https://ca.example.com/acme/web/new-account")
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let key = AccountKey::generate();
        let body = key.signed_request(URL, "nonce-1", None, &serde_json::json!({"n": 1}));
        let (mut jws, header) = parse(&body).unwrap();
        jws.payload = base64::engine::general_purpose::URL_SAFE_NO_PAD
            .encode(serde_json::json!({"n": 2}).to_string());
        assert!(verify(&jws, &header, &key.jwk(), URL).is_err());
    }

    #[test]
    fn wrong_key_fails_verification() {
        let key = AccountKey::generate();
        let other = AccountKey::generate();
        let body = key.signed_request(URL, "nonce-1", None, &serde_json::json!({}));
        let (jws, header) = parse(&body).unwrap();
        assert!(verify(&jws, &header, &other.jwk(), URL).is_err());
    }

    #[test]
    fn alg_none_is_rejected() {
        let header = URL_SAFE_NO_PAD.encode(
            serde_json::json!({"alg": "none", "url": URL, "nonce": "n"}).to_string(),
        );
        let body = serde_json::json!({
            "protected": header,
            "payload": "",
            "signature": "",
        });
        let err = parse(body.to_string().as_bytes()).unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadSignatureAlgorithm);
    }

    #[test]
    fn jwk_kid_exclusivity() {
        let key = AccountKey::generate();
        // both jwk and kid
        let body = key.signed_request_raw(
            URL,
            "n",
            Some("https://ca.example.com/acme/web/account/a1"),
            true,
            &serde_json::json!({}),
        );
        let (_, header) = parse(&body).unwrap();
        assert!(header.key_binding().is_err());

        // neither
        let body = key.signed_request_raw(URL, "n", None, false, &serde_json::json!({}));
        let (_, header) = parse(&body).unwrap();
        assert!(header.key_binding().is_err());
    }

    #[test]
    fn empty_payload_is_post_as_get() {
        let key = AccountKey::generate();
        let body = key.signed_post_as_get(URL, "nonce-1", "https://ca.example.com/acme/web/account/a1");
        let (jws, header) = parse(&body).unwrap();
        let payload = verify(&jws, &header, &key.jwk(), URL).unwrap();
        assert!(payload.is_empty());
        assert!(json_payload::<serde_json::Value>(&payload).is_err());
    }
}
