//! Shared JOSE plumbing: JWKs, compact JWS verification, key sets, and
//! single-use token bookkeeping.
//!
//! Every token-based provisioner funnels through [`verify_compact`]: decode
//! the header, locate the trust anchor, verify the signature, then check
//! the standard claims with a bounded clock skew. Replay protection is
//! persisted in the database (`used_tokens` bucket) so it survives process
//! restarts and is shared across replicas.

use crate::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cerion_db::{Bucket, Db};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

/// Maximum tolerated clock skew when validating `nbf`/`exp`.
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(60);

/// A JSON Web Key, restricted to the key types Cerion verifies with.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    /// EC / OKP curve name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crv: Option<String>,
    /// EC / OKP x coordinate (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<String>,
    /// EC y coordinate (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<String>,
    /// RSA modulus (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<String>,
    /// RSA exponent (base64url).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub e: Option<String>,
}

impl Jwk {
    /// Builds a P-256 EC key from base64url coordinates.
    pub fn ec_p256(x: impl Into<String>, y: impl Into<String>) -> Self {
        Self {
            kty: "EC".into(),
            crv: Some("P-256".into()),
            x: Some(x.into()),
            y: Some(y.into()),
            ..Default::default()
        }
    }

    /// The algorithms a key of this type may sign with.
    pub fn allowed_algorithms(&self) -> Result<Vec<Algorithm>> {
        match (self.kty.as_str(), self.crv.as_deref()) {
            ("EC", Some("P-256")) => Ok(vec![Algorithm::ES256]),
            ("EC", Some("P-384")) => Ok(vec![Algorithm::ES384]),
            ("OKP", Some("Ed25519")) => Ok(vec![Algorithm::EdDSA]),
            ("RSA", _) => Ok(vec![Algorithm::RS256, Algorithm::RS384, Algorithm::RS512]),
            (kty, crv) => Err(Error::Malformed(format!(
                "unsupported key type {kty}/{crv:?}"
            ))),
        }
    }

    /// Converts into a jsonwebtoken decoding key.
    pub fn decoding_key(&self) -> Result<DecodingKey> {
        let missing = |field: &str| Error::Malformed(format!("JWK missing {field}"));
        match self.kty.as_str() {
            "EC" => {
                let x = self.x.as_deref().ok_or_else(|| missing("x"))?;
                let y = self.y.as_deref().ok_or_else(|| missing("y"))?;
                DecodingKey::from_ec_components(x, y)
                    .map_err(|e| Error::Malformed(format!("invalid EC JWK: {e}")))
            }
            "OKP" => {
                let x = self.x.as_deref().ok_or_else(|| missing("x"))?;
                DecodingKey::from_ed_components(x)
                    .map_err(|e| Error::Malformed(format!("invalid OKP JWK: {e}")))
            }
            "RSA" => {
                let n = self.n.as_deref().ok_or_else(|| missing("n"))?;
                let e = self.e.as_deref().ok_or_else(|| missing("e"))?;
                DecodingKey::from_rsa_components(n, e)
                    .map_err(|e| Error::Malformed(format!("invalid RSA JWK: {e}")))
            }
            other => Err(Error::Malformed(format!("unsupported key type {other}"))),
        }
    }

    /// RFC 7638 thumbprint: SHA-256 over the canonical required members,
    /// base64url-encoded.
    pub fn thumbprint(&self) -> Result<String> {
        let missing = |field: &str| Error::Malformed(format!("JWK missing {field}"));
        // Keys are serialized in lexicographic member order, as the RFC
        // requires; building the string by hand keeps that explicit.
        let canonical = match self.kty.as_str() {
            "EC" => format!(
                r#"{{"crv":{},"kty":"EC","x":{},"y":{}}}"#,
                json_str(self.crv.as_deref().ok_or_else(|| missing("crv"))?),
                json_str(self.x.as_deref().ok_or_else(|| missing("x"))?),
                json_str(self.y.as_deref().ok_or_else(|| missing("y"))?),
            ),
            "OKP" => format!(
                r#"{{"crv":{},"kty":"OKP","x":{}}}"#,
                json_str(self.crv.as_deref().ok_or_else(|| missing("crv"))?),
                json_str(self.x.as_deref().ok_or_else(|| missing("x"))?),
            ),
            "RSA" => format!(
                r#"{{"e":{},"kty":"RSA","n":{}}}"#,
                json_str(self.e.as_deref().ok_or_else(|| missing("e"))?),
                json_str(self.n.as_deref().ok_or_else(|| missing("n"))?),
            ),
            other => return Err(Error::Malformed(format!("unsupported key type {other}"))),
        };
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes())))
    }
}

fn json_str(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

/// A JSON Web Key Set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JwkSet {
    pub keys: Vec<Jwk>,
}

impl JwkSet {
    /// Finds a key by `kid`; with exactly one key and no `kid`, that key.
    pub fn find(&self, kid: Option<&str>) -> Option<&Jwk> {
        match kid {
            Some(kid) => self.keys.iter().find(|k| k.kid.as_deref() == Some(kid)),
            None if self.keys.len() == 1 => self.keys.first(),
            None => None,
        }
    }
}

/// The JOSE header of a compact token, decoded without verification.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    #[serde(default)]
    pub kid: Option<String>,
    /// Certificate chain, base64 (standard) DER entries.
    #[serde(default)]
    pub x5c: Option<Vec<String>>,
    /// Serial of a previously issued certificate (proof-of-possession).
    #[serde(default)]
    pub x5s: Option<String>,
}

/// Splits a compact JWS and decodes its header.
pub fn decode_header(token: &str) -> Result<TokenHeader> {
    let header_b64 = token
        .split('.')
        .next()
        .filter(|p| !p.is_empty())
        .ok_or_else(|| Error::Malformed("empty token".into()))?;
    let raw = URL_SAFE_NO_PAD
        .decode(header_b64)
        .map_err(|e| Error::Malformed(format!("token header: {e}")))?;
    serde_json::from_slice(&raw).map_err(|e| Error::Malformed(format!("token header: {e}")))
}

/// Claim expectations for [`verify_compact`].
#[derive(Debug, Clone, Default)]
pub struct Expected {
    /// Required `iss` value.
    pub issuer: Option<String>,
    /// Required `aud` value (exact match).
    pub audience: Option<String>,
    /// Require a non-empty `sub`.
    pub require_subject: bool,
}

/// Verifies a compact JWS against a trust-anchor JWK and returns the claims.
///
/// Checks the signature, the algorithm against the key type, `exp`/`nbf`
/// with at most [`MAX_CLOCK_SKEW`] of tolerance, and the expected `iss` and
/// `aud` values.
pub fn verify_compact(token: &str, key: &Jwk, expected: &Expected) -> Result<serde_json::Value> {
    let header = decode_header(token)?;
    let allowed = key.allowed_algorithms()?;
    let alg: Algorithm = header
        .alg
        .parse()
        .map_err(|_| Error::Malformed(format!("unknown algorithm {:?}", header.alg)))?;
    if !allowed.contains(&alg) {
        return Err(Error::Unauthorized(format!(
            "algorithm {alg:?} not valid for this key"
        )));
    }

    let mut validation = Validation::new(alg);
    validation.leeway = MAX_CLOCK_SKEW.as_secs();
    validation.validate_exp = true;
    validation.validate_nbf = true;
    match &expected.audience {
        Some(aud) => validation.set_audience(&[aud]),
        // jsonwebtoken rejects tokens carrying `aud` unless an audience is
        // configured; callers that skip the check opt out explicitly.
        None => validation.validate_aud = false,
    }
    if let Some(iss) = &expected.issuer {
        validation.set_issuer(&[iss]);
    }

    let data = jsonwebtoken::decode::<serde_json::Value>(token, &key.decoding_key()?, &validation)
        .map_err(|e| Error::Unauthorized(format!("token validation failed: {e}")))?;

    if expected.require_subject {
        let sub = data.claims.get("sub").and_then(|v| v.as_str()).unwrap_or("");
        if sub.is_empty() {
            return Err(Error::Unauthorized("token is missing a subject".into()));
        }
    }
    Ok(data.claims)
}

/// Extracts a verification JWK from a certificate's SubjectPublicKeyInfo.
///
/// Supports the key types the CA issues for: EC P-256/P-384, RSA, Ed25519.
pub fn jwk_from_spki(
    spki: &x509_parser::x509::SubjectPublicKeyInfo<'_>,
) -> Result<Jwk> {
    use x509_parser::public_key::PublicKey;
    match spki.parsed() {
        Ok(PublicKey::EC(ec)) => {
            let point = ec.data();
            let (crv, coord_len) = match point.len() {
                65 => ("P-256", 32),
                97 => ("P-384", 48),
                n => {
                    return Err(Error::Malformed(format!(
                        "unsupported EC point length {n}"
                    )))
                }
            };
            if point[0] != 0x04 {
                return Err(Error::Malformed("EC point is not uncompressed".into()));
            }
            Ok(Jwk {
                kty: "EC".into(),
                crv: Some(crv.into()),
                x: Some(URL_SAFE_NO_PAD.encode(&point[1..1 + coord_len])),
                y: Some(URL_SAFE_NO_PAD.encode(&point[1 + coord_len..1 + 2 * coord_len])),
                ..Default::default()
            })
        }
        Ok(PublicKey::RSA(rsa)) => {
            let strip = |bytes: &[u8]| -> Vec<u8> {
                let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
                bytes[start..].to_vec()
            };
            Ok(Jwk {
                kty: "RSA".into(),
                n: Some(URL_SAFE_NO_PAD.encode(strip(rsa.modulus))),
                e: Some(URL_SAFE_NO_PAD.encode(strip(rsa.exponent))),
                ..Default::default()
            })
        }
        _ => {
            if spki.algorithm.algorithm == x509_parser::oid_registry::OID_SIG_ED25519 {
                return Ok(Jwk {
                    kty: "OKP".into(),
                    crv: Some("Ed25519".into()),
                    x: Some(URL_SAFE_NO_PAD.encode(&spki.subject_public_key.data)),
                    ..Default::default()
                });
            }
            Err(Error::Malformed(format!(
                "unsupported public key algorithm {}",
                spki.algorithm.algorithm
            )))
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct UsedToken {
    expires_at: i64,
}

/// Enforces single use of a token ID (`jti` or nonce).
///
/// The record lives in the `used_tokens` bucket until the token itself
/// expires; insertion is a CAS against absence, so concurrent replays lose
/// deterministically.
pub async fn consume_once(db: &dyn Db, scope: &str, token_id: &str, expires_at: i64) -> Result<()> {
    let key = format!("{scope}/{token_id}");
    let value = cerion_db::encode(Bucket::UsedTokens, &UsedToken { expires_at })?;

    match db
        .cmp_and_swap(Bucket::UsedTokens, key.as_bytes(), None, Some(value.clone()))
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if e.is_conflict() => {
            // The previous holder may be long expired; reclaim the slot
            // instead of rejecting forever.
            let existing = db.get(Bucket::UsedTokens, key.as_bytes()).await?;
            let record: UsedToken = cerion_db::decode(Bucket::UsedTokens, &existing)?;
            if record.expires_at >= Utc::now().timestamp() {
                tracing::warn!(scope, token_id, "rejecting replayed token");
                return Err(Error::Unauthorized("token has already been used".into()));
            }
            db.cmp_and_swap(
                Bucket::UsedTokens,
                key.as_bytes(),
                Some(&existing),
                Some(value),
            )
            .await
            .map_err(|_| Error::Unauthorized("token has already been used".into()))
        }
        Err(e) => Err(e.into()),
    }
}

/// A lazily fetched, periodically refreshed remote JWKS.
///
/// One instance per provisioner; the refresh lock serializes fetches so a
/// burst of requests after expiry produces a single upstream call.
pub struct RemoteJwks {
    url: String,
    http: reqwest::Client,
    state: RwLock<CachedJwks>,
    refresh_lock: Mutex<()>,
    cache_duration: Duration,
}

#[derive(Default)]
struct CachedJwks {
    keys: Option<JwkSet>,
    fetched_at: Option<Instant>,
}

impl RemoteJwks {
    /// Creates a cache over the given JWKS URL (1 hour lifetime).
    pub fn new(url: String, http: reqwest::Client) -> Self {
        Self {
            url,
            http,
            state: RwLock::new(CachedJwks::default()),
            refresh_lock: Mutex::new(()),
            cache_duration: Duration::from_secs(3600),
        }
    }

    /// Returns the key for `kid`, fetching or refreshing as needed.
    pub async fn get_key(&self, kid: Option<&str>) -> Result<Jwk> {
        if let Some(key) = self.lookup(kid).await {
            return Ok(key);
        }

        {
            let _guard = self.refresh_lock.lock().await;
            let stale = {
                let state = self.state.read().await;
                match state.fetched_at {
                    None => true,
                    Some(t) => t.elapsed() > Duration::from_secs(30),
                }
            };
            // An unknown kid forces a refresh (key rotation), but at most
            // once per 30 s so bogus kids cannot hammer the upstream.
            if stale {
                self.refresh().await?;
            }
        }

        self.lookup(kid).await.ok_or_else(|| {
            Error::Unauthorized(format!("no JWK found for kid {:?}", kid.unwrap_or("")))
        })
    }

    async fn lookup(&self, kid: Option<&str>) -> Option<Jwk> {
        let state = self.state.read().await;
        let fresh = state
            .fetched_at
            .map(|t| t.elapsed() < self.cache_duration)
            .unwrap_or(false);
        if !fresh {
            return None;
        }
        state.keys.as_ref().and_then(|set| set.find(kid)).cloned()
    }

    async fn refresh(&self) -> Result<()> {
        tracing::debug!(url = %self.url, "fetching JWKS");
        let response = self
            .http
            .get(&self.url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("JWKS fetch: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::Transient(format!(
                "JWKS fetch returned {}",
                response.status()
            )));
        }
        let keys: JwkSet = response
            .json()
            .await
            .map_err(|e| Error::Transient(format!("JWKS decode: {e}")))?;
        tracing::debug!(url = %self.url, count = keys.keys.len(), "loaded JWKS");

        let mut state = self.state.write().await;
        state.keys = Some(keys);
        state.fetched_at = Some(Instant::now());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerion_db::MemoryDb;

    // RFC 7638 §3.1 example key and thumbprint.
    #[test]
    fn rsa_thumbprint_matches_rfc_7638_vector() {
        let jwk = Jwk {
            kty: "RSA".into(),
            n: Some(
                "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw"
                    .into(),
            ),
            e: Some("AQAB".into()),
            alg: Some("RS256".into()),
            kid: Some("2011-04-29".into()),
            ..Default::default()
        };
        assert_eq!(
            jwk.thumbprint().unwrap(),
            "NzbLsXh8uDCcd-6MNwXF4W_7noWXFZAfHkxZsRGC9Xs"
        );
    }

    #[test]
    fn jwk_set_find() {
        let set = JwkSet {
            keys: vec![
                Jwk {
                    kid: Some("a".into()),
                    ..Jwk::ec_p256("x", "y")
                },
                Jwk {
                    kid: Some("b".into()),
                    ..Jwk::ec_p256("x", "y")
                },
            ],
        };
        assert_eq!(set.find(Some("b")).unwrap().kid.as_deref(), Some("b"));
        assert!(set.find(Some("c")).is_none());
        // ambiguous without a kid
        assert!(set.find(None).is_none());

        let single = JwkSet {
            keys: vec![Jwk::ec_p256("x", "y")],
        };
        assert!(single.find(None).is_some());
    }

    #[test]
    fn decode_header_extracts_fields() {
        let header = serde_json::json!({"alg": "ES256", "kid": "key-1"});
        let token = format!(
            "{}.e30.c2ln",
            URL_SAFE_NO_PAD.encode(header.to_string().as_bytes())
        );
        let decoded = decode_header(&token).unwrap();
        assert_eq!(decoded.alg, "ES256");
        assert_eq!(decoded.kid.as_deref(), Some("key-1"));
    }

    #[test]
    fn decode_header_rejects_garbage() {
        assert!(decode_header("").is_err());
        assert!(decode_header("not base64!!.x.y").is_err());
    }

    #[tokio::test]
    async fn consume_once_rejects_replay() {
        let db = MemoryDb::new();
        let exp = Utc::now().timestamp() + 300;
        consume_once(&db, "prov-1", "jti-1", exp).await.unwrap();
        let err = consume_once(&db, "prov-1", "jti-1", exp).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
        // a different scope is independent
        consume_once(&db, "prov-2", "jti-1", exp).await.unwrap();
    }

    #[tokio::test]
    async fn consume_once_reclaims_expired_slot() {
        let db = MemoryDb::new();
        let past = Utc::now().timestamp() - 10;
        consume_once(&db, "prov-1", "jti-1", past).await.unwrap();
        // the original token is expired, so its jti slot is reusable
        let future = Utc::now().timestamp() + 300;
        consume_once(&db, "prov-1", "jti-1", future).await.unwrap();
    }
}
