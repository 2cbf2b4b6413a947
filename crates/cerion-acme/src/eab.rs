//! External Account Binding (RFC 8555 §7.3.4).
//!
//! EAB keys are minted by the admin API, handed to a client out of band,
//! and presented once inside new-account: an inner JWS over the outer
//! request's account JWK, HMAC-signed with the EAB key. Binding is
//! single-use: `bound_at` is CAS-set exactly once.

use crate::db::{random_token, AcmeDb, Stored};
use crate::jws::FlattenedJws;
use crate::{Error, ErrorKind, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cerion_db::Bucket;
use cerion_provisioner::Jwk;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

/// Longest accepted client-supplied reference.
pub const MAX_REFERENCE_LENGTH: usize = 256;

/// HMAC key size in bytes.
const HMAC_KEY_BYTES: usize = 32;

/// An External Account Binding key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalAccountKey {
    pub id: String,
    pub provisioner: String,
    /// Opaque client-supplied tag, unique within the provisioner.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Raw HMAC key bytes.
    pub hmac_key: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_account: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bound_at: Option<DateTime<Utc>>,
}

fn reference_index_key(provisioner: &str, reference: &str) -> String {
    format!("{provisioner}/{reference}")
}

impl AcmeDb {
    /// Mints a new EAB key for a provisioner.
    pub async fn create_eab_key(
        &self,
        provisioner: &str,
        reference: Option<String>,
    ) -> Result<ExternalAccountKey> {
        if let Some(reference) = &reference {
            if reference.len() > MAX_REFERENCE_LENGTH {
                return Err(Error::malformed(format!(
                    "reference length {} exceeds the maximum ({MAX_REFERENCE_LENGTH})",
                    reference.len()
                )));
            }
        }

        let mut hmac_key = vec![0u8; HMAC_KEY_BYTES];
        rand::thread_rng().fill_bytes(&mut hmac_key);
        let key = ExternalAccountKey {
            id: random_token(),
            provisioner: provisioner.to_string(),
            reference: reference.clone(),
            hmac_key,
            bound_account: None,
            created_at: Utc::now(),
            bound_at: None,
        };

        if let Some(reference) = &reference {
            let index_key = reference_index_key(provisioner, reference);
            let index_value = cerion_db::encode(Bucket::AcmeEabKeyByReference, &key.id)?;
            self.raw_db()
                .cmp_and_swap(
                    Bucket::AcmeEabKeyByReference,
                    index_key.as_bytes(),
                    None,
                    Some(index_value),
                )
                .await
                .map_err(|e| {
                    if e.is_conflict() {
                        Error::malformed(format!(
                            "an EAB key with reference {reference:?} already exists for provisioner {provisioner}"
                        ))
                    } else {
                        Error::from(e)
                    }
                })?;
        }

        let raw = cerion_db::encode(Bucket::AcmeEabKeys, &key)?;
        self.raw_db()
            .cmp_and_swap(Bucket::AcmeEabKeys, key.id.as_bytes(), None, Some(raw))
            .await?;
        Ok(key)
    }

    pub async fn eab_key(&self, id: &str) -> Result<Stored<ExternalAccountKey>> {
        let raw = self
            .raw_db()
            .get(Bucket::AcmeEabKeys, id.as_bytes())
            .await
            .map_err(|e| {
                if e.is_not_found() {
                    Error::new(
                        ErrorKind::ExternalAccountRequired,
                        format!("no external account key {id}"),
                    )
                } else {
                    Error::from(e)
                }
            })?;
        let value = cerion_db::decode(Bucket::AcmeEabKeys, &raw)?;
        Ok(Stored::from_parts(value, raw))
    }

    pub async fn eab_key_by_reference(
        &self,
        provisioner: &str,
        reference: &str,
    ) -> Result<Option<Stored<ExternalAccountKey>>> {
        let index_key = reference_index_key(provisioner, reference);
        let raw = match self
            .raw_db()
            .get(Bucket::AcmeEabKeyByReference, index_key.as_bytes())
            .await
        {
            Ok(raw) => raw,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let id: String = cerion_db::decode(Bucket::AcmeEabKeyByReference, &raw)?;
        Ok(Some(self.eab_key(&id).await?))
    }

    /// All EAB keys minted for a provisioner.
    pub async fn eab_keys_for_provisioner(
        &self,
        provisioner: &str,
    ) -> Result<Vec<ExternalAccountKey>> {
        let mut keys = Vec::new();
        for (_, raw) in self.raw_db().list(Bucket::AcmeEabKeys).await? {
            let key: ExternalAccountKey = cerion_db::decode(Bucket::AcmeEabKeys, &raw)?;
            if key.provisioner == provisioner {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// CAS-binds an EAB key to an account. Fails once `bound_at` is set.
    pub async fn bind_eab_key(
        &self,
        stored: &Stored<ExternalAccountKey>,
        account_id: &str,
    ) -> Result<()> {
        if stored.value.bound_at.is_some() {
            return Err(Error::new(
                ErrorKind::ExternalAccountRequired,
                "external account key has already been used",
            ));
        }
        let mut bound = stored.value.clone();
        bound.bound_account = Some(account_id.to_string());
        bound.bound_at = Some(Utc::now());
        let raw = cerion_db::encode(Bucket::AcmeEabKeys, &bound)?;
        self.raw_db()
            .cmp_and_swap(
                Bucket::AcmeEabKeys,
                bound.id.as_bytes(),
                Some(stored.raw()),
                Some(raw),
            )
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    Error::new(
                        ErrorKind::ExternalAccountRequired,
                        "external account key has already been used",
                    )
                } else {
                    Error::from(e)
                }
            })
    }

    /// Deletes an EAB key and its reference index entry.
    pub async fn delete_eab_key(&self, id: &str) -> Result<()> {
        let stored = self.eab_key(id).await?;
        if let Some(reference) = &stored.value.reference {
            let index_key = reference_index_key(&stored.value.provisioner, reference);
            self.raw_db()
                .del(Bucket::AcmeEabKeyByReference, index_key.as_bytes())
                .await?;
        }
        self.raw_db().del(Bucket::AcmeEabKeys, id.as_bytes()).await?;
        Ok(())
    }
}

/// The `externalAccountBinding` object inside a new-account payload.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EabJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

#[derive(Debug, Deserialize)]
struct EabProtected {
    alg: String,
    kid: String,
    #[serde(default)]
    url: Option<String>,
}

/// Verifies an EAB inner JWS and returns the EAB key ID it names.
///
/// Checks: HS256 over the inner signing input with the stored HMAC key,
/// `url` equal to the outer request URL, and the inner payload equal to
/// the outer account JWK.
pub fn verify_eab(
    eab: &EabJws,
    hmac_key: &[u8],
    outer_jwk: &Jwk,
    expected_url: &str,
) -> Result<()> {
    let protected_raw = URL_SAFE_NO_PAD
        .decode(eab.protected.as_bytes())
        .map_err(|e| Error::malformed(format!("EAB protected header: {e}")))?;
    let protected: EabProtected = serde_json::from_slice(&protected_raw)
        .map_err(|e| Error::malformed(format!("EAB protected header: {e}")))?;
    if protected.alg != "HS256" {
        return Err(Error::new(
            ErrorKind::BadSignatureAlgorithm,
            format!("EAB algorithm {:?} is not HS256", protected.alg),
        ));
    }
    if protected.url.as_deref() != Some(expected_url) {
        return Err(Error::unauthorized(
            "EAB url does not match the request url",
        ));
    }

    let message = format!("{}.{}", eab.protected, eab.payload);
    let mut mac = Hmac::<Sha256>::new_from_slice(hmac_key)
        .map_err(|e| Error::server_internal(format!("EAB HMAC: {e}")))?;
    mac.update(message.as_bytes());
    let signature = URL_SAFE_NO_PAD
        .decode(eab.signature.as_bytes())
        .map_err(|e| Error::malformed(format!("EAB signature: {e}")))?;
    mac.verify_slice(&signature).map_err(|_| {
        Error::new(
            ErrorKind::Unauthorized,
            "EAB signature verification failed",
        )
    })?;

    let payload_raw = URL_SAFE_NO_PAD
        .decode(eab.payload.as_bytes())
        .map_err(|e| Error::malformed(format!("EAB payload: {e}")))?;
    let inner_jwk: Jwk = serde_json::from_slice(&payload_raw)
        .map_err(|e| Error::malformed(format!("EAB payload: {e}")))?;
    let inner = inner_jwk
        .thumbprint()
        .map_err(|e| Error::malformed(e.to_string()))?;
    let outer = outer_jwk
        .thumbprint()
        .map_err(|e| Error::malformed(e.to_string()))?;
    if inner != outer {
        return Err(Error::unauthorized(
            "EAB payload key does not match the account key",
        ));
    }
    Ok(())
}

/// The `kid` named inside an EAB inner JWS.
pub fn eab_kid(eab: &EabJws) -> Result<String> {
    let protected_raw = URL_SAFE_NO_PAD
        .decode(eab.protected.as_bytes())
        .map_err(|e| Error::malformed(format!("EAB protected header: {e}")))?;
    let protected: EabProtected = serde_json::from_slice(&protected_raw)
        .map_err(|e| Error::malformed(format!("EAB protected header: {e}")))?;
    Ok(protected.kid)
}

// keep the FlattenedJws name for the payload field type in api code
impl From<FlattenedJws> for EabJws {
    fn from(j: FlattenedJws) -> Self {
        Self {
            protected: j.protected,
            payload: j.payload,
            signature: j.signature,
        }
    }
}
