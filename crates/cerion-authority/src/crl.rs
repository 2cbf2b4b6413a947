//! Certificate revocation list maintenance.
//!
//! Revocations mark the CRL dirty; the signed list is rebuilt lazily on
//! the next read, at most once per debounce window. The CRL number is a
//! monotonic counter in the `crl` bucket, CAS-incremented with every
//! recorded revocation.

use crate::records::RevocationRecord;
use crate::{Error, Result};
use cerion_db::{Bucket, Db};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Floor between CRL rebuilds.
const DEBOUNCE: std::time::Duration = std::time::Duration::from_secs(10);

/// CRL validity window.
const NEXT_UPDATE_DAYS: i64 = 7;

const COUNTER_KEY: &[u8] = b"number";
const DOCUMENT_KEY: &[u8] = b"latest";

#[derive(Debug, Serialize, Deserialize)]
struct CrlDocument {
    number: u64,
    /// Signed CRL, DER, base64.
    der_b64: String,
    built_at: chrono::DateTime<Utc>,
}

/// In-process rebuild control.
pub(crate) struct CrlControl {
    dirty: AtomicBool,
    rebuild: Mutex<Option<Instant>>,
}

impl CrlControl {
    pub(crate) fn new() -> Self {
        Self {
            dirty: AtomicBool::new(true),
            rebuild: Mutex::new(None),
        }
    }

    pub(crate) fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

/// CAS-increments the CRL number, returning the new value.
pub(crate) async fn bump_number(db: &dyn Db) -> Result<u64> {
    for _ in 0..8 {
        let current = match db.get(Bucket::Crl, COUNTER_KEY).await {
            Ok(raw) => Some((cerion_db::decode::<u64>(Bucket::Crl, &raw)?, raw)),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e.into()),
        };
        let next = current.as_ref().map(|(n, _)| n + 1).unwrap_or(1);
        let encoded = cerion_db::encode(Bucket::Crl, &next)?;
        let result = db
            .cmp_and_swap(
                Bucket::Crl,
                COUNTER_KEY,
                current.as_ref().map(|(_, raw)| raw.as_slice()),
                Some(encoded),
            )
            .await;
        match result {
            Ok(()) => return Ok(next),
            Err(e) if e.is_conflict() => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(Error::Conflict("CRL number kept conflicting".into()))
}

fn reason(code: u8) -> rcgen::RevocationReason {
    use rcgen::RevocationReason as R;
    match code {
        1 => R::KeyCompromise,
        2 => R::CaCompromise,
        3 => R::AffiliationChanged,
        4 => R::Superseded,
        5 => R::CessationOfOperation,
        6 => R::CertificateHold,
        8 => R::RemoveFromCrl,
        9 => R::PrivilegeWithdrawn,
        10 => R::AaCompromise,
        _ => R::Unspecified,
    }
}

impl crate::Authority {
    /// Returns the current signed CRL (DER), rebuilding it when dirty and
    /// the debounce window has passed.
    pub async fn crl_der(&self) -> Result<Vec<u8>> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let needs_rebuild = self.crl_control().dirty.load(Ordering::Acquire);
        if needs_rebuild {
            let mut last = self.crl_control().rebuild.lock().await;
            let elapsed = last.map(|t| t.elapsed() >= DEBOUNCE).unwrap_or(true);
            if self.crl_control().dirty.load(Ordering::Acquire) && elapsed {
                let der = self.rebuild_crl().await?;
                *last = Some(Instant::now());
                self.crl_control().dirty.store(false, Ordering::Release);
                return Ok(der);
            }
        }

        match self.db().get(Bucket::Crl, DOCUMENT_KEY).await {
            Ok(raw) => {
                let doc: CrlDocument = cerion_db::decode(Bucket::Crl, &raw)?;
                STANDARD
                    .decode(doc.der_b64.as_bytes())
                    .map_err(|e| Error::Internal(format!("stored CRL: {e}")))
            }
            // nothing revoked yet and debounce suppressed the build
            Err(e) if e.is_not_found() => self.rebuild_crl().await,
            Err(e) => Err(e.into()),
        }
    }

    /// Signs a fresh CRL over every revocation on record.
    async fn rebuild_crl(&self) -> Result<Vec<u8>> {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine;

        let mut revoked = Vec::new();
        for (_, raw) in self.db().list(Bucket::RevokedCerts).await? {
            let record: RevocationRecord = cerion_db::decode(Bucket::RevokedCerts, &raw)?;
            let serial = hex::decode(&record.serial)
                .map_err(|e| Error::Internal(format!("stored serial: {e}")))?;
            revoked.push(rcgen::RevokedCertParams {
                serial_number: rcgen::SerialNumber::from_slice(&serial),
                revocation_time: to_offset(record.revoked_at)?,
                reason_code: Some(reason(record.reason_code)),
                invalidity_date: None,
            });
        }

        let number = match self.db().get(Bucket::Crl, COUNTER_KEY).await {
            Ok(raw) => cerion_db::decode::<u64>(Bucket::Crl, &raw)?,
            Err(e) if e.is_not_found() => 0,
            Err(e) => return Err(e.into()),
        };

        let now = Utc::now();
        let params = rcgen::CertificateRevocationListParams {
            this_update: to_offset(now)?,
            next_update: to_offset(now + chrono::Duration::days(NEXT_UPDATE_DAYS))?,
            crl_number: rcgen::SerialNumber::from_slice(&number.to_be_bytes()),
            issuing_distribution_point: None,
            revoked_certs: revoked,
            key_identifier_method: rcgen::KeyIdMethod::Sha256,
        };
        let issuer = self.issuer()?;
        let crl = params
            .signed_by(&issuer)
            .map_err(|e| Error::Internal(format!("CRL signing: {e}")))?;
        let der = crl.der().to_vec();

        let doc = CrlDocument {
            number,
            der_b64: STANDARD.encode(&der),
            built_at: now,
        };
        let raw = cerion_db::encode(Bucket::Crl, &doc)?;
        self.db().put(Bucket::Crl, DOCUMENT_KEY, raw).await?;
        tracing::debug!(number, "rebuilt CRL");
        Ok(der)
    }
}

pub(crate) fn to_offset(ts: chrono::DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .map_err(|e| Error::Internal(format!("timestamp: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerion_db::MemoryDb;

    #[tokio::test]
    async fn bump_number_is_monotonic() {
        let db = MemoryDb::new();
        assert_eq!(bump_number(&db).await.unwrap(), 1);
        assert_eq!(bump_number(&db).await.unwrap(), 2);
        assert_eq!(bump_number(&db).await.unwrap(), 3);
    }

    #[test]
    fn reason_codes_map() {
        assert_eq!(reason(1), rcgen::RevocationReason::KeyCompromise);
        assert_eq!(reason(0), rcgen::RevocationReason::Unspecified);
        assert_eq!(reason(99), rcgen::RevocationReason::Unspecified);
    }
}
