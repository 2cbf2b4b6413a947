//! Anti-replay nonces.
//!
//! Nonces are opaque 128-bit tokens, valid for 24 hours, consumed exactly
//! once by a CAS-delete. The durable copy lives in the `acme_nonces`
//! bucket; a small LRU front caches the raw record so the common
//! issue-then-consume cycle costs one read less.

use crate::db::random_token;
use crate::{Error, ErrorKind, Result};
use cerion_db::{Bucket, Db};
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

/// How long a nonce stays valid after issuance.
const NONCE_TTL_HOURS: i64 = 24;

/// Entries kept in the in-memory front.
const CACHE_SIZE: usize = 4096;

#[derive(Debug, Serialize, Deserialize)]
struct NonceRecord {
    expires_at: DateTime<Utc>,
}

/// Issues and consumes anti-replay nonces.
pub struct NonceService {
    db: Arc<dyn Db>,
    cache: Mutex<LruCache<String, Vec<u8>>>,
}

impl NonceService {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self {
            db,
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(CACHE_SIZE).expect("cache size is non-zero"),
            )),
        }
    }

    /// Issues a fresh nonce.
    pub async fn issue(&self) -> Result<String> {
        let nonce = random_token();
        let record = NonceRecord {
            expires_at: Utc::now() + Duration::hours(NONCE_TTL_HOURS),
        };
        let raw = cerion_db::encode(Bucket::AcmeNonces, &record)?;
        self.db
            .put(Bucket::AcmeNonces, nonce.as_bytes(), raw.clone())
            .await?;
        self.cache.lock().await.put(nonce.clone(), raw);
        Ok(nonce)
    }

    /// Consumes a nonce; unknown, reused, or expired nonces are `badNonce`.
    pub async fn consume(&self, nonce: &str) -> Result<()> {
        let bad = || Error::new(ErrorKind::BadNonce, "unknown, used, or expired nonce");

        let raw = match self.cache.lock().await.pop(nonce) {
            Some(raw) => raw,
            None => match self.db.get(Bucket::AcmeNonces, nonce.as_bytes()).await {
                Ok(raw) => raw,
                Err(e) if e.is_not_found() => return Err(bad()),
                Err(e) => return Err(e.into()),
            },
        };

        let record: NonceRecord = cerion_db::decode(Bucket::AcmeNonces, &raw)?;

        // The CAS-delete is the single-use point: exactly one caller wins.
        match self
            .db
            .cmp_and_swap(Bucket::AcmeNonces, nonce.as_bytes(), Some(&raw), None)
            .await
        {
            Ok(()) => {}
            Err(e) if e.is_conflict() => return Err(bad()),
            Err(e) => return Err(e.into()),
        }

        if record.expires_at < Utc::now() {
            return Err(bad());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerion_db::MemoryDb;

    fn service() -> NonceService {
        NonceService::new(Arc::new(MemoryDb::new()))
    }

    #[tokio::test]
    async fn issue_and_consume_once() {
        let nonces = service();
        let nonce = nonces.issue().await.unwrap();
        nonces.consume(&nonce).await.unwrap();

        let err = nonces.consume(&nonce).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadNonce);
    }

    #[tokio::test]
    async fn unknown_nonce_is_bad() {
        let nonces = service();
        let err = nonces.consume("never-issued").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadNonce);
    }

    #[tokio::test]
    async fn expired_nonce_is_bad() {
        let db: Arc<dyn Db> = Arc::new(MemoryDb::new());
        let nonces = NonceService::new(db.clone());

        // a nonce issued 24h + 1s ago
        let nonce = random_token();
        let record = NonceRecord {
            expires_at: Utc::now() - Duration::seconds(1),
        };
        let raw = cerion_db::encode(Bucket::AcmeNonces, &record).unwrap();
        db.put(Bucket::AcmeNonces, nonce.as_bytes(), raw)
            .await
            .unwrap();

        let err = nonces.consume(&nonce).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BadNonce);
    }

    #[tokio::test]
    async fn consume_survives_cold_cache() {
        let db: Arc<dyn Db> = Arc::new(MemoryDb::new());
        let issuing = NonceService::new(db.clone());
        let consuming = NonceService::new(db); // separate cache

        let nonce = issuing.issue().await.unwrap();
        consuming.consume(&nonce).await.unwrap();
        assert!(issuing.consume(&nonce).await.is_err());
    }

    #[tokio::test]
    async fn concurrent_consumers_single_winner() {
        let db: Arc<dyn Db> = Arc::new(MemoryDb::new());
        let nonces = Arc::new(NonceService::new(db));
        let nonce = nonces.issue().await.unwrap();

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let nonces = nonces.clone();
            let nonce = nonce.clone();
            tasks.push(tokio::spawn(
                async move { nonces.consume(&nonce).await.is_ok() },
            ));
        }
        let mut wins = 0;
        for t in tasks {
            if t.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
