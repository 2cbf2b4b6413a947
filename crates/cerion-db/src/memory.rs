//! In-memory reference implementation of the [`Db`] trait.

use crate::{Bucket, Db, Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::Mutex;

type BucketMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// A single-process, fully in-memory store.
///
/// All operations take one lock, which makes `cmp_and_swap` trivially
/// atomic. Suitable for tests and development CAs.
pub struct MemoryDb {
    buckets: Mutex<HashMap<Bucket, BucketMap>>,
}

impl MemoryDb {
    /// Creates a store with all buckets pre-created.
    pub fn new() -> Self {
        let mut buckets = HashMap::new();
        for bucket in Bucket::ALL {
            buckets.insert(bucket, BucketMap::new());
        }
        Self {
            buckets: Mutex::new(buckets),
        }
    }
}

impl Default for MemoryDb {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Db for MemoryDb {
    async fn get(&self, bucket: Bucket, key: &[u8]) -> Result<Vec<u8>> {
        let buckets = self.buckets.lock().await;
        buckets
            .get(&bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| Error::not_found(bucket, key))
    }

    async fn put(&self, bucket: Bucket, key: &[u8], value: Vec<u8>) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        buckets.entry(bucket).or_default().insert(key.to_vec(), value);
        Ok(())
    }

    async fn cmp_and_swap(
        &self,
        bucket: Bucket,
        key: &[u8],
        old: Option<&[u8]>,
        new: Option<Vec<u8>>,
    ) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        let map = buckets.entry(bucket).or_default();
        let current = map.get(key).map(|v| v.as_slice());
        if current != old {
            return Err(Error::conflict(bucket, key));
        }
        match new {
            Some(value) => {
                map.insert(key.to_vec(), value);
            }
            None => {
                map.remove(key);
            }
        }
        Ok(())
    }

    async fn del(&self, bucket: Bucket, key: &[u8]) -> Result<()> {
        let mut buckets = self.buckets.lock().await;
        if let Some(map) = buckets.get_mut(&bucket) {
            map.remove(key);
        }
        Ok(())
    }

    async fn list(&self, bucket: Bucket) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let buckets = self.buckets.lock().await;
        Ok(buckets
            .get(&bucket)
            .map(|b| b.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn scan_prefix(&self, bucket: Bucket, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let buckets = self.buckets.lock().await;
        Ok(buckets
            .get(&bucket)
            .map(|b| {
                b.range(prefix.to_vec()..)
                    .take_while(|(k, _)| k.starts_with(prefix))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_put_del() {
        let db = MemoryDb::new();
        assert!(db.get(Bucket::Certs, b"k").await.unwrap_err().is_not_found());

        db.put(Bucket::Certs, b"k", b"v".to_vec()).await.unwrap();
        assert_eq!(db.get(Bucket::Certs, b"k").await.unwrap(), b"v");

        db.del(Bucket::Certs, b"k").await.unwrap();
        assert!(db.get(Bucket::Certs, b"k").await.unwrap_err().is_not_found());
        // deleting again is not an error
        db.del(Bucket::Certs, b"k").await.unwrap();
    }

    #[tokio::test]
    async fn cas_insert_if_missing() {
        let db = MemoryDb::new();
        db.cmp_and_swap(Bucket::AcmeOrders, b"o1", None, Some(b"a".to_vec()))
            .await
            .unwrap();
        // a second insert-if-missing loses
        let err = db
            .cmp_and_swap(Bucket::AcmeOrders, b"o1", None, Some(b"b".to_vec()))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(db.get(Bucket::AcmeOrders, b"o1").await.unwrap(), b"a");
    }

    #[tokio::test]
    async fn cas_swap_and_delete() {
        let db = MemoryDb::new();
        db.put(Bucket::AcmeNonces, b"n", b"unused".to_vec())
            .await
            .unwrap();

        // stale expectation loses
        let err = db
            .cmp_and_swap(Bucket::AcmeNonces, b"n", Some(b"other"), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        // CAS-delete with the right expectation wins exactly once
        db.cmp_and_swap(Bucket::AcmeNonces, b"n", Some(b"unused"), None)
            .await
            .unwrap();
        let err = db
            .cmp_and_swap(Bucket::AcmeNonces, b"n", Some(b"unused"), None)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn scan_prefix_is_ordered_and_bounded() {
        let db = MemoryDb::new();
        for key in ["p1/a", "p1/b", "p2/a", "p10/x"] {
            db.put(Bucket::AcmeEabKeyByReference, key.as_bytes(), b"v".to_vec())
                .await
                .unwrap();
        }
        let hits = db
            .scan_prefix(Bucket::AcmeEabKeyByReference, b"p1/")
            .await
            .unwrap();
        let keys: Vec<_> = hits
            .iter()
            .map(|(k, _)| String::from_utf8_lossy(k).into_owned())
            .collect();
        assert_eq!(keys, vec!["p1/a", "p1/b"]);
    }

    #[tokio::test]
    async fn concurrent_cas_single_winner() {
        use std::sync::Arc;
        let db = Arc::new(MemoryDb::new());
        db.put(Bucket::AcmeChallenges, b"c", b"pending".to_vec())
            .await
            .unwrap();

        let mut wins = 0;
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let db = db.clone();
            tasks.push(tokio::spawn(async move {
                db.cmp_and_swap(
                    Bucket::AcmeChallenges,
                    b"c",
                    Some(b"pending"),
                    Some(b"processing".to_vec()),
                )
                .await
                .is_ok()
            }));
        }
        for t in tasks {
            if t.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
    }
}
