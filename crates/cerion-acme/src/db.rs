//! Typed access to the ACME buckets.
//!
//! Every mutation of a stateful resource goes through a compare-and-swap
//! against the raw bytes previously read ([`Stored`] keeps them paired with
//! the decoded value), so lost updates are impossible by construction.

use crate::types::{Account, Authorization, Challenge, Order};
use crate::{Error, ErrorKind, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cerion_db::{Bucket, Db};
use rand::RngCore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

/// A fresh 128-bit opaque token, base64url.
pub fn random_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// A decoded record paired with the raw bytes it was read as.
#[derive(Debug, Clone)]
pub struct Stored<T> {
    pub value: T,
    raw: Vec<u8>,
}

impl<T> Stored<T> {
    pub(crate) fn from_parts(value: T, raw: Vec<u8>) -> Self {
        Self { value, raw }
    }

    /// The bytes a CAS update must name as the expected old value.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// Typed ACME store over the KV seam.
#[derive(Clone)]
pub struct AcmeDb {
    db: Arc<dyn Db>,
}

impl AcmeDb {
    pub fn new(db: Arc<dyn Db>) -> Self {
        Self { db }
    }

    /// The underlying store, for collaborators that share it.
    pub fn raw_db(&self) -> &Arc<dyn Db> {
        &self.db
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        bucket: Bucket,
        key: &str,
    ) -> cerion_db::Result<Stored<T>> {
        let raw = self.db.get(bucket, key.as_bytes()).await?;
        let value = cerion_db::decode(bucket, &raw)?;
        Ok(Stored { value, raw })
    }

    async fn insert_json<T: Serialize>(
        &self,
        bucket: Bucket,
        key: &str,
        value: &T,
    ) -> cerion_db::Result<Vec<u8>> {
        let raw = cerion_db::encode(bucket, value)?;
        self.db
            .cmp_and_swap(bucket, key.as_bytes(), None, Some(raw.clone()))
            .await?;
        Ok(raw)
    }

    async fn cas_json<T: Serialize>(
        &self,
        bucket: Bucket,
        key: &str,
        old_raw: &[u8],
        value: &T,
    ) -> cerion_db::Result<Vec<u8>> {
        let raw = cerion_db::encode(bucket, value)?;
        self.db
            .cmp_and_swap(bucket, key.as_bytes(), Some(old_raw), Some(raw.clone()))
            .await?;
        Ok(raw)
    }

    // ── accounts ──

    /// Index key enforcing one account per (provisioner, thumbprint).
    fn account_index_key(provisioner: &str, key_id: &str) -> String {
        format!("{provisioner}/{key_id}")
    }

    /// Creates an account, enforcing key uniqueness.
    ///
    /// Returns `(account, true)` when this call created the account, or
    /// `(existing, false)` when the key already had one: losers of the
    /// creation race adopt the winner's account (RFC 8555 §7.3).
    pub async fn create_account(&self, account: Account) -> Result<(Account, bool)> {
        let index_key = Self::account_index_key(&account.provisioner, &account.key_id);
        let index_value =
            cerion_db::encode(Bucket::AcmeAccountByKeyId, &account.id)?;
        match self
            .db
            .cmp_and_swap(
                Bucket::AcmeAccountByKeyId,
                index_key.as_bytes(),
                None,
                Some(index_value),
            )
            .await
        {
            Ok(()) => {
                self.insert_json(Bucket::AcmeAccounts, &account.id, &account)
                    .await?;
                Ok((account, true))
            }
            Err(e) if e.is_conflict() => {
                // the winner writes the record right after the index; give
                // it a few reads before declaring the index dangling
                for _ in 0..3 {
                    match self
                        .account_by_key(&account.provisioner, &account.key_id)
                        .await
                    {
                        Ok(Some(existing)) => return Ok((existing.value, false)),
                        Ok(None) | Err(_) => {
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await
                        }
                    }
                }
                Err(Error::server_internal("account index points nowhere"))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn account(&self, id: &str) -> Result<Stored<Account>> {
        self.get_json(Bucket::AcmeAccounts, id).await.map_err(|e| {
            if e.is_not_found() {
                Error::new(ErrorKind::AccountDoesNotExist, format!("no account {id}"))
            } else {
                e.into()
            }
        })
    }

    pub async fn account_by_key(
        &self,
        provisioner: &str,
        key_id: &str,
    ) -> Result<Option<Stored<Account>>> {
        let index_key = Self::account_index_key(provisioner, key_id);
        match self
            .get_json::<String>(Bucket::AcmeAccountByKeyId, &index_key)
            .await
        {
            Ok(stored) => Ok(Some(self.account(&stored.value).await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// CAS-updates an account record.
    pub async fn update_account(
        &self,
        stored: &Stored<Account>,
        updated: &Account,
    ) -> Result<Stored<Account>> {
        let raw = self
            .cas_json(Bucket::AcmeAccounts, &updated.id, stored.raw(), updated)
            .await?;
        Ok(Stored {
            value: updated.clone(),
            raw,
        })
    }

    /// Swaps the account key (key-change): moves the uniqueness index and
    /// CAS-updates the record.
    pub async fn change_account_key(
        &self,
        stored: &Stored<Account>,
        updated: &Account,
    ) -> Result<()> {
        let old_index = Self::account_index_key(&stored.value.provisioner, &stored.value.key_id);
        let new_index = Self::account_index_key(&updated.provisioner, &updated.key_id);
        let index_value = cerion_db::encode(Bucket::AcmeAccountByKeyId, &updated.id)?;
        // claim the new key first so two accounts can never share it
        self.db
            .cmp_and_swap(
                Bucket::AcmeAccountByKeyId,
                new_index.as_bytes(),
                None,
                Some(index_value),
            )
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    Error::new(ErrorKind::Malformed, "new key is already bound to an account")
                } else {
                    Error::from(e)
                }
            })?;
        self.cas_json(Bucket::AcmeAccounts, &updated.id, stored.raw(), updated)
            .await?;
        self.db
            .del(Bucket::AcmeAccountByKeyId, old_index.as_bytes())
            .await?;
        Ok(())
    }

    // ── orders ──

    pub async fn create_order(&self, order: &Order) -> Result<()> {
        self.insert_json(Bucket::AcmeOrders, &order.id, order).await?;
        Ok(())
    }

    pub async fn order(&self, id: &str) -> Result<Stored<Order>> {
        self.get_json(Bucket::AcmeOrders, id).await.map_err(|e| {
            if e.is_not_found() {
                Error::malformed(format!("no order {id}"))
            } else {
                e.into()
            }
        })
    }

    /// CAS-updates an order; a conflict means someone else transitioned it.
    pub async fn update_order(
        &self,
        stored: &Stored<Order>,
        updated: &Order,
    ) -> Result<Stored<Order>> {
        let raw = self
            .cas_json(Bucket::AcmeOrders, &updated.id, stored.raw(), updated)
            .await?;
        Ok(Stored {
            value: updated.clone(),
            raw,
        })
    }

    // ── authorizations ──

    pub async fn create_authz(&self, authz: &Authorization) -> Result<()> {
        self.insert_json(Bucket::AcmeAuthzs, &authz.id, authz).await?;
        Ok(())
    }

    pub async fn authz(&self, id: &str) -> Result<Stored<Authorization>> {
        self.get_json(Bucket::AcmeAuthzs, id).await.map_err(|e| {
            if e.is_not_found() {
                Error::malformed(format!("no authorization {id}"))
            } else {
                e.into()
            }
        })
    }

    pub async fn update_authz(
        &self,
        stored: &Stored<Authorization>,
        updated: &Authorization,
    ) -> Result<Stored<Authorization>> {
        let raw = self
            .cas_json(Bucket::AcmeAuthzs, &updated.id, stored.raw(), updated)
            .await?;
        Ok(Stored {
            value: updated.clone(),
            raw,
        })
    }

    // ── challenges ──

    pub async fn create_challenge(&self, challenge: &Challenge) -> Result<()> {
        self.insert_json(Bucket::AcmeChallenges, &challenge.id, challenge)
            .await?;
        Ok(())
    }

    pub async fn challenge(&self, id: &str) -> Result<Stored<Challenge>> {
        self.get_json(Bucket::AcmeChallenges, id).await.map_err(|e| {
            if e.is_not_found() {
                Error::malformed(format!("no challenge {id}"))
            } else {
                e.into()
            }
        })
    }

    /// CAS-updates a challenge. Frozen (terminal) records never change.
    pub async fn update_challenge(
        &self,
        stored: &Stored<Challenge>,
        updated: &Challenge,
    ) -> Result<Stored<Challenge>> {
        if stored.value.status.is_terminal() {
            return Err(Error::malformed("challenge is in a terminal state"));
        }
        let raw = self
            .cas_json(Bucket::AcmeChallenges, &updated.id, stored.raw(), updated)
            .await?;
        Ok(Stored {
            value: updated.clone(),
            raw,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::*;
    use cerion_db::MemoryDb;
    use cerion_provisioner::Jwk;
    use chrono::Utc;

    fn acme_db() -> AcmeDb {
        AcmeDb::new(Arc::new(MemoryDb::new()))
    }

    fn account(id: &str, key_id: &str) -> Account {
        Account {
            id: id.into(),
            key_id: key_id.into(),
            jwk: Jwk::ec_p256("x", "y"),
            status: AccountStatus::Valid,
            contact: vec![],
            provisioner: "web".into(),
            eab_key_id: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn account_key_uniqueness() {
        let db = acme_db();
        let (_, created) = db.create_account(account("a1", "thumb-1")).await.unwrap();
        assert!(created);

        // same key: adopt the winner
        let (existing, created) = db.create_account(account("a2", "thumb-1")).await.unwrap();
        assert!(!created);
        assert_eq!(existing.id, "a1");

        // different key: a fresh account
        let (_, created) = db.create_account(account("a3", "thumb-2")).await.unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn account_lookup_by_key() {
        let db = acme_db();
        db.create_account(account("a1", "thumb-1")).await.unwrap();
        let found = db.account_by_key("web", "thumb-1").await.unwrap().unwrap();
        assert_eq!(found.value.id, "a1");
        assert!(db.account_by_key("web", "other").await.unwrap().is_none());
        assert!(db.account_by_key("scep", "thumb-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn order_cas_detects_concurrent_update() {
        let db = acme_db();
        let order = Order {
            id: "o1".into(),
            account_id: "a1".into(),
            provisioner: "web".into(),
            status: OrderStatus::Pending,
            identifiers: vec![Identifier::dns("a.test")],
            authz_ids: vec![],
            not_before: None,
            not_after: None,
            expires_at: Utc::now(),
            certificate_serial: None,
            error: None,
        };
        db.create_order(&order).await.unwrap();

        let stored = db.order("o1").await.unwrap();
        let mut ready = stored.value.clone();
        ready.status = OrderStatus::Ready;
        db.update_order(&stored, &ready).await.unwrap();

        // the stale handle loses
        let mut stale = stored.value.clone();
        stale.status = OrderStatus::Invalid;
        let err = db.update_order(&stored, &stale).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::OrderNotReady);
    }

    #[tokio::test]
    async fn terminal_challenge_is_frozen() {
        let db = acme_db();
        let challenge = Challenge {
            id: "c1".into(),
            authz_id: "z1".into(),
            account_id: "a1".into(),
            kind: ChallengeType::Http01,
            token: random_token(),
            status: ChallengeStatus::Valid,
            validated_at: Some(Utc::now()),
            last_attempt_at: None,
            error: None,
            validation_proof: None,
        };
        db.create_challenge(&challenge).await.unwrap();
        let stored = db.challenge("c1").await.unwrap();
        let mut mutated = stored.value.clone();
        mutated.status = ChallengeStatus::Invalid;
        assert!(db.update_challenge(&stored, &mutated).await.is_err());
    }

    #[tokio::test]
    async fn key_change_moves_the_index() {
        let db = acme_db();
        let (created, _) = db.create_account(account("a1", "thumb-old")).await.unwrap();
        let stored = db.account(&created.id).await.unwrap();

        let mut updated = stored.value.clone();
        updated.key_id = "thumb-new".into();
        db.change_account_key(&stored, &updated).await.unwrap();

        assert!(db.account_by_key("web", "thumb-old").await.unwrap().is_none());
        let found = db.account_by_key("web", "thumb-new").await.unwrap().unwrap();
        assert_eq!(found.value.id, "a1");

        // the old key can be re-registered afresh
        let (_, created) = db.create_account(account("a9", "thumb-old")).await.unwrap();
        assert!(created);
    }

    #[test]
    fn random_tokens_are_unique_and_long() {
        let a = random_token();
        let b = random_token();
        assert_ne!(a, b);
        assert!(a.len() >= 22); // 16 bytes base64url
    }
}
