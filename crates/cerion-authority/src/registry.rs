//! The provisioner registry.
//!
//! A copy-on-write map from provisioner name to loaded instance: readers
//! grab an `Arc` snapshot and never block; admin mutations build a new map
//! and publish it atomically. Records persist in the `provisioners` bucket
//! with a monotonic `config_version`, and every mutation replaces the
//! whole instance; configuration is immutable once loaded.

use crate::{Error, Result};
use cerion_acme::{AcmeIssuer, ProvisionerDirectory};
use cerion_db::{Bucket, Db};
use cerion_provisioner::{
    AcmeProvisioner, AwsProvisioner, AzureProvisioner, GcpProvisioner, JwkProvisioner,
    K8sSaProvisioner, Kind, NebulaProvisioner, OidcProvisioner, Provisioner, ProvisionerRecord,
    ScepProvisioner, SshPopProvisioner, WireProvisioner, X5cProvisioner,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// A loaded provisioner, kept as its concrete type so protocol front ends
/// can reach their specific configuration.
#[derive(Clone)]
pub enum Loaded {
    Jwk(Arc<JwkProvisioner>),
    Oidc(Arc<OidcProvisioner>),
    X5c(Arc<X5cProvisioner>),
    K8ssa(Arc<K8sSaProvisioner>),
    Nebula(Arc<NebulaProvisioner>),
    Aws(Arc<AwsProvisioner>),
    Gcp(Arc<GcpProvisioner>),
    Azure(Arc<AzureProvisioner>),
    Acme(Arc<AcmeProvisioner>),
    Scep(Arc<ScepProvisioner>),
    Sshpop(Arc<SshPopProvisioner>),
    Wire(Arc<WireProvisioner>),
}

impl Loaded {
    /// Builds the concrete provisioner from a persisted record.
    pub fn from_record(record: &ProvisionerRecord) -> Result<Self> {
        let name = record.name.clone();
        let claims = record.claims.clone();
        let options = record.options.clone();
        let config = record.config.clone();
        let decode = |kind: &'static str| {
            move |e: serde_json::Error| {
                Error::Internal(format!("invalid {kind} provisioner config: {e}"))
            }
        };
        let loaded = match record.kind {
            Kind::Jwk => Loaded::Jwk(Arc::new(JwkProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("jwk"))?,
                claims,
                options,
            )?)),
            Kind::Oidc => Loaded::Oidc(Arc::new(OidcProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("oidc"))?,
                claims,
                options,
            )?)),
            Kind::X5c => Loaded::X5c(Arc::new(X5cProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("x5c"))?,
                claims,
                options,
            )?)),
            Kind::K8ssa => Loaded::K8ssa(Arc::new(K8sSaProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("k8ssa"))?,
                claims,
                options,
            )?)),
            Kind::Nebula => Loaded::Nebula(Arc::new(NebulaProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("nebula"))?,
                claims,
                options,
            )?)),
            Kind::Aws => Loaded::Aws(Arc::new(AwsProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("aws"))?,
                claims,
                options,
            )?)),
            Kind::Gcp => Loaded::Gcp(Arc::new(GcpProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("gcp"))?,
                claims,
                options,
            )?)),
            Kind::Azure => Loaded::Azure(Arc::new(AzureProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("azure"))?,
                claims,
                options,
            )?)),
            Kind::Acme => Loaded::Acme(Arc::new(AcmeProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("acme"))?,
                claims,
                options,
            )?)),
            Kind::Scep => Loaded::Scep(Arc::new(ScepProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("scep"))?,
                claims,
                options,
            )?)),
            Kind::Sshpop => Loaded::Sshpop(Arc::new(SshPopProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("sshpop"))?,
                claims,
                options,
            )?)),
            Kind::Wire => Loaded::Wire(Arc::new(WireProvisioner::new(
                name,
                serde_json::from_value(config).map_err(decode("wire"))?,
                claims,
                options,
            )?)),
        };
        Ok(loaded)
    }

    /// The generic enrollment contract.
    pub fn provisioner(&self) -> Arc<dyn Provisioner> {
        match self {
            Loaded::Jwk(p) => p.clone(),
            Loaded::Oidc(p) => p.clone(),
            Loaded::X5c(p) => p.clone(),
            Loaded::K8ssa(p) => p.clone(),
            Loaded::Nebula(p) => p.clone(),
            Loaded::Aws(p) => p.clone(),
            Loaded::Gcp(p) => p.clone(),
            Loaded::Azure(p) => p.clone(),
            Loaded::Acme(p) => p.clone(),
            Loaded::Scep(p) => p.clone(),
            Loaded::Sshpop(p) => p.clone(),
            Loaded::Wire(p) => p.clone(),
        }
    }

    /// The ACME view, for provisioners that front the ACME protocol.
    pub fn acme_issuer(&self) -> Option<AcmeIssuer> {
        match self {
            Loaded::Acme(p) => Some(AcmeIssuer::Acme(p.clone())),
            Loaded::Wire(p) => Some(AcmeIssuer::Wire(p.clone())),
            _ => None,
        }
    }

    /// The SCEP view.
    pub fn scep(&self) -> Option<Arc<ScepProvisioner>> {
        match self {
            Loaded::Scep(p) => Some(p.clone()),
            _ => None,
        }
    }
}

type Snapshot = Arc<HashMap<String, Loaded>>;

/// Copy-on-write provisioner registry.
pub struct Registry {
    current: RwLock<Snapshot>,
}

impl Registry {
    /// Builds a registry from persisted records.
    pub fn from_records(records: &[ProvisionerRecord]) -> Result<Self> {
        let mut map = HashMap::new();
        for record in records {
            if map.contains_key(&record.name) {
                return Err(Error::Internal(format!(
                    "duplicate provisioner name {:?}",
                    record.name
                )));
            }
            map.insert(record.name.clone(), Loaded::from_record(record)?);
        }
        Ok(Self {
            current: RwLock::new(Arc::new(map)),
        })
    }

    /// Loads all records from the `provisioners` bucket.
    pub async fn load(db: &dyn Db) -> Result<Self> {
        let mut records = Vec::new();
        for (_, raw) in db.list(Bucket::Provisioners).await? {
            records.push(cerion_db::decode::<ProvisionerRecord>(
                Bucket::Provisioners,
                &raw,
            )?);
        }
        Self::from_records(&records)
    }

    /// A point-in-time snapshot; cheap, lock-free reads afterwards.
    pub fn snapshot(&self) -> Snapshot {
        self.current
            .read()
            .expect("registry lock is never poisoned")
            .clone()
    }

    /// Looks up a provisioner by name in the current snapshot.
    pub fn get(&self, name: &str) -> Option<Loaded> {
        self.snapshot().get(name).cloned()
    }

    /// Finds the provisioner with the given stable ID.
    pub fn get_by_id(&self, id: &str) -> Option<Loaded> {
        self.snapshot()
            .values()
            .find(|loaded| loaded.provisioner().id() == id)
            .cloned()
    }

    /// Publishes a new or replaced provisioner; bumps `config_version` and
    /// persists the record before the snapshot swap.
    pub async fn upsert(&self, db: &dyn Db, mut record: ProvisionerRecord) -> Result<()> {
        record.config_version += 1;
        let loaded = Loaded::from_record(&record)?;
        let raw = cerion_db::encode(Bucket::Provisioners, &record)?;
        db.put(Bucket::Provisioners, record.name.as_bytes(), raw)
            .await?;

        let mut guard = self
            .current
            .write()
            .expect("registry lock is never poisoned");
        let mut next = (**guard).clone();
        next.insert(record.name.clone(), loaded);
        *guard = Arc::new(next);
        tracing::info!(
            provisioner = %record.name,
            kind = %record.kind,
            version = record.config_version,
            "published provisioner"
        );
        Ok(())
    }

    /// Removes a provisioner from the registry and the store.
    pub async fn remove(&self, db: &dyn Db, name: &str) -> Result<()> {
        db.del(Bucket::Provisioners, name.as_bytes()).await?;
        let mut guard = self
            .current
            .write()
            .expect("registry lock is never poisoned");
        let mut next = (**guard).clone();
        next.remove(name);
        *guard = Arc::new(next);
        Ok(())
    }
}

impl ProvisionerDirectory for Registry {
    fn lookup(&self, name: &str) -> Option<AcmeIssuer> {
        self.get(name).and_then(|loaded| loaded.acme_issuer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cerion_db::MemoryDb;
    use cerion_provisioner::{Claims, Options};

    fn jwk_record(name: &str) -> ProvisionerRecord {
        ProvisionerRecord {
            id: format!("jwk/{name}"),
            name: name.into(),
            kind: Kind::Jwk,
            config_version: 0,
            claims: Claims::default(),
            options: Options::default(),
            config: serde_json::json!({
                "keys": [{"kty": "EC", "crv": "P-256", "x": "eA", "y": "eQ", "kid": "k1"}],
            }),
        }
    }

    fn acme_record(name: &str) -> ProvisionerRecord {
        ProvisionerRecord {
            id: format!("acme/{name}"),
            name: name.into(),
            kind: Kind::Acme,
            config_version: 0,
            claims: Claims::default(),
            options: Options::default(),
            config: serde_json::json!({"requireEab": true}),
        }
    }

    #[test]
    fn builds_from_records_and_resolves_views() {
        let registry =
            Registry::from_records(&[jwk_record("ops"), acme_record("web")]).unwrap();
        assert!(registry.get("ops").is_some());
        assert!(registry.get("missing").is_none());

        // only ACME-capable provisioners resolve through the directory
        assert!(registry.lookup("web").is_some());
        assert!(registry.lookup("ops").is_none());
        assert!(registry.get_by_id("jwk/ops").is_some());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        assert!(Registry::from_records(&[jwk_record("ops"), jwk_record("ops")]).is_err());
    }

    #[tokio::test]
    async fn upsert_publishes_a_new_snapshot() {
        let db = MemoryDb::new();
        let registry = Registry::from_records(&[]).unwrap();
        let before = registry.snapshot();

        registry.upsert(&db, acme_record("web")).await.unwrap();
        assert!(before.is_empty());
        assert!(registry.get("web").is_some());

        // reload from the store sees the persisted record
        let reloaded = Registry::load(&db).await.unwrap();
        assert!(reloaded.get("web").is_some());

        registry.remove(&db, "web").await.unwrap();
        assert!(registry.get("web").is_none());
    }

    #[tokio::test]
    async fn upsert_bumps_config_version() {
        let db = MemoryDb::new();
        let registry = Registry::from_records(&[]).unwrap();
        registry.upsert(&db, acme_record("web")).await.unwrap();
        registry.upsert(&db, acme_record("web")).await.unwrap();

        let raw = db
            .get(Bucket::Provisioners, b"web")
            .await
            .unwrap();
        let record: ProvisionerRecord =
            cerion_db::decode(Bucket::Provisioners, &raw).unwrap();
        assert_eq!(record.config_version, 1);
    }
}
