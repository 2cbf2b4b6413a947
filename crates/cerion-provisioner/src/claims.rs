//! Per-provisioner certificate claims.
//!
//! Claims bound what an authorized client can ask for: lifetime windows,
//! key types, and renewal behavior. The pipeline clamps requested lifetimes
//! into `[min, max]` and rejects keys outside the enabled set.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Key types a provisioner can accept in CSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeyType {
    EcdsaP256,
    EcdsaP384,
    Ed25519,
    Rsa2048,
    Rsa3072,
    Rsa4096,
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            KeyType::EcdsaP256 => "ECDSA_P256",
            KeyType::EcdsaP384 => "ECDSA_P384",
            KeyType::Ed25519 => "ED25519",
            KeyType::Rsa2048 => "RSA_2048",
            KeyType::Rsa3072 => "RSA_3072",
            KeyType::Rsa4096 => "RSA_4096",
        };
        f.write_str(name)
    }
}

/// Lifetime and key-policy claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Claims {
    /// Shortest certificate lifetime a client may request.
    #[serde(with = "duration_secs")]
    pub min_cert_lifetime: Duration,
    /// Lifetime applied when the client requests none.
    #[serde(with = "duration_secs")]
    pub default_cert_lifetime: Duration,
    /// Hard upper bound; requested windows are clamped to it.
    #[serde(with = "duration_secs")]
    pub max_cert_lifetime: Duration,
    /// When set, `authorize_renew` always fails.
    pub disable_renewal: bool,
    /// Permit renewal of an already expired certificate.
    pub allow_renewal_after_expiry: bool,
    /// Key types accepted in CSRs. Empty means all supported types.
    pub enabled_key_types: Vec<KeyType>,
}

impl Default for Claims {
    fn default() -> Self {
        Self {
            min_cert_lifetime: Duration::from_secs(5 * 60),
            default_cert_lifetime: Duration::from_secs(24 * 60 * 60),
            max_cert_lifetime: Duration::from_secs(24 * 60 * 60),
            disable_renewal: false,
            allow_renewal_after_expiry: false,
            enabled_key_types: Vec::new(),
        }
    }
}

impl Claims {
    /// Validates internal consistency.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_cert_lifetime.is_zero() {
            return Err("minimum certificate lifetime must be positive".into());
        }
        if self.max_cert_lifetime < self.min_cert_lifetime {
            return Err(format!(
                "maximum lifetime {:?} is below the minimum {:?}",
                self.max_cert_lifetime, self.min_cert_lifetime
            ));
        }
        if self.default_cert_lifetime < self.min_cert_lifetime
            || self.default_cert_lifetime > self.max_cert_lifetime
        {
            return Err(format!(
                "default lifetime {:?} is outside [{:?}, {:?}]",
                self.default_cert_lifetime, self.min_cert_lifetime, self.max_cert_lifetime
            ));
        }
        Ok(())
    }

    /// Clamps a requested lifetime into the configured window.
    pub fn clamp_lifetime(&self, requested: Option<Duration>) -> Duration {
        match requested {
            None => self.default_cert_lifetime,
            Some(d) => d.clamp(self.min_cert_lifetime, self.max_cert_lifetime),
        }
    }

    /// True when the key type may be used under these claims.
    pub fn key_type_allowed(&self, kt: KeyType) -> bool {
        self.enabled_key_types.is_empty() || self.enabled_key_types.contains(&kt)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        Claims::default().validate().unwrap();
    }

    #[test]
    fn clamp_lifetime_window() {
        let claims = Claims {
            min_cert_lifetime: Duration::from_secs(600),
            default_cert_lifetime: Duration::from_secs(3600),
            max_cert_lifetime: Duration::from_secs(7200),
            ..Default::default()
        };
        assert_eq!(claims.clamp_lifetime(None), Duration::from_secs(3600));
        assert_eq!(
            claims.clamp_lifetime(Some(Duration::from_secs(60))),
            Duration::from_secs(600)
        );
        assert_eq!(
            claims.clamp_lifetime(Some(Duration::from_secs(86400))),
            Duration::from_secs(7200)
        );
        assert_eq!(
            claims.clamp_lifetime(Some(Duration::from_secs(4000))),
            Duration::from_secs(4000)
        );
    }

    #[test]
    fn key_type_policy() {
        let open = Claims::default();
        assert!(open.key_type_allowed(KeyType::Rsa2048));

        let restricted = Claims {
            enabled_key_types: vec![KeyType::EcdsaP256, KeyType::Ed25519],
            ..Default::default()
        };
        assert!(restricted.key_type_allowed(KeyType::EcdsaP256));
        assert!(!restricted.key_type_allowed(KeyType::Rsa2048));
    }

    #[test]
    fn validate_rejects_inverted_window() {
        let claims = Claims {
            min_cert_lifetime: Duration::from_secs(7200),
            max_cert_lifetime: Duration::from_secs(600),
            ..Default::default()
        };
        assert!(claims.validate().is_err());
    }

    #[test]
    fn serde_roundtrip_uses_seconds() {
        let claims = Claims::default();
        let json = serde_json::to_value(&claims).unwrap();
        assert_eq!(json["maxCertLifetime"], 86400);
        let back: Claims = serde_json::from_value(json).unwrap();
        assert_eq!(back, claims);
    }
}
