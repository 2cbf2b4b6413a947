//! ACME resource types and their state machines.
//!
//! These structs are both the wire shape (serde camelCase, RFC 8555 field
//! names) and the persisted shape (versioned JSON in the ACME buckets).
//! Status transitions are expressed as methods so the CAS discipline in
//! [`crate::db`] is the only way state changes.

use cerion_cert::San;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier types orders can name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdentifierType {
    Dns,
    Ip,
    /// RFC 8739-style permanent identifier, used with `device-attest-01`.
    PermanentIdentifier,
    /// Wire client IDs, used with the wire challenges.
    WireappUser,
    WireappDevice,
}

/// An order identifier: `{type, value}`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub kind: IdentifierType,
    pub value: String,
}

impl Identifier {
    pub fn dns(value: impl Into<String>) -> Self {
        Self {
            kind: IdentifierType::Dns,
            value: value.into(),
        }
    }

    /// The SAN this identifier certifies.
    pub fn to_san(&self) -> San {
        match self.kind {
            IdentifierType::Dns => San::Dns(self.value.clone()),
            IdentifierType::Ip => self
                .value
                .parse()
                .map(San::Ip)
                .unwrap_or_else(|_| San::Dns(self.value.clone())),
            // permanent identifiers and Wire IDs land in URI SANs
            IdentifierType::PermanentIdentifier
            | IdentifierType::WireappUser
            | IdentifierType::WireappDevice => San::Uri(self.value.clone()),
        }
    }
}

/// Account status per RFC 8555 §7.1.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    Valid,
    Deactivated,
    Revoked,
}

/// An ACME account.
///
/// Invariant: exactly one account exists per (provisioner, JWK thumbprint);
/// the `acme_account_by_key_id` index enforces it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub id: String,
    /// SHA-256 thumbprint of the account key (RFC 7638), scoped by
    /// provisioner in the index.
    pub key_id: String,
    /// The account public key.
    pub jwk: cerion_provisioner::Jwk,
    pub status: AccountStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact: Vec<String>,
    pub provisioner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eab_key_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Order status per RFC 8555 §7.1.6. Transitions are monotonic along
/// pending → ready → processing → valid; any non-terminal status may fall
/// to invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Valid | OrderStatus::Invalid)
    }
}

/// An ACME order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub account_id: String,
    pub provisioner: String,
    pub status: OrderStatus,
    /// Lexicographically canonicalized at creation.
    pub identifiers: Vec<Identifier>,
    pub authz_ids: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    /// Serial of the issued certificate once valid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub certificate_serial: Option<String>,
    /// Problem recorded when the order went invalid.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Order {
    /// Sorts and dedups identifiers into canonical form.
    pub fn canonicalize(mut identifiers: Vec<Identifier>) -> Vec<Identifier> {
        identifiers.sort();
        identifiers.dedup();
        identifiers
    }
}

/// Authorization status per RFC 8555 §7.1.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthzStatus {
    Pending,
    Valid,
    Invalid,
    Expired,
    Revoked,
    Deactivated,
}

/// An ACME authorization: one identifier, several challenges.
///
/// Valid iff at least one challenge is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Authorization {
    pub id: String,
    pub order_id: String,
    pub account_id: String,
    pub identifier: Identifier,
    pub status: AuthzStatus,
    pub challenge_ids: Vec<String>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub wildcard: bool,
}

/// Challenge types the server can offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChallengeType {
    #[serde(rename = "http-01")]
    Http01,
    #[serde(rename = "dns-01")]
    Dns01,
    #[serde(rename = "tls-alpn-01")]
    TlsAlpn01,
    #[serde(rename = "device-attest-01")]
    DeviceAttest01,
    #[serde(rename = "wire-oidc-01")]
    WireOidc01,
    #[serde(rename = "wire-dpop-01")]
    WireDpop01,
}

impl ChallengeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeType::Http01 => "http-01",
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::TlsAlpn01 => "tls-alpn-01",
            ChallengeType::DeviceAttest01 => "device-attest-01",
            ChallengeType::WireOidc01 => "wire-oidc-01",
            ChallengeType::WireDpop01 => "wire-dpop-01",
        }
    }
}

/// Challenge status per RFC 8555 §8. `valid` and `invalid` are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeStatus {
    Pending,
    Processing,
    Valid,
    Invalid,
}

impl ChallengeStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ChallengeStatus::Valid | ChallengeStatus::Invalid)
    }
}

/// An ACME challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Challenge {
    pub id: String,
    pub authz_id: String,
    pub account_id: String,
    #[serde(rename = "type")]
    pub kind: ChallengeType,
    /// ≥128 bits of entropy, base64url.
    pub token: String,
    pub status: ChallengeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validated_at: Option<DateTime<Utc>>,
    /// Last validation attempt, for the 5-second reschedule floor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Proof captured on success (fetched body digest, device serial, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_proof: Option<String>,
}

/// Revocation reason codes (RFC 5280 §5.3.1); 7 is unassigned.
pub fn reason_code_allowed(code: u8) -> bool {
    code <= 10 && code != 7
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_canonicalization_sorts_and_dedups() {
        let ids = Order::canonicalize(vec![
            Identifier::dns("b.com"),
            Identifier::dns("a.com"),
            Identifier::dns("b.com"),
        ]);
        assert_eq!(ids, vec![Identifier::dns("a.com"), Identifier::dns("b.com")]);
    }

    #[test]
    fn status_serde_uses_rfc_names() {
        assert_eq!(
            serde_json::to_string(&OrderStatus::Processing).unwrap(),
            "\"processing\""
        );
        assert_eq!(
            serde_json::to_string(&ChallengeType::TlsAlpn01).unwrap(),
            "\"tls-alpn-01\""
        );
        assert_eq!(
            serde_json::to_string(&IdentifierType::PermanentIdentifier).unwrap(),
            "\"permanent-identifier\""
        );
    }

    #[test]
    fn order_json_roundtrip() {
        let order = Order {
            id: "o1".into(),
            account_id: "a1".into(),
            provisioner: "web".into(),
            status: OrderStatus::Pending,
            identifiers: vec![Identifier::dns("a.test")],
            authz_ids: vec!["z1".into()],
            not_before: None,
            not_after: None,
            expires_at: Utc::now(),
            certificate_serial: None,
            error: None,
        };
        let json = serde_json::to_string(&order).unwrap();
        let back: Order = serde_json::from_str(&json).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn challenge_json_roundtrip() {
        let challenge = Challenge {
            id: "c1".into(),
            authz_id: "z1".into(),
            account_id: "a1".into(),
            kind: ChallengeType::Http01,
            token: "tok".into(),
            status: ChallengeStatus::Pending,
            validated_at: None,
            last_attempt_at: None,
            error: None,
            validation_proof: None,
        };
        let json = serde_json::to_string(&challenge).unwrap();
        let back: Challenge = serde_json::from_str(&json).unwrap();
        assert_eq!(back, challenge);
    }

    #[test]
    fn terminal_statuses() {
        assert!(OrderStatus::Valid.is_terminal());
        assert!(OrderStatus::Invalid.is_terminal());
        assert!(!OrderStatus::Processing.is_terminal());
        assert!(ChallengeStatus::Valid.is_terminal());
        assert!(!ChallengeStatus::Processing.is_terminal());
    }

    #[test]
    fn revocation_reason_codes() {
        assert!(reason_code_allowed(0));
        assert!(reason_code_allowed(1));
        assert!(!reason_code_allowed(7));
        assert!(reason_code_allowed(10));
        assert!(!reason_code_allowed(11));
    }
}
