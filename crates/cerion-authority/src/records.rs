//! Persisted certificate state.

use cerion_cert::San;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A certificate issued by this CA, keyed by serial in the `certs` bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateRecord {
    /// Hex serial (128-bit random).
    pub serial: String,
    /// Leaf certificate, PEM.
    pub pem: String,
    /// Serial of the issuing CA certificate.
    pub issuer_serial: String,
    /// When the certificate was signed.
    pub issued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    /// ID of the provisioner that authorized issuance.
    pub provisioner_id: String,
    /// The ACME account that finalized the order, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub sans: Vec<San>,
}

/// A revocation, keyed by serial in the `revoked_certs` bucket.
///
/// Inserted at most once per serial (CAS against absence).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevocationRecord {
    pub serial: String,
    /// RFC 5280 reason code.
    pub reason_code: u8,
    pub revoked_at: DateTime<Utc>,
    /// CRL number current when the revocation was recorded.
    pub crl_number: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrip() {
        let record = CertificateRecord {
            serial: "0af3".into(),
            pem: "-----BEGIN CERTIFICATE-----".into(),
            issuer_serial: "01".into(),
            issued_at: Utc::now(),
            not_before: Utc::now(),
            not_after: Utc::now(),
            provisioner_id: "jwk/ops".into(),
            account_id: None,
            sans: vec![San::Dns("a.test".into())],
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: CertificateRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
