//! The rendered certificate document.
//!
//! Template rendering produces a JSON document with this shape; the pipeline
//! parses it into a [`Leaf`], applies claims and policy, and maps it onto
//! `rcgen::CertificateParams` for signing.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Subject distinguished name fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Subject {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub common_name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub organization: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub organizational_unit: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub country: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub locality: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub province: Vec<String>,
}

/// A subject alternative name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum San {
    Dns(String),
    Ip(IpAddr),
    Email(String),
    Uri(String),
}

impl San {
    /// Classifies a bare identifier string into a SAN.
    ///
    /// IP literals become [`San::Ip`], values with an `@` become
    /// [`San::Email`], values with a URI scheme become [`San::Uri`], and
    /// everything else is treated as a DNS name.
    pub fn detect(value: &str) -> San {
        if let Ok(addr) = value.parse::<IpAddr>() {
            return San::Ip(addr);
        }
        if value.contains('@') {
            return San::Email(value.to_string());
        }
        if value.contains("://") {
            return San::Uri(value.to_string());
        }
        San::Dns(value.to_string())
    }

    /// The identifier kind, as used in policy errors and audit records.
    pub fn kind(&self) -> &'static str {
        match self {
            San::Dns(_) => "dns",
            San::Ip(_) => "ip",
            San::Email(_) => "email",
            San::Uri(_) => "uri",
        }
    }

    /// The identifier value in its canonical string form.
    pub fn value(&self) -> String {
        match self {
            San::Dns(v) | San::Email(v) | San::Uri(v) => v.clone(),
            San::Ip(v) => v.to_string(),
        }
    }
}

impl std::fmt::Display for San {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// X.509 key usage bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyUsage {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    CertSign,
    CrlSign,
}

impl KeyUsage {
    fn rcgen(self) -> rcgen::KeyUsagePurpose {
        use rcgen::KeyUsagePurpose as P;
        match self {
            KeyUsage::DigitalSignature => P::DigitalSignature,
            KeyUsage::ContentCommitment => P::ContentCommitment,
            KeyUsage::KeyEncipherment => P::KeyEncipherment,
            KeyUsage::DataEncipherment => P::DataEncipherment,
            KeyUsage::KeyAgreement => P::KeyAgreement,
            KeyUsage::CertSign => P::KeyCertSign,
            KeyUsage::CrlSign => P::CrlSign,
        }
    }
}

/// X.509 extended key usage purposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExtKeyUsage {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

impl ExtKeyUsage {
    fn rcgen(self) -> rcgen::ExtendedKeyUsagePurpose {
        use rcgen::ExtendedKeyUsagePurpose as P;
        match self {
            ExtKeyUsage::ServerAuth => P::ServerAuth,
            ExtKeyUsage::ClientAuth => P::ClientAuth,
            ExtKeyUsage::CodeSigning => P::CodeSigning,
            ExtKeyUsage::EmailProtection => P::EmailProtection,
            ExtKeyUsage::TimeStamping => P::TimeStamping,
            ExtKeyUsage::OcspSigning => P::OcspSigning,
        }
    }
}

/// An arbitrary certificate extension carried through from the template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    /// Dotted-decimal OID.
    pub id: String,
    #[serde(default)]
    pub critical: bool,
    /// Base64-encoded DER content.
    pub value: String,
}

/// The certificate document a template renders to.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Leaf {
    pub subject: Subject,
    pub sans: Vec<San>,
    pub key_usage: Vec<KeyUsage>,
    pub ext_key_usage: Vec<ExtKeyUsage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub extensions: Vec<Extension>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,
}

impl Leaf {
    /// Parses a rendered template output into a leaf document.
    pub fn parse(rendered: &str) -> Result<Self> {
        let leaf: Leaf =
            serde_json::from_str(rendered).map_err(|e| Error::InvalidLeaf(e.to_string()))?;
        if leaf.subject.common_name.is_empty() && leaf.sans.is_empty() {
            return Err(Error::InvalidLeaf(
                "leaf must carry a subject common name or at least one SAN".into(),
            ));
        }
        Ok(leaf)
    }

    /// Maps the document onto rcgen certificate parameters.
    ///
    /// Validity bounds are applied only when present; the issuance pipeline
    /// sets and clamps them before signing.
    pub fn to_params(&self) -> Result<rcgen::CertificateParams> {
        let mut params = rcgen::CertificateParams::new(vec![])
            .map_err(|e| Error::CertField(format!("params: {e}")))?;

        let mut dn = rcgen::DistinguishedName::new();
        if !self.subject.common_name.is_empty() {
            dn.push(rcgen::DnType::CommonName, self.subject.common_name.clone());
        }
        for v in &self.subject.organization {
            dn.push(rcgen::DnType::OrganizationName, v.clone());
        }
        for v in &self.subject.organizational_unit {
            dn.push(rcgen::DnType::OrganizationalUnitName, v.clone());
        }
        for v in &self.subject.country {
            dn.push(rcgen::DnType::CountryName, v.clone());
        }
        for v in &self.subject.locality {
            dn.push(rcgen::DnType::LocalityName, v.clone());
        }
        for v in &self.subject.province {
            dn.push(rcgen::DnType::StateOrProvinceName, v.clone());
        }
        params.distinguished_name = dn;

        for san in &self.sans {
            let entry = match san {
                San::Dns(name) => rcgen::SanType::DnsName(ia5(name)?),
                San::Ip(addr) => rcgen::SanType::IpAddress(*addr),
                San::Email(addr) => rcgen::SanType::Rfc822Name(ia5(addr)?),
                San::Uri(uri) => rcgen::SanType::URI(ia5(uri)?),
            };
            params.subject_alt_names.push(entry);
        }

        params.is_ca = rcgen::IsCa::ExplicitNoCa;
        params.key_usages = self.key_usage.iter().map(|u| u.rcgen()).collect();
        params.extended_key_usages = self.ext_key_usage.iter().map(|u| u.rcgen()).collect();

        for ext in &self.extensions {
            let oid = parse_oid(&ext.id)?;
            let content = base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                ext.value.as_bytes(),
            )
            .map_err(|e| Error::CertField(format!("extension {}: {e}", ext.id)))?;
            let mut custom = rcgen::CustomExtension::from_oid_content(&oid, content);
            custom.set_criticality(ext.critical);
            params.custom_extensions.push(custom);
        }

        if let Some(nb) = self.not_before {
            params.not_before = to_offset(nb)?;
        }
        if let Some(na) = self.not_after {
            params.not_after = to_offset(na)?;
        }

        Ok(params)
    }
}

fn ia5(value: &str) -> Result<rcgen::string::Ia5String> {
    rcgen::string::Ia5String::try_from(value.to_string())
        .map_err(|e| Error::CertField(format!("{value:?}: {e}")))
}

fn to_offset(ts: DateTime<Utc>) -> Result<time::OffsetDateTime> {
    time::OffsetDateTime::from_unix_timestamp(ts.timestamp())
        .map_err(|e| Error::CertField(format!("timestamp {ts}: {e}")))
}

/// Parses a dotted-decimal OID into its arc components.
pub fn parse_oid(oid: &str) -> Result<Vec<u64>> {
    let arcs: std::result::Result<Vec<u64>, _> =
        oid.split('.').map(|p| p.parse::<u64>()).collect();
    let arcs = arcs.map_err(|_| Error::CertField(format!("invalid OID {oid:?}")))?;
    if arcs.len() < 2 {
        return Err(Error::CertField(format!("invalid OID {oid:?}")));
    }
    Ok(arcs)
}

/// Normalizes a hostname for use as a DNS SAN.
///
/// Lowercases, strips a single trailing dot, and rejects anything outside
/// LDH labels (a single leading wildcard label is allowed).
pub fn sanitize_hostname(name: &str) -> Result<String> {
    let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
    if name.is_empty() || name.len() > 253 {
        return Err(Error::CertField(format!("invalid hostname {name:?}")));
    }
    for (i, label) in name.split('.').enumerate() {
        if label == "*" && i == 0 {
            continue;
        }
        let ok = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !ok {
            return Err(Error::CertField(format!("invalid hostname {name:?}")));
        }
    }
    Ok(name)
}
