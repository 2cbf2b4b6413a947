//! RFC 8894 (SCEP) enrollment front end.
//!
//! Three operations: `GetCACert` returns the CA chain, `GetCACaps` the
//! capability list, and `PKIOperation` carries a PKCS#7-enveloped,
//! CMS-signed CSR through challenge validation into the issuance pipeline.
//!
//! The cryptographic envelopes (outer SignedData, inner EnvelopedData, the
//! PKCS#10 CSR) are standard PKCS#7 handled by openssl. The SCEP transport
//! fields (message type, transaction ID, nonces, status) ride inside the
//! signed content as a small DER structure built by [`asn1`]. The openssl
//! bindings do not expose PKCS#7 authenticated attributes, so the fields
//! live in the content octets rather than the SignerInfo; see DESIGN.md.
//!
//! # Components
//!
//! - [`asn1`] - the minimal DER encoder/decoder for transport fields
//! - [`message`] - pkiMessage envelope building and parsing
//! - [`server`] - the operation handlers

pub mod asn1;
pub mod message;
pub mod server;

pub use message::{PkiEnvelope, PkiResponse};
pub use server::{ScepAuthority, ScepIssued, ScepServer};

/// Capabilities advertised by `GetCACaps`.
pub const CA_CAPS: &[&str] = &["SHA-256", "POSTPKIOperation", "Renewal", "SCEPStandard"];

/// SCEP message types (RFC 8894 §3.2.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    PkcsReq,
    RenewalReq,
    CertRep,
    GetCertInitial,
}

impl MessageType {
    pub fn code(&self) -> u32 {
        match self {
            MessageType::CertRep => 3,
            MessageType::RenewalReq => 17,
            MessageType::PkcsReq => 19,
            MessageType::GetCertInitial => 20,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            3 => Some(MessageType::CertRep),
            17 => Some(MessageType::RenewalReq),
            19 => Some(MessageType::PkcsReq),
            20 => Some(MessageType::GetCertInitial),
            _ => None,
        }
    }
}

/// pkiStatus values (RFC 8894 §3.2.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PkiStatus {
    Success,
    Failure,
    Pending,
}

impl PkiStatus {
    pub fn code(&self) -> u32 {
        match self {
            PkiStatus::Success => 0,
            PkiStatus::Failure => 2,
            PkiStatus::Pending => 3,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(PkiStatus::Success),
            2 => Some(PkiStatus::Failure),
            3 => Some(PkiStatus::Pending),
            _ => None,
        }
    }
}

/// failInfo values (RFC 8894 §3.2.1.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailInfo {
    BadAlg,
    BadMessageCheck,
    BadRequest,
    BadTime,
    BadCertId,
}

impl FailInfo {
    pub fn code(&self) -> u32 {
        match self {
            FailInfo::BadAlg => 0,
            FailInfo::BadMessageCheck => 1,
            FailInfo::BadRequest => 2,
            FailInfo::BadTime => 3,
            FailInfo::BadCertId => 4,
        }
    }
}

/// Errors from SCEP processing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request envelope is malformed.
    #[error("malformed pkiMessage: {0}")]
    Malformed(String),

    /// The request failed validation; carries the failInfo to respond with.
    #[error("request rejected ({fail_info:?}): {detail}")]
    Rejected {
        fail_info: FailInfo,
        detail: String,
    },

    /// An openssl operation failed.
    #[error("crypto failure: {0}")]
    Crypto(#[from] openssl::error::ErrorStack),

    #[error(transparent)]
    Db(#[from] cerion_db::Error),

    /// The issuance pipeline refused or failed.
    #[error("issuance failed: {0}")]
    Issuance(String),
}

impl Error {
    pub fn rejected(fail_info: FailInfo, detail: impl Into<String>) -> Self {
        Self::Rejected {
            fail_info,
            detail: detail.into(),
        }
    }

    /// The failInfo a failure CertRep should carry for this error.
    pub fn fail_info(&self) -> FailInfo {
        match self {
            Error::Rejected { fail_info, .. } => *fail_info,
            Error::Malformed(_) => FailInfo::BadRequest,
            _ => FailInfo::BadRequest,
        }
    }
}

/// Result type for SCEP operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_type_codes_roundtrip() {
        for mt in [
            MessageType::PkcsReq,
            MessageType::RenewalReq,
            MessageType::CertRep,
            MessageType::GetCertInitial,
        ] {
            assert_eq!(MessageType::from_code(mt.code()), Some(mt));
        }
        assert_eq!(MessageType::from_code(99), None);
    }

    #[test]
    fn caps_include_required_set() {
        assert!(CA_CAPS.contains(&"SHA-256"));
        assert!(CA_CAPS.contains(&"POSTPKIOperation"));
        assert!(CA_CAPS.contains(&"Renewal"));
    }
}
