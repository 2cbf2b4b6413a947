//! Key URI parsing.
//!
//! Key URIs name a key within a backend: `softkms:leaf-ca`,
//! `pkcs11:token=hsm;object=intermediate`, `awskms:alias/ca`. The scheme
//! selects the backend; the opaque part is interpreted by it.

use crate::{Error, Result};
use std::fmt;

/// A parsed key URI.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyUri {
    scheme: String,
    opaque: String,
}

impl KeyUri {
    /// Parses a key URI of the form `scheme:opaque`.
    pub fn parse(uri: &str) -> Result<Self> {
        let (scheme, opaque) = uri
            .split_once(':')
            .ok_or_else(|| Error::InvalidUri(format!("missing scheme separator: {uri}")))?;
        if scheme.is_empty() {
            return Err(Error::InvalidUri(format!("empty scheme: {uri}")));
        }
        if opaque.is_empty() {
            return Err(Error::InvalidUri(format!("empty key name: {uri}")));
        }
        if !scheme.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(Error::InvalidUri(format!("invalid scheme: {scheme}")));
        }
        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            opaque: opaque.to_string(),
        })
    }

    /// Builds a key URI from a backend scheme and a key name.
    pub fn new(scheme: impl Into<String>, opaque: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            opaque: opaque.into(),
        }
    }

    /// The backend scheme (`softkms`, `pkcs11`, ...).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The backend-interpreted key name.
    pub fn opaque(&self) -> &str {
        &self.opaque
    }
}

impl fmt::Display for KeyUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme, self.opaque)
    }
}

impl std::str::FromStr for KeyUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_soft_uri() {
        let uri = KeyUri::parse("softkms:leaf-ca").unwrap();
        assert_eq!(uri.scheme(), "softkms");
        assert_eq!(uri.opaque(), "leaf-ca");
    }

    #[test]
    fn parse_pkcs11_uri() {
        let uri = KeyUri::parse("pkcs11:token=hsm;object=ca").unwrap();
        assert_eq!(uri.scheme(), "pkcs11");
        assert_eq!(uri.opaque(), "token=hsm;object=ca");
    }

    #[test]
    fn scheme_is_lowercased() {
        let uri = KeyUri::parse("SoftKMS:ca").unwrap();
        assert_eq!(uri.scheme(), "softkms");
    }

    #[test]
    fn rejects_missing_scheme() {
        assert!(matches!(KeyUri::parse("leaf-ca"), Err(Error::InvalidUri(_))));
    }

    #[test]
    fn rejects_empty_parts() {
        assert!(KeyUri::parse(":name").is_err());
        assert!(KeyUri::parse("softkms:").is_err());
    }

    #[test]
    fn roundtrip_display() {
        let uri = KeyUri::parse("softkms:leaf-ca").unwrap();
        assert_eq!(uri.to_string(), "softkms:leaf-ca");
        let again: KeyUri = uri.to_string().parse().unwrap();
        assert_eq!(uri, again);
    }
}
