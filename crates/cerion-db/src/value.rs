//! Versioned value encoding.
//!
//! Every persisted value carries a leading version byte so future migrations
//! can be append-only: decoders accept any version they know, encoders
//! always write [`CURRENT_VERSION`].

use crate::{Bucket, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Version byte written in front of every serialized value.
pub const CURRENT_VERSION: u8 = 1;

/// Serializes `value` as JSON behind the current version byte.
pub fn encode<T: Serialize>(bucket: Bucket, value: &T) -> Result<Vec<u8>> {
    let mut out = vec![CURRENT_VERSION];
    serde_json::to_writer(&mut out, value).map_err(|e| Error::Corrupt {
        bucket,
        detail: format!("encode: {e}"),
    })?;
    Ok(out)
}

/// Decodes a versioned value previously written by [`encode`].
pub fn decode<T: DeserializeOwned>(bucket: Bucket, raw: &[u8]) -> Result<T> {
    let (&version, body) = raw.split_first().ok_or_else(|| Error::Corrupt {
        bucket,
        detail: "empty value".into(),
    })?;
    if version != CURRENT_VERSION {
        return Err(Error::Corrupt {
            bucket,
            detail: format!("unknown value version {version}"),
        });
    }
    serde_json::from_slice(body).map_err(|e| Error::Corrupt {
        bucket,
        detail: format!("decode: {e}"),
    })
}
