//! The curated template helper set.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use minijinja::{Error, ErrorKind};

pub(super) fn b64enc(value: String) -> String {
    STANDARD.encode(value.as_bytes())
}

pub(super) fn b64dec(value: String) -> Result<String, Error> {
    let raw = STANDARD
        .decode(value.as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("b64dec: {e}")))?;
    String::from_utf8(raw)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("b64dec: {e}")))
}

pub(super) fn b64urlenc(value: String) -> String {
    URL_SAFE_NO_PAD.encode(value.as_bytes())
}

pub(super) fn b64urldec(value: String) -> Result<String, Error> {
    let raw = URL_SAFE_NO_PAD
        .decode(value.as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("b64urldec: {e}")))?;
    String::from_utf8(raw)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("b64urldec: {e}")))
}

pub(super) fn hexenc(value: String) -> String {
    hex::encode(value.as_bytes())
}

pub(super) fn hexdec(value: String) -> Result<String, Error> {
    let raw = hex::decode(value.as_bytes())
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("hexdec: {e}")))?;
    String::from_utf8(raw)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("hexdec: {e}")))
}

pub(super) fn sanitize_host(value: String) -> Result<String, Error> {
    crate::leaf::sanitize_hostname(&value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

pub(super) fn uuidv4() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(super) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub(super) fn time_add(ts: String, seconds: i64) -> Result<String, Error> {
    let parsed = DateTime::parse_from_rfc3339(&ts)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, format!("time_add: {e}")))?;
    let shifted = parsed + chrono::Duration::seconds(seconds);
    Ok(shifted.to_rfc3339_opts(SecondsFormat::Secs, false))
}

pub(super) fn oid(value: String) -> Result<String, Error> {
    crate::leaf::parse_oid(&value)
        .map(|_| value)
        .map_err(|e| Error::new(ErrorKind::InvalidOperation, e.to_string()))
}

pub(super) fn fail(message: String) -> Result<minijinja::Value, Error> {
    Err(Error::new(ErrorKind::InvalidOperation, message))
}
