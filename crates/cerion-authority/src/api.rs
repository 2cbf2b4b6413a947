//! Token API: `/1.0/sign`, `/1.0/renew`, `/1.0/revoke`.
//!
//! JSON bodies, internal `{type, detail, status}` errors. Transport
//! concerns (TLS, client certificates for renew-by-possession) live in the
//! embedding server; this surface consumes what the pipeline needs.

use crate::authority::RevocationAuth;
use crate::{Authority, Error};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Builds the token API router.
pub fn router(authority: Arc<Authority>) -> Router {
    Router::new()
        .route("/1.0/sign", post(sign))
        .route("/1.0/renew", post(renew))
        .route("/1.0/revoke", post(revoke))
        .route("/1.0/roots", get(roots))
        .route("/1.0/crl", get(crl))
        .with_state(authority)
}

#[derive(Debug, Serialize)]
struct Problem {
    #[serde(rename = "type")]
    kind: &'static str,
    detail: String,
    status: u16,
}

fn problem(err: Error) -> Response {
    let kind = match &err {
        Error::BadRequest(_) => "badRequest",
        Error::Unauthorized(_) => "unauthorized",
        Error::Forbidden(_) => "forbidden",
        Error::NotFound(_) => "notFound",
        Error::Conflict(_) => "conflict",
        Error::Transient(_) => "serviceUnavailable",
        Error::Internal(_) => "internalServerError",
    };
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Problem {
        kind,
        detail: err.to_string(),
        status: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignRequest {
    /// PEM CSR.
    csr: String,
    /// The provisioner token.
    ott: String,
    /// Optional provisioner name when the token cannot name it.
    #[serde(default)]
    provisioner: Option<String>,
    /// Requested lifetime in seconds, clamped by provisioner claims.
    #[serde(default)]
    not_after_seconds: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CertResponse {
    /// Leaf plus issuing certificate, PEM.
    crt: String,
    /// The CA certificate, PEM.
    ca: String,
}

async fn sign(State(authority): State<Arc<Authority>>, Json(body): Json<SignRequest>) -> Response {
    let requested = body.not_after_seconds.map(Duration::from_secs);
    match authority
        .sign(&body.csr, &body.ott, body.provisioner.as_deref(), requested)
        .await
    {
        Ok(chain) => Json(CertResponse {
            crt: chain.chain_pem,
            ca: authority.ca_pem().to_string(),
        })
        .into_response(),
        Err(e) => problem(e),
    }
}

#[derive(Debug, Deserialize)]
struct RenewRequest {
    /// The current certificate, PEM. Possession of its key is expected to
    /// be proven at the transport layer (mTLS).
    crt: String,
}

async fn renew(State(authority): State<Arc<Authority>>, Json(body): Json<RenewRequest>) -> Response {
    match authority.renew(&body.crt).await {
        Ok(chain) => Json(CertResponse {
            crt: chain.chain_pem,
            ca: authority.ca_pem().to_string(),
        })
        .into_response(),
        Err(e) => problem(e),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokeRequest {
    serial: String,
    #[serde(default)]
    reason_code: u8,
    /// Provisioner token authorizing the revocation; absent when the
    /// transport proved possession of the certificate key.
    #[serde(default)]
    ott: Option<String>,
}

async fn revoke(
    State(authority): State<Arc<Authority>>,
    Json(body): Json<RevokeRequest>,
) -> Response {
    let auth = match body.ott.as_deref() {
        Some(token) => RevocationAuth::Token(token),
        None => RevocationAuth::CertificateKey,
    };
    match authority.revoke(&body.serial, body.reason_code, auth).await {
        Ok(()) => Json(serde_json::json!({"status": "ok"})).into_response(),
        Err(e) => problem(e),
    }
}

async fn roots(State(authority): State<Arc<Authority>>) -> Response {
    Json(serde_json::json!({"ca": authority.ca_pem()})).into_response()
}

async fn crl(State(authority): State<Arc<Authority>>) -> Response {
    match authority.crl_der().await {
        Ok(der) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/pkix-crl")],
            der,
        )
            .into_response(),
        Err(e) => problem(e),
    }
}
