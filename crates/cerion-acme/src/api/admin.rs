//! EAB admin endpoints.
//!
//! CRUD for External Account Binding keys, mounted under
//! `/admin/acme/{provisioner}/eab`. Requests are only honored when the
//! target provisioner exists and has `requireEAB` enabled; authentication
//! of the admin caller is outer middleware. Errors use the internal
//! `{type, detail, status}` shape, not ACME problems.
//!
//! The HMAC key material is returned exactly once, in the create response.

use crate::api::SharedState;
use crate::eab::ExternalAccountKey;
use crate::{Error, ErrorKind};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

/// Builds the EAB admin router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/admin/acme/{prov}/eab", post(create_key).get(list_keys))
        .route(
            "/admin/acme/{prov}/eab/{key}",
            get(get_by_reference).delete(delete_key),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct AdminProblem {
    #[serde(rename = "type")]
    kind: &'static str,
    detail: String,
    status: u16,
}

fn admin_error(status: StatusCode, kind: &'static str, detail: impl Into<String>) -> Response {
    let body = AdminProblem {
        kind,
        detail: detail.into(),
        status: status.as_u16(),
    };
    (status, Json(body)).into_response()
}

fn from_acme_error(err: Error) -> Response {
    let status = StatusCode::from_u16(err.kind.status()).unwrap_or(StatusCode::BAD_REQUEST);
    let kind = match err.kind {
        ErrorKind::ServerInternal => "internalServerError",
        _ => "badRequest",
    };
    admin_error(status, kind, err.detail)
}

/// 400 unless the provisioner exists and has EAB enabled.
fn require_eab_enabled(state: &SharedState, prov: &str) -> Result<(), Response> {
    match state.provisioners.lookup(prov) {
        None => Err(admin_error(
            StatusCode::NOT_FOUND,
            "notFound",
            format!("unknown provisioner {prov:?}"),
        )),
        Some(issuer) if !issuer.require_eab() => Err(admin_error(
            StatusCode::BAD_REQUEST,
            "badRequest",
            format!("ACME EAB not enabled for provisioner {prov}"),
        )),
        Some(_) => Ok(()),
    }
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    #[serde(default)]
    reference: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct EabKeyResponse {
    id: String,
    provisioner: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference: Option<String>,
    /// base64url HMAC key; present only in the create response.
    #[serde(skip_serializing_if = "String::is_empty")]
    hmac_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    account: Option<String>,
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bound_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl EabKeyResponse {
    fn from_key(key: &ExternalAccountKey, include_secret: bool) -> Self {
        Self {
            id: key.id.clone(),
            provisioner: key.provisioner.clone(),
            reference: key.reference.clone(),
            hmac_key: if include_secret {
                URL_SAFE_NO_PAD.encode(&key.hmac_key)
            } else {
                String::new()
            },
            account: key.bound_account.clone(),
            created_at: key.created_at,
            bound_at: key.bound_at,
        }
    }
}

async fn create_key(
    State(state): State<SharedState>,
    Path(prov): Path<String>,
    Json(body): Json<CreateKeyRequest>,
) -> Response {
    if let Err(response) = require_eab_enabled(&state, &prov) {
        return response;
    }
    let reference = (!body.reference.is_empty()).then_some(body.reference);

    // a reference must not collide with an existing key
    if let Some(reference) = &reference {
        match state.db.eab_key_by_reference(&prov, reference).await {
            Ok(Some(_)) => {
                return admin_error(
                    StatusCode::CONFLICT,
                    "badRequest",
                    format!(
                        "an ACME EAB key for provisioner {prov} with reference {reference} already exists"
                    ),
                )
            }
            Ok(None) => {}
            Err(e) => return from_acme_error(e),
        }
    }

    match state.db.create_eab_key(&prov, reference).await {
        Ok(key) => {
            tracing::info!(provisioner = %prov, key = %key.id, "created EAB key");
            (
                StatusCode::CREATED,
                Json(EabKeyResponse::from_key(&key, true)),
            )
                .into_response()
        }
        Err(e) => from_acme_error(e),
    }
}

#[derive(Debug, Serialize)]
struct ListKeysResponse {
    eaks: Vec<EabKeyResponse>,
}

async fn list_keys(State(state): State<SharedState>, Path(prov): Path<String>) -> Response {
    if let Err(response) = require_eab_enabled(&state, &prov) {
        return response;
    }
    match state.db.eab_keys_for_provisioner(&prov).await {
        Ok(keys) => {
            let eaks = keys
                .iter()
                .map(|k| EabKeyResponse::from_key(k, false))
                .collect();
            (StatusCode::OK, Json(ListKeysResponse { eaks })).into_response()
        }
        Err(e) => from_acme_error(e),
    }
}

async fn get_by_reference(
    State(state): State<SharedState>,
    Path((prov, reference)): Path<(String, String)>,
) -> Response {
    if let Err(response) = require_eab_enabled(&state, &prov) {
        return response;
    }
    match state.db.eab_key_by_reference(&prov, &reference).await {
        Ok(Some(stored)) => (
            StatusCode::OK,
            Json(EabKeyResponse::from_key(&stored.value, false)),
        )
            .into_response(),
        Ok(None) => admin_error(
            StatusCode::NOT_FOUND,
            "notFound",
            format!("no EAB key with reference {reference:?}"),
        ),
        Err(e) => from_acme_error(e),
    }
}

async fn delete_key(
    State(state): State<SharedState>,
    Path((prov, id)): Path<(String, String)>,
) -> Response {
    if let Err(response) = require_eab_enabled(&state, &prov) {
        return response;
    }
    match state.db.delete_eab_key(&id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "ok"})),
        )
            .into_response(),
        Err(e) => from_acme_error(e),
    }
}
