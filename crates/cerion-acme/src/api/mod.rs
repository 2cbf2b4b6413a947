//! ACME HTTP handlers and routers.
//!
//! One router serves `/acme/{provisioner}/...` per RFC 8555; a second
//! serves the EAB admin surface. Outer middleware (authentication for the
//! admin router, TLS, logging) is wired by the embedding server.
//!
//! Every response carries a fresh `Replay-Nonce`; errors render as RFC
//! 7807 problem+json with the ACME error URN.

pub mod admin;

use crate::challenge::ChallengeValidator;
use crate::db::{random_token, AcmeDb, Stored};
use crate::eab::{eab_kid, verify_eab, EabJws};
use crate::jws::{self, KeyBinding};
use crate::nonce::NonceService;
use crate::order::OrderService;
use crate::types::{
    reason_code_allowed, Account, AccountStatus, Authorization, Challenge, Identifier, Order,
};
use crate::{
    AcmeIssuer, CertificateAuthority, Error, ErrorKind, ProvisionerDirectory, Result,
};
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cerion_provisioner::Jwk;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// Shared state behind the ACME routers.
pub struct AcmeState {
    pub db: AcmeDb,
    pub orders: OrderService,
    pub validator: Arc<ChallengeValidator>,
    pub nonces: Arc<NonceService>,
    pub authority: Arc<dyn CertificateAuthority>,
    pub provisioners: Arc<dyn ProvisionerDirectory>,
    /// External base URL, e.g. `https://ca.example.com`.
    pub base_url: url::Url,
}

pub type SharedState = Arc<AcmeState>;

impl AcmeState {
    fn url(&self, provisioner: &str, suffix: &str) -> String {
        format!(
            "{}/acme/{provisioner}/{suffix}",
            self.base_url.as_str().trim_end_matches('/')
        )
    }

    fn account_url(&self, provisioner: &str, account_id: &str) -> String {
        self.url(provisioner, &format!("account/{account_id}"))
    }

    fn issuer(&self, provisioner: &str) -> Result<AcmeIssuer> {
        self.provisioners.lookup(provisioner).ok_or_else(|| {
            Error::malformed(format!("unknown ACME provisioner {provisioner:?}"))
        })
    }
}

/// Builds the RFC 8555 router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/acme/{prov}/directory", get(directory))
        .route("/acme/{prov}/new-nonce", get(new_nonce).head(new_nonce))
        .route("/acme/{prov}/new-account", post(new_account))
        .route("/acme/{prov}/account/{id}", post(update_account))
        .route("/acme/{prov}/key-change", post(key_change))
        .route("/acme/{prov}/new-order", post(new_order))
        .route("/acme/{prov}/order/{id}", post(get_order))
        .route("/acme/{prov}/order/{id}/finalize", post(finalize_order))
        .route("/acme/{prov}/authz/{id}", post(get_authz))
        .route("/acme/{prov}/challenge/{id}", post(post_challenge))
        .route("/acme/{prov}/certificate/{serial}", post(get_certificate))
        .route("/acme/{prov}/revoke-cert", post(revoke_cert))
        .with_state(state)
}

// ── plumbing ──

/// Renders an ACME problem document.
fn problem(err: &Error) -> Response {
    let mut body = serde_json::json!({
        "type": err.type_urn(),
        "detail": err.detail,
    });
    if !err.subproblems.is_empty() {
        body["subproblems"] = serde_json::to_value(&err.subproblems).unwrap_or_default();
    }
    let mut response = Response::new(axum::body::Body::from(body.to_string()));
    *response.status_mut() =
        StatusCode::from_u16(err.kind.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/problem+json"),
    );
    response
}

/// Finishes a handler: renders errors, stamps a fresh `Replay-Nonce`, and
/// links back to the directory.
async fn respond(state: &AcmeState, provisioner: &str, result: Result<Response>) -> Response {
    let mut response = match result {
        Ok(response) => response,
        Err(err) => problem(&err),
    };
    if let Ok(nonce) = state.nonces.issue().await {
        if let Ok(value) = HeaderValue::from_str(&nonce) {
            response.headers_mut().insert("replay-nonce", value);
        }
    }
    let index = format!("<{}>;rel=\"index\"", state.url(provisioner, "directory"));
    if let Ok(value) = HeaderValue::from_str(&index) {
        response.headers_mut().append(header::LINK, value);
    }
    response
}

fn json_response(status: StatusCode, body: &serde_json::Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// A verified ACME request.
struct VerifiedPost {
    issuer: AcmeIssuer,
    payload: Vec<u8>,
    /// Present unless the request was new-account / key-bound revoke.
    account: Option<Stored<Account>>,
    /// The key the JWS verified with.
    jwk: Jwk,
}

/// Parses and verifies a POST body: nonce, url binding, signature, and
/// account resolution.
async fn verify_post(
    state: &AcmeState,
    provisioner: &str,
    expected_url: &str,
    body: &[u8],
    allow_jwk: bool,
) -> Result<VerifiedPost> {
    let issuer = state.issuer(provisioner)?;
    let (jws, header) = jws::parse(body)?;

    let nonce = header
        .nonce
        .as_deref()
        .ok_or_else(|| Error::new(ErrorKind::BadNonce, "protected header is missing nonce"))?;
    state.nonces.consume(nonce).await?;

    let (account, jwk) = match header.key_binding()? {
        KeyBinding::Jwk(jwk) => {
            if !allow_jwk {
                return Err(Error::malformed(
                    "this endpoint requires a kid-bound request",
                ));
            }
            (None, jwk.clone())
        }
        KeyBinding::Kid(kid) => {
            let prefix = state.account_url(provisioner, "");
            let account_id = kid.strip_prefix(&prefix).ok_or_else(|| {
                Error::new(ErrorKind::AccountDoesNotExist, format!("unknown kid {kid:?}"))
            })?;
            let stored = state.db.account(account_id).await?;
            if stored.value.status != AccountStatus::Valid {
                return Err(Error::unauthorized("account is not valid"));
            }
            let jwk = stored.value.jwk.clone();
            (Some(stored), jwk)
        }
    };

    let payload = jws::verify(&jws, &header, &jwk, expected_url)?;
    Ok(VerifiedPost {
        issuer,
        payload,
        account,
        jwk,
    })
}

fn require_account(post: &VerifiedPost) -> Result<&Stored<Account>> {
    post.account
        .as_ref()
        .ok_or_else(|| Error::unauthorized("request is not bound to an account"))
}

// ── rendering ──

fn render_order(state: &AcmeState, provisioner: &str, order: &Order) -> serde_json::Value {
    let mut body = serde_json::json!({
        "status": order.status,
        "expires": order.expires_at.to_rfc3339(),
        "identifiers": order.identifiers,
        "authorizations": order
            .authz_ids
            .iter()
            .map(|id| state.url(provisioner, &format!("authz/{id}")))
            .collect::<Vec<_>>(),
        "finalize": state.url(provisioner, &format!("order/{}/finalize", order.id)),
    });
    if let Some(nb) = order.not_before {
        body["notBefore"] = serde_json::json!(nb.to_rfc3339());
    }
    if let Some(na) = order.not_after {
        body["notAfter"] = serde_json::json!(na.to_rfc3339());
    }
    if let Some(serial) = &order.certificate_serial {
        body["certificate"] =
            serde_json::json!(state.url(provisioner, &format!("certificate/{serial}")));
    }
    if let Some(error) = &order.error {
        body["error"] = serde_json::json!({
            "type": "urn:ietf:params:acme:error:serverInternal",
            "detail": error,
        });
    }
    body
}

fn render_authz(
    state: &AcmeState,
    provisioner: &str,
    authz: &Authorization,
    challenges: &[Challenge],
) -> serde_json::Value {
    serde_json::json!({
        "status": authz.status,
        "expires": authz.expires_at.to_rfc3339(),
        "identifier": authz.identifier,
        "wildcard": authz.wildcard,
        "challenges": challenges
            .iter()
            .map(|c| render_challenge(state, provisioner, c))
            .collect::<Vec<_>>(),
    })
}

fn render_challenge(state: &AcmeState, provisioner: &str, challenge: &Challenge) -> serde_json::Value {
    let mut body = serde_json::json!({
        "type": challenge.kind,
        "url": state.url(provisioner, &format!("challenge/{}", challenge.id)),
        "status": challenge.status,
        "token": challenge.token,
    });
    if let Some(at) = challenge.validated_at {
        body["validated"] = serde_json::json!(at.to_rfc3339());
    }
    if let Some(error) = &challenge.error {
        body["error"] = serde_json::json!({
            "type": "urn:ietf:params:acme:error:incorrectResponse",
            "detail": error,
        });
    }
    body
}

fn render_account(state: &AcmeState, account: &Account) -> serde_json::Value {
    serde_json::json!({
        "status": account.status,
        "contact": account.contact,
        "orders": state.url(&account.provisioner, &format!("account/{}/orders", account.id)),
    })
}

// ── handlers ──

async fn directory(State(state): State<SharedState>, Path(prov): Path<String>) -> Response {
    let result = (|| -> Result<Response> {
        let issuer = state.issuer(&prov)?;
        let body = serde_json::json!({
            "newNonce": state.url(&prov, "new-nonce"),
            "newAccount": state.url(&prov, "new-account"),
            "newOrder": state.url(&prov, "new-order"),
            "revokeCert": state.url(&prov, "revoke-cert"),
            "keyChange": state.url(&prov, "key-change"),
            "meta": {
                "externalAccountRequired": issuer.require_eab(),
            },
        });
        Ok(json_response(StatusCode::OK, &body))
    })();
    respond(&state, &prov, result).await
}

async fn new_nonce(State(state): State<SharedState>, Path(prov): Path<String>) -> Response {
    let result = state.issuer(&prov).map(|_| {
        let mut response = StatusCode::NO_CONTENT.into_response();
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        );
        response
    });
    respond(&state, &prov, result).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewAccountPayload {
    #[serde(default)]
    contact: Vec<String>,
    #[serde(default)]
    only_return_existing: bool,
    #[serde(default)]
    external_account_binding: Option<EabJws>,
}

async fn new_account(
    State(state): State<SharedState>,
    Path(prov): Path<String>,
    body: Bytes,
) -> Response {
    let result = handle_new_account(&state, &prov, &body).await;
    respond(&state, &prov, result).await
}

async fn handle_new_account(state: &AcmeState, prov: &str, body: &[u8]) -> Result<Response> {
    let url = state.url(prov, "new-account");
    let post = verify_post(state, prov, &url, body, true).await?;
    let payload: NewAccountPayload = jws::json_payload(&post.payload)?;
    let key_id = post
        .jwk
        .thumbprint()
        .map_err(|e| Error::new(ErrorKind::BadPublicKey, e.to_string()))?;

    if payload.only_return_existing {
        let existing = state.db.account_by_key(prov, &key_id).await?.ok_or_else(|| {
            Error::new(ErrorKind::AccountDoesNotExist, "no account for this key")
        })?;
        let mut response =
            json_response(StatusCode::OK, &render_account(state, &existing.value));
        set_location(&mut response, &state.account_url(prov, &existing.value.id));
        return Ok(response);
    }

    // EAB, when the provisioner demands it
    let mut eab_binding: Option<(Stored<crate::eab::ExternalAccountKey>, EabJws)> = None;
    if post.issuer.require_eab() {
        let eab = payload.external_account_binding.clone().ok_or_else(|| {
            Error::new(
                ErrorKind::ExternalAccountRequired,
                "provisioner requires external account binding",
            )
        })?;
        let kid = eab_kid(&eab)?;
        let stored = state.db.eab_key(&kid).await?;
        if stored.value.provisioner != prov {
            return Err(Error::new(
                ErrorKind::ExternalAccountRequired,
                "external account key belongs to another provisioner",
            ));
        }
        if stored.value.bound_at.is_some() {
            return Err(Error::new(
                ErrorKind::ExternalAccountRequired,
                "external account key has already been used",
            ));
        }
        verify_eab(&eab, &stored.value.hmac_key, &post.jwk, &url)?;
        eab_binding = Some((stored, eab));
    }

    let account = Account {
        id: random_token(),
        key_id,
        jwk: post.jwk.clone(),
        status: AccountStatus::Valid,
        contact: payload.contact,
        provisioner: prov.to_string(),
        eab_key_id: eab_binding.as_ref().map(|(stored, _)| stored.value.id.clone()),
        created_at: Utc::now(),
    };
    let (account, created) = state.db.create_account(account).await?;

    if created {
        if let Some((stored_key, _)) = &eab_binding {
            state.db.bind_eab_key(stored_key, &account.id).await?;
        }
        tracing::info!(account = %account.id, provisioner = prov, "created ACME account");
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    let mut response = json_response(status, &render_account(state, &account));
    set_location(&mut response, &state.account_url(prov, &account.id));
    Ok(response)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountUpdatePayload {
    #[serde(default)]
    status: Option<AccountStatus>,
    #[serde(default)]
    contact: Option<Vec<String>>,
}

async fn update_account(
    State(state): State<SharedState>,
    Path((prov, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.account_url(&prov, &id);
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let stored = require_account(&post)?;
        if stored.value.id != id {
            return Err(Error::unauthorized("kid does not match the account URL"));
        }

        // POST-as-GET returns the current account
        if post.payload.is_empty() {
            return Ok(json_response(StatusCode::OK, &render_account(&state, &stored.value)));
        }

        let payload: AccountUpdatePayload = jws::json_payload(&post.payload)?;
        let mut updated = stored.value.clone();
        match payload.status {
            Some(AccountStatus::Deactivated) => updated.status = AccountStatus::Deactivated,
            Some(AccountStatus::Valid) | None => {}
            Some(AccountStatus::Revoked) => {
                return Err(Error::malformed("accounts cannot revoke themselves"))
            }
        }
        if let Some(contact) = payload.contact {
            updated.contact = contact;
        }
        let stored = state.db.update_account(stored, &updated).await?;
        Ok(json_response(StatusCode::OK, &render_account(&state, &stored.value)))
    }
    .await;
    respond(&state, &prov, result).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyChangeInner {
    account: String,
    old_key: Jwk,
}

async fn key_change(
    State(state): State<SharedState>,
    Path(prov): Path<String>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, "key-change");
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let stored = require_account(&post)?;

        // the payload is an inner JWS signed by the *new* key
        let (inner, inner_header) = jws::parse(&post.payload)?;
        let new_jwk = match inner_header.key_binding()? {
            KeyBinding::Jwk(jwk) => jwk.clone(),
            KeyBinding::Kid(_) => {
                return Err(Error::malformed("inner key-change JWS must carry jwk"))
            }
        };
        let inner_payload = jws::verify(&inner, &inner_header, &new_jwk, &url)?;
        let change: KeyChangeInner = jws::json_payload(&inner_payload)?;

        let account_url = state.account_url(&prov, &stored.value.id);
        if change.account != account_url {
            return Err(Error::malformed("inner account does not match the signer"));
        }
        let old_thumb = change
            .old_key
            .thumbprint()
            .map_err(|e| Error::new(ErrorKind::BadPublicKey, e.to_string()))?;
        if old_thumb != stored.value.key_id {
            return Err(Error::malformed("oldKey does not match the account key"));
        }

        let mut updated = stored.value.clone();
        updated.key_id = new_jwk
            .thumbprint()
            .map_err(|e| Error::new(ErrorKind::BadPublicKey, e.to_string()))?;
        updated.jwk = new_jwk;
        state.db.change_account_key(stored, &updated).await?;
        tracing::info!(account = %updated.id, "rotated ACME account key");
        Ok(json_response(StatusCode::OK, &render_account(&state, &updated)))
    }
    .await;
    respond(&state, &prov, result).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewOrderPayload {
    identifiers: Vec<Identifier>,
    #[serde(default)]
    not_before: Option<DateTime<Utc>>,
    #[serde(default)]
    not_after: Option<DateTime<Utc>>,
}

async fn new_order(
    State(state): State<SharedState>,
    Path(prov): Path<String>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, "new-order");
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let account = require_account(&post)?;
        let payload: NewOrderPayload = jws::json_payload(&post.payload)?;

        let order = state
            .orders
            .create_order(
                &post.issuer,
                &account.value.id,
                payload.identifiers,
                payload.not_before,
                payload.not_after,
            )
            .await?;

        let mut response =
            json_response(StatusCode::CREATED, &render_order(&state, &prov, &order));
        set_location(&mut response, &state.url(&prov, &format!("order/{}", order.id)));
        Ok(response)
    }
    .await;
    respond(&state, &prov, result).await
}

async fn get_order(
    State(state): State<SharedState>,
    Path((prov, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, &format!("order/{id}"));
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let account = require_account(&post)?;

        let stored = state.db.order(&id).await?;
        if stored.value.account_id != account.value.id {
            return Err(Error::unauthorized("order belongs to another account"));
        }
        let stored = state.orders.refresh_status(stored).await?;
        Ok(json_response(StatusCode::OK, &render_order(&state, &prov, &stored.value)))
    }
    .await;
    respond(&state, &prov, result).await
}

#[derive(Debug, Deserialize)]
struct FinalizePayload {
    /// base64url DER CSR.
    csr: String,
}

async fn finalize_order(
    State(state): State<SharedState>,
    Path((prov, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, &format!("order/{id}/finalize"));
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let account = require_account(&post)?;

        let stored = state.db.order(&id).await?;
        if stored.value.account_id != account.value.id {
            return Err(Error::unauthorized("order belongs to another account"));
        }

        let payload: FinalizePayload = jws::json_payload(&post.payload)?;
        let csr_der = URL_SAFE_NO_PAD
            .decode(payload.csr.as_bytes())
            .map_err(|e| Error::new(ErrorKind::BadCsr, format!("csr: {e}")))?;

        let stored = state
            .orders
            .finalize(&post.issuer, state.authority.as_ref(), &id, &csr_der)
            .await?;
        Ok(json_response(StatusCode::OK, &render_order(&state, &prov, &stored.value)))
    }
    .await;
    respond(&state, &prov, result).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthzUpdatePayload {
    #[serde(default)]
    status: Option<String>,
}

async fn get_authz(
    State(state): State<SharedState>,
    Path((prov, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, &format!("authz/{id}"));
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let account = require_account(&post)?;

        let stored = state.db.authz(&id).await?;
        if stored.value.account_id != account.value.id {
            return Err(Error::unauthorized("authorization belongs to another account"));
        }

        // deactivation request
        if !post.payload.is_empty() {
            let payload: AuthzUpdatePayload = jws::json_payload(&post.payload)?;
            if payload.status.as_deref() == Some("deactivated") {
                let stored = state.orders.deactivate_authz(&id).await?;
                let challenges = load_challenges(&state, &stored.value).await?;
                return Ok(json_response(
                    StatusCode::OK,
                    &render_authz(&state, &prov, &stored.value, &challenges),
                ));
            }
        }

        let challenges = load_challenges(&state, &stored.value).await?;
        Ok(json_response(
            StatusCode::OK,
            &render_authz(&state, &prov, &stored.value, &challenges),
        ))
    }
    .await;
    respond(&state, &prov, result).await
}

async fn load_challenges(state: &AcmeState, authz: &Authorization) -> Result<Vec<Challenge>> {
    let mut challenges = Vec::with_capacity(authz.challenge_ids.len());
    for id in &authz.challenge_ids {
        challenges.push(state.db.challenge(id).await?.value);
    }
    Ok(challenges)
}

async fn post_challenge(
    State(state): State<SharedState>,
    Path((prov, id)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, &format!("challenge/{id}"));
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let account = require_account(&post)?;

        let stored = state.db.challenge(&id).await?;
        if stored.value.account_id != account.value.id {
            return Err(Error::unauthorized("challenge belongs to another account"));
        }

        let payload: serde_json::Value = if post.payload.is_empty() {
            serde_json::json!({})
        } else {
            serde_json::from_slice(&post.payload)
                .map_err(|e| Error::malformed(format!("payload: {e}")))?
        };

        let stored = state
            .validator
            .trigger(&post.issuer, &id, &account.value.jwk, &payload)
            .await?;
        let mut response = json_response(
            StatusCode::OK,
            &render_challenge(&state, &prov, &stored.value),
        );
        // the challenge's authorization is "up"
        let up = format!(
            "<{}>;rel=\"up\"",
            state.url(&prov, &format!("authz/{}", stored.value.authz_id))
        );
        if let Ok(value) = HeaderValue::from_str(&up) {
            response.headers_mut().append(header::LINK, value);
        }
        Ok(response)
    }
    .await;
    respond(&state, &prov, result).await
}

async fn get_certificate(
    State(state): State<SharedState>,
    Path((prov, serial)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, &format!("certificate/{serial}"));
        let post = verify_post(&state, &prov, &url, &body, false).await?;
        let account = require_account(&post)?;

        let chain = state
            .authority
            .acme_certificate(&serial, &account.value.id)
            .await?
            .ok_or_else(|| Error::unauthorized("certificate is not available"))?;
        Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/pem-certificate-chain")],
            chain,
        )
            .into_response())
    }
    .await;
    respond(&state, &prov, result).await
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RevokePayload {
    /// base64url DER certificate.
    certificate: String,
    #[serde(default)]
    reason: Option<u8>,
}

async fn revoke_cert(
    State(state): State<SharedState>,
    Path(prov): Path<String>,
    body: Bytes,
) -> Response {
    let result = async {
        let url = state.url(&prov, "revoke-cert");
        // both account-key and certificate-key proofs are accepted
        let post = verify_post(&state, &prov, &url, &body, true).await?;
        let payload: RevokePayload = jws::json_payload(&post.payload)?;

        let reason = payload.reason.unwrap_or(0);
        if !reason_code_allowed(reason) {
            return Err(Error::new(
                ErrorKind::BadRevocationReason,
                format!("reason code {reason} is not allowed"),
            ));
        }

        let cert_der = URL_SAFE_NO_PAD
            .decode(payload.certificate.as_bytes())
            .map_err(|e| Error::malformed(format!("certificate: {e}")))?;
        let (_, cert) = x509_parser::parse_x509_certificate(&cert_der)
            .map_err(|e| Error::malformed(format!("certificate: {e}")))?;
        let serial = cert.raw_serial_as_string().replace(':', "");

        let owner = match &post.account {
            Some(account) => Some(account.value.id.clone()),
            None => {
                // proof of possession: the JWS must verify with the
                // certificate's own key
                let cert_jwk = cerion_provisioner::jose::jwk_from_spki(cert.public_key())?;
                let cert_thumb = cert_jwk
                    .thumbprint()
                    .map_err(|e| Error::malformed(e.to_string()))?;
                let signer_thumb = post
                    .jwk
                    .thumbprint()
                    .map_err(|e| Error::malformed(e.to_string()))?;
                if cert_thumb != signer_thumb {
                    return Err(Error::unauthorized(
                        "revocation is not signed by the certificate key",
                    ));
                }
                None
            }
        };

        state
            .authority
            .revoke_acme(&serial, reason, owner.as_deref())
            .await?;
        tracing::info!(serial = %serial, reason, "certificate revoked via ACME");
        Ok(StatusCode::OK.into_response())
    }
    .await;
    respond(&state, &prov, result).await
}

fn set_location(response: &mut Response, url: &str) {
    if let Ok(value) = HeaderValue::from_str(url) {
        response.headers_mut().insert(header::LOCATION, value);
    }
}

/// Extracts the `Replay-Nonce` from a response (test helper, but useful to
/// embedders that proxy responses).
pub fn replay_nonce(headers: &HeaderMap) -> Option<String> {
    headers
        .get("replay-nonce")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
