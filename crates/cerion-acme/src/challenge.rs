//! Challenge validation.
//!
//! Dispatches by challenge type and enforces the transition discipline:
//! pending → processing happens by CAS (so at most one validation runs per
//! challenge), terminal states are frozen, and a duplicate trigger while
//! `processing` returns the current state without restarting. A challenge
//! stuck in `processing` (abandoned by a cancelled request) is retried on
//! the next client poll, at most once per five seconds.

use crate::db::Stored;
use crate::order::OrderService;
use crate::types::{Authorization, Challenge, ChallengeStatus, ChallengeType, IdentifierType};
use crate::{AcmeIssuer, Error, ErrorKind, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use cerion_provisioner::jose::jwk_from_spki;
use cerion_provisioner::{ClientId, Jwk};
use chrono::{Duration, Utc};
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

/// Per-attempt probe timeout.
const PROBE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(6);

/// http-01 fetch attempts.
const HTTP_ATTEMPTS: usize = 3;

/// Redirects followed by the http-01 probe.
const HTTP_MAX_REDIRECTS: usize = 10;

/// Floor between validation attempts of one challenge.
const RETRY_FLOOR_SECS: i64 = 5;

/// The `id-pe-acmeIdentifier` extension (1.3.6.1.5.5.7.1.31).
const ACME_IDENTIFIER_OID: &str = "1.3.6.1.5.5.7.1.31";

/// RFC 8555 §8.1 key authorization: `token || "." || thumbprint(jwk)`.
pub fn key_authorization(token: &str, account_jwk: &Jwk) -> Result<String> {
    let thumbprint = account_jwk
        .thumbprint()
        .map_err(|e| Error::malformed(e.to_string()))?;
    Ok(format!("{token}.{thumbprint}"))
}

/// base64url(SHA-256(key authorization)), as served in dns-01 TXT records
/// and tls-alpn-01 certificates.
pub fn key_authorization_digest(key_auth: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(key_auth.as_bytes()))
}

/// Validates challenges against the outside world.
pub struct ChallengeValidator {
    orders: OrderService,
    http: reqwest::Client,
    resolver: TokioAsyncResolver,
    /// Probe ports, overridable for tests.
    http_port: u16,
    tls_port: u16,
}

impl ChallengeValidator {
    pub fn new(orders: OrderService) -> Self {
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(HTTP_MAX_REDIRECTS))
            .build()
            .unwrap_or_default();
        Self {
            orders,
            http,
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            http_port: 80,
            tls_port: 443,
        }
    }

    /// Overrides the probe ports (tests).
    pub fn with_ports(mut self, http_port: u16, tls_port: u16) -> Self {
        self.http_port = http_port;
        self.tls_port = tls_port;
        self
    }

    /// Handles a client POST to a challenge URL.
    ///
    /// Claims the challenge (pending → processing), runs the type-specific
    /// validation, then lands it in `valid` or `invalid` and propagates the
    /// result to the authorization.
    pub async fn trigger(
        &self,
        issuer: &AcmeIssuer,
        challenge_id: &str,
        account_jwk: &Jwk,
        payload: &serde_json::Value,
    ) -> Result<Stored<Challenge>> {
        let stored = self.orders.db().challenge(challenge_id).await?;
        if stored.value.status.is_terminal() {
            return Ok(stored);
        }
        if stored.value.status == ChallengeStatus::Processing {
            let recent = stored
                .value
                .last_attempt_at
                .map(|t| Utc::now() - t < Duration::seconds(RETRY_FLOOR_SECS))
                .unwrap_or(false);
            if recent {
                // someone is (or was just) validating; don't restart
                return Ok(stored);
            }
        }

        // claim the attempt
        let mut claimed = stored.value.clone();
        claimed.status = ChallengeStatus::Processing;
        claimed.last_attempt_at = Some(Utc::now());
        let stored = match self.orders.db().update_challenge(&stored, &claimed).await {
            Ok(stored) => stored,
            // lost to a concurrent trigger: report its state
            Err(_) => return self.orders.db().challenge(challenge_id).await,
        };

        let authz = self.orders.db().authz(&stored.value.authz_id).await?;
        let outcome = self
            .validate(issuer, &stored.value, &authz.value, account_jwk, payload)
            .await;

        let mut finished = stored.value.clone();
        match outcome {
            Ok(proof) => {
                finished.status = ChallengeStatus::Valid;
                finished.validated_at = Some(Utc::now());
                finished.validation_proof = proof;
                finished.error = None;
            }
            Err(e) => {
                // transient upstream errors leave the challenge retryable
                if e.kind == ErrorKind::ServerInternal {
                    return Err(e);
                }
                finished.status = ChallengeStatus::Invalid;
                finished.error = Some(e.to_string());
            }
        }
        let stored = self.orders.db().update_challenge(&stored, &finished).await?;
        self.orders.record_challenge_result(&stored.value).await?;
        tracing::info!(
            challenge = challenge_id,
            kind = stored.value.kind.as_str(),
            status = ?stored.value.status,
            "challenge validation finished"
        );
        Ok(stored)
    }

    async fn validate(
        &self,
        issuer: &AcmeIssuer,
        challenge: &Challenge,
        authz: &Authorization,
        account_jwk: &Jwk,
        payload: &serde_json::Value,
    ) -> Result<Option<String>> {
        let key_auth = key_authorization(&challenge.token, account_jwk)?;
        match challenge.kind {
            ChallengeType::Http01 => {
                self.validate_http01(&authz.identifier.value, &challenge.token, &key_auth)
                    .await
            }
            ChallengeType::Dns01 => {
                self.validate_dns01(&authz.identifier.value, &key_auth).await
            }
            ChallengeType::TlsAlpn01 => {
                self.validate_tls_alpn01(&authz.identifier.value, &key_auth)
                    .await
            }
            ChallengeType::DeviceAttest01 => {
                validate_device_attest(issuer, authz, &key_auth, payload)
            }
            ChallengeType::WireOidc01 => {
                let AcmeIssuer::Wire(wire) = issuer else {
                    return Err(Error::malformed("wire challenges need a wire provisioner"));
                };
                let id_token = payload
                    .get("idToken")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::malformed("payload is missing idToken"))?;
                let client_id = ClientId::parse(&authz.identifier.value)?;
                wire.verify_oidc_proof(id_token, &client_id).await?;
                Ok(None)
            }
            ChallengeType::WireDpop01 => {
                let AcmeIssuer::Wire(wire) = issuer else {
                    return Err(Error::malformed("wire challenges need a wire provisioner"));
                };
                let access_token = payload
                    .get("accessToken")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::malformed("payload is missing accessToken"))?;
                let client_id = ClientId::parse(&authz.identifier.value)?;
                wire.verify_dpop_proof(access_token, &client_id, &challenge.token)?;
                Ok(None)
            }
        }
    }

    /// http-01: fetch the key authorization from the well-known path.
    async fn validate_http01(
        &self,
        identifier: &str,
        token: &str,
        key_auth: &str,
    ) -> Result<Option<String>> {
        let url = format!(
            "http://{identifier}:{}/.well-known/acme-challenge/{token}",
            self.http_port
        );
        let mut last_error = String::new();
        for attempt in 1..=HTTP_ATTEMPTS {
            match self.http.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    let body = response
                        .text()
                        .await
                        .map_err(|e| Error::unauthorized(format!("reading {url}: {e}")))?;
                    if body.trim() == key_auth {
                        return Ok(Some(key_authorization_digest(key_auth)));
                    }
                    return Err(Error::unauthorized(format!(
                        "key authorization mismatch at {url}"
                    )));
                }
                Ok(response) => {
                    return Err(Error::unauthorized(format!(
                        "{url} returned {}",
                        response.status()
                    )));
                }
                Err(e) => {
                    last_error = e.to_string();
                    tracing::debug!(%url, attempt, error = %last_error, "http-01 probe failed");
                }
            }
        }
        Err(Error::unauthorized(format!(
            "could not reach {url}: {last_error}"
        )))
    }

    /// dns-01: TXT record under `_acme-challenge.` must hold the digest.
    async fn validate_dns01(&self, identifier: &str, key_auth: &str) -> Result<Option<String>> {
        let name = format!("_acme-challenge.{identifier}.");
        let expected = key_authorization_digest(key_auth);
        let records = self
            .resolver
            .txt_lookup(name.clone())
            .await
            .map_err(|e| Error::unauthorized(format!("TXT lookup {name}: {e}")))?;
        for record in records.iter() {
            let value = record
                .iter()
                .map(|part| String::from_utf8_lossy(part).into_owned())
                .collect::<String>();
            if value == expected {
                return Ok(Some(expected));
            }
        }
        Err(Error::unauthorized(format!(
            "no TXT record under {name} matches the key authorization"
        )))
    }

    /// tls-alpn-01: handshake with ALPN `acme-tls/1`; the self-signed
    /// certificate must carry the acmeIdentifier extension holding
    /// SHA-256(key authorization).
    async fn validate_tls_alpn01(&self, identifier: &str, key_auth: &str) -> Result<Option<String>> {
        use tokio_rustls::rustls::pki_types::ServerName;

        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(alpn::AcceptAnyCert::new()))
            .with_no_client_auth();
        let mut config = config;
        config.alpn_protocols = vec![b"acme-tls/1".to_vec()];

        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
        let addr = format!("{identifier}:{}", self.tls_port);
        let tcp = tokio::time::timeout(PROBE_TIMEOUT, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| Error::unauthorized(format!("timeout connecting to {addr}")))?
            .map_err(|e| Error::unauthorized(format!("connecting to {addr}: {e}")))?;

        let server_name = ServerName::try_from(identifier.to_string())
            .map_err(|e| Error::malformed(format!("identifier is not a valid SNI name: {e}")))?;
        let tls = tokio::time::timeout(PROBE_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .map_err(|_| Error::unauthorized(format!("timeout during handshake with {addr}")))?
            .map_err(|e| Error::unauthorized(format!("handshake with {addr}: {e}")))?;

        let (_, conn) = tls.get_ref();
        if conn.alpn_protocol() != Some(b"acme-tls/1") {
            return Err(Error::unauthorized(
                "server did not negotiate the acme-tls/1 protocol",
            ));
        }
        let certs = conn
            .peer_certificates()
            .ok_or_else(|| Error::unauthorized("server presented no certificate"))?;
        let leaf = certs
            .first()
            .ok_or_else(|| Error::unauthorized("server presented no certificate"))?;

        let (_, cert) = X509Certificate::from_der(leaf.as_ref())
            .map_err(|e| Error::unauthorized(format!("challenge certificate: {e}")))?;
        let digest = Sha256::digest(key_auth.as_bytes());
        // extension content is an OCTET STRING of the digest
        let mut expected = vec![0x04, digest.len() as u8];
        expected.extend_from_slice(&digest);

        let found = cert.extensions().iter().any(|ext| {
            ext.oid.to_id_string() == ACME_IDENTIFIER_OID && ext.value == expected.as_slice()
        });
        if !found {
            return Err(Error::unauthorized(
                "challenge certificate does not carry the expected acmeIdentifier",
            ));
        }
        Ok(Some(key_authorization_digest(key_auth)))
    }
}

mod alpn {
    //! Certificate "verification" for tls-alpn-01: the challenge
    //! certificate is self-signed by design, so every chain is accepted
    //! here and the acmeIdentifier extension is what actually decides.

    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::{DigitallySignedStruct, SignatureScheme};

    #[derive(Debug)]
    pub(super) struct AcceptAnyCert;

    impl AcceptAnyCert {
        pub(super) fn new() -> Self {
            Self
        }
    }

    impl ServerCertVerifier for AcceptAnyCert {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ECDSA_NISTP384_SHA384,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PSS_SHA256,
            ]
        }
    }
}

/// An attestation object as submitted to `device-attest-01`.
#[derive(Debug, Deserialize)]
struct AttestationPayload {
    /// base64url JSON attestation object.
    #[serde(rename = "attObj")]
    att_obj: String,
}

#[derive(Debug, Deserialize)]
struct AttestationObject {
    fmt: String,
    #[serde(rename = "attStmt")]
    att_stmt: AttestationStatement,
}

#[derive(Debug, Deserialize)]
struct AttestationStatement {
    alg: String,
    /// base64url signature over the key authorization.
    sig: String,
    /// base64 (standard) DER certificates, leaf first.
    x5c: Vec<String>,
}

/// Verifies a device attestation: format enabled, chain anchored to a
/// vendor root, signature over the key authorization by the attested key,
/// and the device serial matching the order's permanent identifier.
fn validate_device_attest(
    issuer: &AcmeIssuer,
    authz: &Authorization,
    key_auth: &str,
    payload: &serde_json::Value,
) -> Result<Option<String>> {
    let AcmeIssuer::Acme(provisioner) = issuer else {
        return Err(Error::malformed(
            "device-attest-01 needs an ACME provisioner",
        ));
    };
    if authz.identifier.kind != IdentifierType::PermanentIdentifier {
        return Err(Error::malformed(
            "device-attest-01 requires a permanent-identifier",
        ));
    }

    let payload: AttestationPayload = serde_json::from_value(payload.clone())
        .map_err(|e| Error::malformed(format!("attestation payload: {e}")))?;
    let att_raw = URL_SAFE_NO_PAD
        .decode(payload.att_obj.as_bytes())
        .map_err(|e| Error::malformed(format!("attObj: {e}")))?;
    let att: AttestationObject = serde_json::from_slice(&att_raw)
        .map_err(|e| Error::malformed(format!("attestation object: {e}")))?;

    if !provisioner.attestation_format_enabled(&att.fmt) {
        return Err(Error::unauthorized(format!(
            "attestation format {:?} is not enabled",
            att.fmt
        )));
    }
    let roots_pem = provisioner.attestation_roots().ok_or_else(|| {
        Error::unauthorized("no attestation roots are configured for this provisioner")
    })?;

    // decode and parse the chain, leaf first
    let chain_der: Vec<Vec<u8>> = att
        .att_stmt
        .x5c
        .iter()
        .map(|entry| {
            STANDARD
                .decode(entry.as_bytes())
                .map_err(|e| Error::malformed(format!("x5c entry: {e}")))
        })
        .collect::<Result<_>>()?;
    if chain_der.is_empty() {
        return Err(Error::malformed("attestation carries no certificates"));
    }
    let mut chain = Vec::with_capacity(chain_der.len());
    for der in &chain_der {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::malformed(format!("attestation certificate: {e}")))?;
        chain.push(cert);
    }
    for pair in chain.windows(2) {
        pair[0]
            .verify_signature(Some(pair[1].public_key()))
            .map_err(|_| Error::unauthorized("broken attestation chain"))?;
    }

    let roots = parse_pem_certs(roots_pem)?;
    let last = chain.last().expect("chain is non-empty");
    let anchored = roots.iter().any(|root_der| {
        X509Certificate::from_der(root_der)
            .map(|(_, root)| {
                root.subject() == last.issuer()
                    && last.verify_signature(Some(root.public_key())).is_ok()
            })
            .unwrap_or(false)
    });
    if !anchored {
        return Err(Error::unauthorized(
            "attestation chain does not terminate at a configured vendor root",
        ));
    }

    // the attested key signs the key authorization (the challenge token is
    // embedded in it, binding the statement to this challenge)
    let leaf = &chain[0];
    let jwk = jwk_from_spki(leaf.public_key()).map_err(Error::from)?;
    let alg: jsonwebtoken::Algorithm = att
        .att_stmt
        .alg
        .parse()
        .map_err(|_| Error::malformed(format!("unknown attestation alg {:?}", att.att_stmt.alg)))?;
    let allowed = jwk.allowed_algorithms().map_err(Error::from)?;
    if !allowed.contains(&alg) {
        return Err(Error::new(
            ErrorKind::BadSignatureAlgorithm,
            "attestation alg does not match the attested key",
        ));
    }
    let decoding_key = jwk.decoding_key().map_err(Error::from)?;
    let ok = jsonwebtoken::crypto::verify(
        &att.att_stmt.sig,
        key_auth.as_bytes(),
        &decoding_key,
        alg,
    )
    .map_err(|e| Error::malformed(format!("attestation signature: {e}")))?;
    if !ok {
        return Err(Error::unauthorized("attestation signature is invalid"));
    }

    // the device serial carried in the leaf must be the order's permanent
    // identifier
    let serial = leaf.raw_serial_as_string().replace(':', "");
    if serial != authz.identifier.value {
        return Err(Error::unauthorized(format!(
            "attested device serial {serial} does not match the order identifier"
        )));
    }
    Ok(Some(serial))
}

fn parse_pem_certs(pem: &str) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    let mut body = String::new();
    let mut inside = false;
    for line in pem.lines() {
        let line = line.trim();
        if line.starts_with("-----BEGIN CERTIFICATE-----") {
            inside = true;
            body.clear();
        } else if line.starts_with("-----END CERTIFICATE-----") {
            if inside {
                let der = STANDARD
                    .decode(body.as_bytes())
                    .map_err(|e| Error::malformed(format!("invalid PEM: {e}")))?;
                out.push(der);
            }
            inside = false;
        } else if inside {
            body.push_str(line);
        }
    }
    Ok(out)
}
