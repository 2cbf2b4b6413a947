//! The issuance pipeline.
//!
//! `sign` is the canonical path: identify the provisioner, validate the
//! proof, render the leaf template, apply claims and policy, allocate a
//! serial, sign through the KMS, persist, audit. `renew` and `revoke`
//! reuse the same building blocks, and the ACME/SCEP front ends plug in
//! through their traits at the bottom of this file.
//!
//! Serials are 128-bit random values; collisions are rejected by the
//! insert-if-missing CAS on the `certs` bucket and retried once.

use crate::crl::{bump_number, to_offset, CrlControl};
use crate::records::{CertificateRecord, RevocationRecord};
use crate::registry::{Loaded, Registry};
use crate::{pem_decode, pem_encode, Error, Result};
use async_trait::async_trait;
use cerion_cert::{Leaf, San, Subject, TemplateContext, TemplateEngine};
use cerion_db::{Bucket, Db};
use cerion_kms::{CreateKeyRequest, KeySigner, Kms, RemoteSigner, SignatureAlgorithm};
use cerion_provisioner::{
    AuthorizeContext, CertLookup, KeyType, LeafInfo, Provisioner, RevokeProof, SignOptions,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use x509_parser::certificate::X509Certificate;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

/// Issuance backdates `notBefore` by this much to absorb clock skew.
const BACKDATE: ChronoDuration = ChronoDuration::minutes(1);

/// How revocation was authorized.
pub enum RevocationAuth<'a> {
    /// A provisioner token naming the certificate.
    Token(&'a str),
    /// The requesting ACME account must own the certificate.
    AcmeAccount(&'a str),
    /// Possession of the certificate key, verified by the transport.
    CertificateKey,
}

/// Configuration for [`Authority::new`].
pub struct AuthorityConfig {
    pub db: Arc<dyn Db>,
    pub kms: Arc<dyn Kms>,
    /// KMS URI of the CA signing key.
    pub ca_key_uri: String,
    /// The CA certificate, PEM.
    pub ca_cert_pem: String,
    /// External base URL; the audience provisioner tokens must name.
    pub base_url: String,
}

/// A signed certificate as returned to clients.
#[derive(Debug, Clone)]
pub struct SignedChain {
    pub serial: String,
    pub leaf_pem: String,
    /// Leaf plus issuing certificate.
    pub chain_pem: String,
    pub leaf_der: Vec<u8>,
}

/// The certificate authority.
pub struct Authority {
    db: Arc<dyn Db>,
    #[allow(dead_code)]
    kms: Arc<dyn Kms>,
    signer: Arc<dyn KeySigner>,
    registry: Arc<Registry>,
    engine: TemplateEngine,
    ca_pem: String,
    ca_serial: String,
    audience: String,
    crl: CrlControl,
}

impl Authority {
    /// Builds an authority over an existing CA key and certificate.
    pub fn new(config: AuthorityConfig, registry: Arc<Registry>) -> Result<Arc<Self>> {
        let ca_der = pem_decode("CERTIFICATE", &config.ca_cert_pem)?;
        let (_, ca_cert) = X509Certificate::from_der(&ca_der)
            .map_err(|e| Error::BadRequest(format!("CA certificate: {e}")))?;
        let ca_serial = ca_cert.raw_serial_as_string().replace(':', "");
        let signer = config.kms.key_signer(&config.ca_key_uri)?;
        Ok(Arc::new(Self {
            db: config.db,
            kms: config.kms,
            signer,
            registry,
            engine: TemplateEngine::new(),
            ca_pem: pem_encode("CERTIFICATE", &ca_der),
            ca_serial,
            audience: config.base_url,
            crl: CrlControl::new(),
        }))
    }

    /// Creates a CA key in the KMS, self-signs a root certificate, and
    /// builds an authority around them. For development and tests; real
    /// deployments load an externally ceremonied certificate.
    pub async fn bootstrap(
        db: Arc<dyn Db>,
        kms: Arc<dyn Kms>,
        common_name: &str,
        base_url: &str,
        registry: Arc<Registry>,
    ) -> Result<Arc<Self>> {
        let handle = kms
            .create_key(&CreateKeyRequest {
                name: "cerion-ca".into(),
                algorithm: SignatureAlgorithm::EcdsaP256Sha256,
            })
            .await?;
        let signer = kms.key_signer(&handle.key_uri)?;
        let key_pair = RemoteSigner::new(signer.clone())
            .into_key_pair()
            .map_err(|e| Error::Internal(format!("CA key: {e}")))?;

        let mut params = rcgen::CertificateParams::new(vec![])
            .map_err(|e| Error::Internal(format!("CA params: {e}")))?;
        let mut dn = rcgen::DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, common_name);
        params.distinguished_name = dn;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Constrained(0));
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::CrlSign,
        ];
        let now = Utc::now();
        params.not_before = to_offset(now - BACKDATE)?;
        params.not_after = to_offset(now + ChronoDuration::days(3650))?;
        let mut serial = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial));

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::Internal(format!("CA self-sign: {e}")))?;

        Self::new(
            AuthorityConfig {
                db,
                kms,
                ca_key_uri: handle.key_uri,
                ca_cert_pem: cert.pem(),
                base_url: base_url.to_string(),
            },
            registry,
        )
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The CA certificate, PEM.
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    pub(crate) fn db(&self) -> &Arc<dyn Db> {
        &self.db
    }

    pub(crate) fn crl_control(&self) -> &CrlControl {
        &self.crl
    }

    /// The rcgen issuer: CA certificate plus the KMS-backed signing key.
    pub(crate) fn issuer(&self) -> Result<rcgen::Issuer<'static, RemoteSigner>> {
        let key_pair = RemoteSigner::new(self.signer.clone())
            .into_key_pair()
            .map_err(|e| Error::Internal(format!("CA key: {e}")))?;
        rcgen::Issuer::from_ca_cert_pem(&self.ca_pem, key_pair)
            .map_err(|e| Error::Internal(format!("CA certificate: {e}")))
    }

    fn authorize_context(&self) -> AuthorizeContext<'_> {
        AuthorizeContext {
            db: self.db.as_ref(),
            audience: &self.audience,
            certs: Some(self),
        }
    }

    /// Resolves the provisioner a token belongs to: an explicit hint wins,
    /// otherwise the unverified `iss` claim is matched against the
    /// registry (validation happens inside the provisioner).
    fn resolve_provisioner(&self, token: &str, hint: Option<&str>) -> Result<Loaded> {
        if let Some(name) = hint {
            return self
                .registry
                .get(name)
                .ok_or_else(|| Error::NotFound(format!("no provisioner named {name:?}")));
        }
        let issuer = unverified_issuer(token)
            .ok_or_else(|| Error::BadRequest("cannot identify the provisioner from the token".into()))?;
        self.registry
            .get(&issuer)
            .ok_or_else(|| Error::NotFound(format!("no provisioner named {issuer:?}")))
    }

    // ── sign ──

    /// Signs a CSR authorized by a provisioner token.
    pub async fn sign(
        &self,
        csr_pem: &str,
        token: &str,
        provisioner_hint: Option<&str>,
        requested_lifetime: Option<Duration>,
    ) -> Result<SignedChain> {
        let loaded = self.resolve_provisioner(token, provisioner_hint)?;
        let provisioner = loaded.provisioner();
        let options = provisioner
            .authorize_sign(&self.authorize_context(), token)
            .await?;

        let csr_der = pem_decode("CERTIFICATE REQUEST", csr_pem)?;
        self.sign_with_options(
            &csr_der,
            &options,
            provisioner.id(),
            None,
            None,
            requested_lifetime,
        )
        .await
    }

    /// The shared back half of every issuance path.
    ///
    /// `sans_override` replaces CSR-derived SANs (the ACME order's
    /// identifiers are authoritative there); `account_id` tags the record.
    async fn sign_with_options(
        &self,
        csr_der: &[u8],
        options: &SignOptions,
        provisioner_id: &str,
        account_id: Option<&str>,
        sans_override: Option<Vec<San>>,
        requested_lifetime: Option<Duration>,
    ) -> Result<SignedChain> {
        let info = inspect_csr(csr_der)?;

        if !options.claims.key_type_allowed(info.key_type) {
            return Err(Error::Forbidden(format!(
                "key type {} is not allowed by this provisioner",
                info.key_type
            )));
        }

        let sans = match sans_override {
            Some(sans) => sans,
            None => self.constrain_sans(&info, options)?,
        };
        if let Some(expected) = &options.subject {
            if !info.common_name.is_empty() && info.common_name != *expected {
                return Err(Error::Forbidden(format!(
                    "subject {:?} does not match the authorized subject {:?}",
                    info.common_name, expected
                )));
            }
        }

        let common_name = if info.common_name.is_empty() {
            options.subject.clone().unwrap_or_default()
        } else {
            info.common_name.clone()
        };
        let context = TemplateContext::new(
            Subject {
                common_name,
                ..Default::default()
            },
            sans,
        )
        .with_token(options.token_claims.clone())
        .with_data(options.template_data.clone())
        .with_csr(serde_json::json!({
            "publicKeyAlgorithm": info.key_type.to_string(),
        }));

        let leaf = self
            .engine
            .render_leaf(options.template.as_deref(), &context)?;

        // deny first, then allow; the first offending identifier surfaces
        options.policy.check_sans(&leaf.sans)?;

        // clamp the validity window into the provisioner claims
        let template_window = match (leaf.not_before, leaf.not_after) {
            (Some(nb), Some(na)) if na > nb => Some((na - nb).to_std().unwrap_or_default()),
            _ => None,
        };
        let lifetime = options
            .claims
            .clamp_lifetime(requested_lifetime.or(template_window));
        let not_before = Utc::now() - BACKDATE;
        let not_after = not_before
            + ChronoDuration::from_std(lifetime)
                .map_err(|e| Error::BadRequest(format!("lifetime: {e}")))?
            + BACKDATE;

        // parse through rcgen for the subject public key
        let csr_params =
            rcgen::CertificateSigningRequestParams::from_pem(&pem_encode("CERTIFICATE REQUEST", csr_der))
                .map_err(|e| Error::BadRequest(format!("CSR: {e}")))?;

        // serial collision is astronomically rare; one retry
        let mut last_err: Option<Error> = None;
        for _ in 0..2 {
            let serial_bytes = new_serial();
            let serial = hex::encode(serial_bytes);

            let mut params = leaf.to_params().map_err(Error::from)?;
            params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial_bytes));
            params.not_before = to_offset(not_before)?;
            params.not_after = to_offset(not_after)?;
            params.use_authority_key_identifier_extension = true;

            let issuer = self.issuer()?;
            let cert = params
                .signed_by(&csr_params.public_key, &issuer)
                .map_err(|e| Error::Internal(format!("certificate signing: {e}")))?;
            let leaf_der = cert.der().to_vec();
            let leaf_pem = pem_encode("CERTIFICATE", &leaf_der);

            let record = CertificateRecord {
                serial: serial.clone(),
                pem: leaf_pem.clone(),
                issuer_serial: self.ca_serial.clone(),
                issued_at: Utc::now(),
                not_before,
                not_after,
                provisioner_id: provisioner_id.to_string(),
                account_id: account_id.map(str::to_string),
                sans: leaf.sans.clone(),
            };
            let raw = cerion_db::encode(Bucket::Certs, &record)?;
            match self
                .db
                .cmp_and_swap(Bucket::Certs, serial.as_bytes(), None, Some(raw))
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        target: "cerion::audit",
                        serial = %serial,
                        provisioner = provisioner_id,
                        account = account_id.unwrap_or(""),
                        sans = ?leaf.sans.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
                        "issued certificate"
                    );
                    return Ok(SignedChain {
                        serial,
                        chain_pem: format!("{leaf_pem}{}", self.ca_pem),
                        leaf_pem,
                        leaf_der,
                    });
                }
                Err(e) if e.is_conflict() => {
                    tracing::warn!(serial = %serial, "serial collision, retrying");
                    last_err = Some(Error::Conflict("serial collision".into()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("serial allocation failed".into())))
    }

    /// Applies the provisioner's SAN constraints to the CSR's request.
    fn constrain_sans(&self, info: &CsrInfo, options: &SignOptions) -> Result<Vec<San>> {
        match &options.sans {
            None => Ok(info.sans.clone()),
            Some(allowed) => {
                if info.sans.is_empty() {
                    return Ok(allowed.clone());
                }
                let allowed_set: BTreeSet<String> =
                    allowed.iter().map(|s| s.to_string()).collect();
                for san in &info.sans {
                    if !allowed_set.contains(&san.to_string()) {
                        return Err(Error::Forbidden(format!(
                            "{} is not among the authorized names",
                            san
                        )));
                    }
                }
                Ok(info.sans.clone())
            }
        }
    }

    // ── renew ──

    /// Re-issues a still-valid certificate with a fresh serial and window.
    /// Subject and SANs are preserved.
    pub async fn renew(&self, cert_pem: &str) -> Result<SignedChain> {
        let cert_der = pem_decode("CERTIFICATE", cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| Error::BadRequest(format!("certificate: {e}")))?;
        let serial = cert.raw_serial_as_string().replace(':', "");

        let record = self.cert_record(&serial).await?.ok_or_else(|| {
            Error::NotFound(format!("certificate {serial} was not issued by this CA"))
        })?;
        if self.revocation(&serial).await?.is_some() {
            return Err(Error::Forbidden(format!("certificate {serial} is revoked")));
        }

        let loaded = self
            .registry
            .get_by_id(&record.provisioner_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "provisioner {} no longer exists",
                    record.provisioner_id
                ))
            })?;
        let provisioner = loaded.provisioner();
        provisioner
            .authorize_renew(
                &self.authorize_context(),
                &LeafInfo {
                    serial: serial.clone(),
                    not_before: record.not_before,
                    not_after: record.not_after,
                    sans: record.sans.clone(),
                    provisioner_id: record.provisioner_id.clone(),
                },
            )
            .await?;

        // preserve subject and SANs; re-clamp the original window
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let leaf = Leaf {
            subject: Subject {
                common_name: cn,
                ..Default::default()
            },
            sans: record.sans.clone(),
            key_usage: vec![cerion_cert::KeyUsage::DigitalSignature],
            ext_key_usage: vec![
                cerion_cert::ExtKeyUsage::ServerAuth,
                cerion_cert::ExtKeyUsage::ClientAuth,
            ],
            ..Default::default()
        };

        let original_window = (record.not_after - record.not_before)
            .to_std()
            .unwrap_or_default();
        let lifetime = provisioner.claims().clamp_lifetime(Some(original_window));
        let not_before = Utc::now() - BACKDATE;
        let not_after = not_before
            + ChronoDuration::from_std(lifetime)
                .map_err(|e| Error::Internal(format!("lifetime: {e}")))?
            + BACKDATE;

        let subject_key = SubjectKey::from_cert(&cert)?;
        let mut last_err: Option<Error> = None;
        for _ in 0..2 {
            let serial_bytes = new_serial();
            let new_serial_hex = hex::encode(serial_bytes);

            let mut params = leaf.to_params().map_err(Error::from)?;
            params.serial_number = Some(rcgen::SerialNumber::from_slice(&serial_bytes));
            params.not_before = to_offset(not_before)?;
            params.not_after = to_offset(not_after)?;
            params.use_authority_key_identifier_extension = true;

            let issuer = self.issuer()?;
            let new_cert = params
                .signed_by(&subject_key, &issuer)
                .map_err(|e| Error::Internal(format!("certificate signing: {e}")))?;
            let leaf_der = new_cert.der().to_vec();
            let leaf_pem = pem_encode("CERTIFICATE", &leaf_der);

            let new_record = CertificateRecord {
                serial: new_serial_hex.clone(),
                pem: leaf_pem.clone(),
                issuer_serial: self.ca_serial.clone(),
                issued_at: Utc::now(),
                not_before,
                not_after,
                provisioner_id: record.provisioner_id.clone(),
                account_id: record.account_id.clone(),
                sans: record.sans.clone(),
            };
            let raw = cerion_db::encode(Bucket::Certs, &new_record)?;
            match self
                .db
                .cmp_and_swap(Bucket::Certs, new_serial_hex.as_bytes(), None, Some(raw))
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        target: "cerion::audit",
                        serial = %new_serial_hex,
                        renewed_from = %serial,
                        provisioner = %record.provisioner_id,
                        "renewed certificate"
                    );
                    return Ok(SignedChain {
                        serial: new_serial_hex,
                        chain_pem: format!("{leaf_pem}{}", self.ca_pem),
                        leaf_pem,
                        leaf_der,
                    });
                }
                Err(e) if e.is_conflict() => {
                    last_err = Some(Error::Conflict("serial collision".into()));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_err.unwrap_or_else(|| Error::Internal("serial allocation failed".into())))
    }

    // ── revoke ──

    /// Revokes an issued certificate. The revocation record is inserted
    /// against absence, so a second attempt conflicts.
    pub async fn revoke(
        &self,
        serial: &str,
        reason_code: u8,
        auth: RevocationAuth<'_>,
    ) -> Result<()> {
        if !cerion_acme::types::reason_code_allowed(reason_code) {
            return Err(Error::BadRequest(format!(
                "reason code {reason_code} is not allowed"
            )));
        }
        let record = self
            .cert_record(serial)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no certificate {serial}")))?;

        match auth {
            RevocationAuth::Token(token) => {
                let loaded = self
                    .registry
                    .get_by_id(&record.provisioner_id)
                    .ok_or_else(|| {
                        Error::NotFound(format!(
                            "provisioner {} no longer exists",
                            record.provisioner_id
                        ))
                    })?;
                loaded
                    .provisioner()
                    .authorize_revoke(&self.authorize_context(), &RevokeProof::Token(token))
                    .await?;
            }
            RevocationAuth::AcmeAccount(account) => {
                if record.account_id.as_deref() != Some(account) {
                    return Err(Error::Forbidden(
                        "certificate belongs to another account".into(),
                    ));
                }
            }
            RevocationAuth::CertificateKey => {}
        }

        let crl_number = bump_number(self.db.as_ref()).await?;
        let revocation = RevocationRecord {
            serial: serial.to_string(),
            reason_code,
            revoked_at: Utc::now(),
            crl_number,
        };
        let raw = cerion_db::encode(Bucket::RevokedCerts, &revocation)?;
        self.db
            .cmp_and_swap(Bucket::RevokedCerts, serial.as_bytes(), None, Some(raw))
            .await
            .map_err(|e| {
                if e.is_conflict() {
                    Error::Conflict(format!("certificate {serial} is already revoked"))
                } else {
                    Error::from(e)
                }
            })?;
        self.crl.mark_dirty();
        tracing::info!(
            target: "cerion::audit",
            serial = %serial,
            reason = reason_code,
            "revoked certificate"
        );
        Ok(())
    }

    // ── lookups ──

    pub async fn cert_record(&self, serial: &str) -> Result<Option<CertificateRecord>> {
        match self.db.get(Bucket::Certs, serial.as_bytes()).await {
            Ok(raw) => Ok(Some(cerion_db::decode(Bucket::Certs, &raw)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn revocation(&self, serial: &str) -> Result<Option<RevocationRecord>> {
        match self.db.get(Bucket::RevokedCerts, serial.as_bytes()).await {
            Ok(raw) => Ok(Some(cerion_db::decode(Bucket::RevokedCerts, &raw)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Extracted CSR facts.
struct CsrInfo {
    common_name: String,
    sans: Vec<San>,
    key_type: KeyType,
}

/// Parses a CSR, verifies its self-signature, and extracts subject, SANs,
/// and the key type.
fn inspect_csr(csr_der: &[u8]) -> Result<CsrInfo> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| Error::BadRequest(format!("CSR: {e}")))?;
    csr.verify_signature()
        .map_err(|e| Error::Unauthorized(format!("CSR signature: {e}")))?;

    let info = &csr.certification_request_info;
    let common_name = info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or("")
        .to_string();

    let mut sans = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(list) = ext {
                for name in &list.general_names {
                    match name {
                        GeneralName::DNSName(dns) => sans.push(San::Dns(dns.to_string())),
                        GeneralName::RFC822Name(email) => sans.push(San::Email(email.to_string())),
                        GeneralName::URI(uri) => sans.push(San::Uri(uri.to_string())),
                        GeneralName::IPAddress(raw) => {
                            let addr = match raw.len() {
                                4 => std::net::IpAddr::from(
                                    <[u8; 4]>::try_from(*raw).expect("length checked"),
                                ),
                                16 => std::net::IpAddr::from(
                                    <[u8; 16]>::try_from(*raw).expect("length checked"),
                                ),
                                _ => {
                                    return Err(Error::BadRequest(
                                        "CSR carries a malformed IP SAN".into(),
                                    ))
                                }
                            };
                            sans.push(San::Ip(addr));
                        }
                        _ => {
                            return Err(Error::BadRequest(
                                "CSR carries an unsupported SAN type".into(),
                            ))
                        }
                    }
                }
            }
        }
    }

    let key_type = key_type_of(&info.subject_pki)?;
    Ok(CsrInfo {
        common_name,
        sans,
        key_type,
    })
}

fn key_type_of(spki: &x509_parser::x509::SubjectPublicKeyInfo<'_>) -> Result<KeyType> {
    use x509_parser::public_key::PublicKey;
    match spki.parsed() {
        Ok(PublicKey::EC(ec)) => match ec.data().len() {
            65 => Ok(KeyType::EcdsaP256),
            97 => Ok(KeyType::EcdsaP384),
            n => Err(Error::BadRequest(format!("unsupported EC point length {n}"))),
        },
        Ok(PublicKey::RSA(rsa)) => {
            let bits = rsa.modulus.iter().skip_while(|&&b| b == 0).count() * 8;
            match bits {
                b if b < 2048 => Err(Error::BadRequest(format!(
                    "RSA keys below 2048 bits are not accepted ({b} bits)"
                ))),
                2048 => Ok(KeyType::Rsa2048),
                b if b <= 3072 => Ok(KeyType::Rsa3072),
                _ => Ok(KeyType::Rsa4096),
            }
        }
        _ => {
            if spki.algorithm.algorithm == x509_parser::oid_registry::OID_SIG_ED25519 {
                Ok(KeyType::Ed25519)
            } else {
                Err(Error::BadRequest(format!(
                    "unsupported public key algorithm {}",
                    spki.algorithm.algorithm
                )))
            }
        }
    }
}

/// The public key of an existing certificate, for renewals.
struct SubjectKey {
    spki_bits: Vec<u8>,
    algorithm: &'static rcgen::SignatureAlgorithm,
}

impl SubjectKey {
    fn from_cert(cert: &X509Certificate<'_>) -> Result<Self> {
        let spki = cert.public_key();
        let algorithm = match key_type_of(spki)? {
            KeyType::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            KeyType::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            KeyType::Ed25519 => &rcgen::PKCS_ED25519,
            KeyType::Rsa2048 | KeyType::Rsa3072 | KeyType::Rsa4096 => &rcgen::PKCS_RSA_SHA256,
        };
        Ok(Self {
            spki_bits: spki.subject_public_key.data.to_vec(),
            algorithm,
        })
    }
}

impl rcgen::PublicKeyData for SubjectKey {
    fn der_bytes(&self) -> &[u8] {
        &self.spki_bits
    }

    fn algorithm(&self) -> &'static rcgen::SignatureAlgorithm {
        self.algorithm
    }
}

/// Allocates a random, positive 128-bit serial.
fn new_serial() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[0] &= 0x7f;
    bytes
}

/// Reads the `iss` claim without verification, for provisioner routing.
fn unverified_issuer(token: &str) -> Option<String> {
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use base64::Engine;
    let payload = token.split('.').nth(1)?;
    let raw = URL_SAFE_NO_PAD.decode(payload.as_bytes()).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&raw).ok()?;
    claims
        .get("iss")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

// ── front-end seams ──

#[async_trait]
impl CertLookup for Authority {
    async fn cert_der_by_serial(
        &self,
        serial: &str,
    ) -> cerion_provisioner::Result<Option<Vec<u8>>> {
        let lookup = async {
            if self.revocation(serial).await?.is_some() {
                return Ok::<_, Error>(None);
            }
            match self.cert_record(serial).await? {
                Some(record) => Ok(Some(pem_decode("CERTIFICATE", &record.pem)?)),
                None => Ok(None),
            }
        };
        lookup
            .await
            .map_err(|e| cerion_provisioner::Error::Transient(e.to_string()))
    }
}

#[async_trait]
impl cerion_acme::CertificateAuthority for Authority {
    async fn sign_acme(
        &self,
        provisioner_name: &str,
        account_id: &str,
        csr_der: &[u8],
        sans: &[San],
    ) -> cerion_acme::Result<cerion_acme::IssuedCertificate> {
        let result = async {
            let loaded = self.registry.get(provisioner_name).ok_or_else(|| {
                Error::NotFound(format!("no provisioner named {provisioner_name:?}"))
            })?;
            let provisioner = loaded.provisioner();
            let options = provisioner
                .authorize_sign(&self.authorize_context(), account_id)
                .await?;
            self.sign_with_options(
                csr_der,
                &options,
                provisioner.id(),
                Some(account_id),
                Some(sans.to_vec()),
                None,
            )
            .await
        };
        result.await.map(|chain| cerion_acme::IssuedCertificate {
            serial: chain.serial,
            chain_pem: chain.chain_pem,
            leaf_der: chain.leaf_der,
        })
        .map_err(acme_error)
    }

    async fn revoke_acme(
        &self,
        serial: &str,
        reason_code: u8,
        owner_account: Option<&str>,
    ) -> cerion_acme::Result<()> {
        let auth = match owner_account {
            Some(account) => RevocationAuth::AcmeAccount(account),
            None => RevocationAuth::CertificateKey,
        };
        self.revoke(serial, reason_code, auth).await.map_err(acme_error)
    }

    async fn acme_certificate(
        &self,
        serial: &str,
        account_id: &str,
    ) -> cerion_acme::Result<Option<String>> {
        let result = async {
            if self.revocation(serial).await?.is_some() {
                return Ok::<_, Error>(None);
            }
            match self.cert_record(serial).await? {
                Some(record) if record.account_id.as_deref() == Some(account_id) => {
                    Ok(Some(format!("{}{}", record.pem, self.ca_pem)))
                }
                _ => Ok(None),
            }
        };
        result.await.map_err(acme_error)
    }
}

fn acme_error(e: Error) -> cerion_acme::Error {
    use cerion_acme::ErrorKind as K;
    let kind = match &e {
        Error::BadRequest(_) => K::Malformed,
        Error::Unauthorized(_) | Error::NotFound(_) => K::Unauthorized,
        Error::Forbidden(_) => K::RejectedIdentifier,
        Error::Conflict(_) => K::AlreadyRevoked,
        Error::Transient(_) | Error::Internal(_) => K::ServerInternal,
    };
    cerion_acme::Error::new(kind, e.to_string())
}

#[async_trait]
impl cerion_scep::ScepAuthority for Authority {
    async fn sign_scep(
        &self,
        provisioner_name: &str,
        csr_der: &[u8],
    ) -> std::result::Result<cerion_scep::ScepIssued, String> {
        let loaded = self
            .registry
            .get(provisioner_name)
            .ok_or_else(|| format!("no provisioner named {provisioner_name:?}"))?;
        let scep = loaded
            .scep()
            .ok_or_else(|| format!("{provisioner_name:?} is not a SCEP provisioner"))?;
        let options = scep.sign_options();
        let provisioner_id = scep.id().to_string();
        let chain = self
            .sign_with_options(csr_der, &options, &provisioner_id, None, None, None)
            .await
            .map_err(|e| e.to_string())?;
        Ok(cerion_scep::ScepIssued {
            serial: chain.serial,
            leaf_der: chain.leaf_der,
        })
    }
}
