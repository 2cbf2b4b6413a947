//! Pipeline integration: token-authorized issuance, claims clamping,
//! policy enforcement, renewal, revocation, and the CRL, all against the
//! software KMS and the in-memory store.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use cerion_acme::CertificateAuthority as _;
use cerion_authority::authority::RevocationAuth;
use cerion_authority::{Authority, Registry};
use cerion_cert::PolicyRules;
use cerion_db::MemoryDb;
use cerion_kms::SoftKms;
use cerion_provisioner::{Claims, Jwk, KeyType, Kind, Options, ProvisionerRecord};
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, KeyPair};
use std::sync::Arc;
use std::time::Duration;
use x509_parser::prelude::FromDer;

const BASE_URL: &str = "https://ca.example.com";

// ── helpers ──

struct TokenKey {
    kp: EcdsaKeyPair,
    rng: SystemRandom,
    jwk: Jwk,
}

impl TokenKey {
    fn generate() -> Self {
        let rng = SystemRandom::new();
        let pkcs8 =
            EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_FIXED_SIGNING, &rng)
                .unwrap();
        let kp = EcdsaKeyPair::from_pkcs8(
            &signature::ECDSA_P256_SHA256_FIXED_SIGNING,
            pkcs8.as_ref(),
            &rng,
        )
        .unwrap();
        let point = kp.public_key().as_ref().to_vec();
        let mut jwk = Jwk::ec_p256(
            URL_SAFE_NO_PAD.encode(&point[1..33]),
            URL_SAFE_NO_PAD.encode(&point[33..65]),
        );
        jwk.kid = Some("ops-key".into());
        Self { kp, rng, jwk }
    }

    fn token(&self, provisioner: &str, sub: &str, sans: &[&str]) -> String {
        let now = chrono::Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": provisioner,
            "aud": BASE_URL,
            "sub": sub,
            "iat": now,
            "nbf": now,
            "exp": now + 300,
            "jti": uuid::Uuid::new_v4().to_string(),
            "sans": sans,
        });
        let header = serde_json::json!({"alg": "ES256", "kid": "ops-key"});
        let message = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(header.to_string().as_bytes()),
            URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes()),
        );
        let sig = self.kp.sign(&self.rng, message.as_bytes()).unwrap();
        format!("{message}.{}", URL_SAFE_NO_PAD.encode(sig.as_ref()))
    }
}

fn jwk_record(name: &str, key: &TokenKey, claims: Claims, options: Options) -> ProvisionerRecord {
    ProvisionerRecord {
        id: format!("jwk/{name}"),
        name: name.into(),
        kind: Kind::Jwk,
        config_version: 0,
        claims,
        options,
        config: serde_json::json!({"keys": [key.jwk]}),
    }
}

async fn build_authority(records: Vec<ProvisionerRecord>) -> Arc<Authority> {
    let registry = Arc::new(Registry::from_records(&records).unwrap());
    Authority::bootstrap(
        Arc::new(MemoryDb::new()),
        Arc::new(SoftKms::new()),
        "Cerion Test CA",
        BASE_URL,
        registry,
    )
    .await
    .unwrap()
}

fn csr_pem(names: &[&str]) -> String {
    let kp = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap();
    let mut params =
        rcgen::CertificateParams::new(names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
            .unwrap();
    if let Some(first) = names.first() {
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, first.to_string());
    }
    params.serialize_request(&kp).unwrap().pem().unwrap()
}

fn parse_leaf(chain_pem: &str) -> Vec<u8> {
    // first PEM block is the leaf
    let body: String = chain_pem
        .lines()
        .skip(1)
        .take_while(|l| !l.starts_with("-----END"))
        .collect();
    base64::engine::general_purpose::STANDARD
        .decode(body.as_bytes())
        .unwrap()
}

// ── scenarios ──

#[tokio::test]
async fn token_sign_happy_path() {
    let key = TokenKey::generate();
    let authority = build_authority(vec![jwk_record(
        "ops",
        &key,
        Claims::default(),
        Options::default(),
    )])
    .await;

    let token = key.token("ops", "svc.example.com", &["svc.example.com", "10.0.0.9"]);
    let chain = authority
        .sign(&csr_pem(&["svc.example.com"]), &token, None, None)
        .await
        .unwrap();

    // the leaf verifies against the CA
    let leaf_der = parse_leaf(&chain.chain_pem);
    let (_, leaf) = x509_parser::parse_x509_certificate(&leaf_der).unwrap();
    let ca_pem = authority.ca_pem();
    let ca_der = {
        let body: String = ca_pem
            .lines()
            .skip(1)
            .take_while(|l| !l.starts_with("-----END"))
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(body.as_bytes())
            .unwrap()
    };
    let (_, ca) = x509_parser::parse_x509_certificate(&ca_der).unwrap();
    leaf.verify_signature(Some(ca.public_key())).unwrap();
    assert_eq!(leaf.issuer(), ca.subject());

    // SANs carried through
    let sans: Vec<String> = leaf
        .subject_alternative_name()
        .unwrap()
        .unwrap()
        .value
        .general_names
        .iter()
        .map(|n| format!("{n}"))
        .collect();
    assert!(sans.iter().any(|s| s.contains("svc.example.com")));

    // the record landed under the serial
    let record = authority.cert_record(&chain.serial).await.unwrap().unwrap();
    assert_eq!(record.provisioner_id, "jwk/ops");

    // the token is single-use
    assert!(authority
        .sign(&csr_pem(&["svc.example.com"]), &token, None, None)
        .await
        .is_err());
}

#[tokio::test]
async fn csr_outside_token_sans_is_forbidden() {
    let key = TokenKey::generate();
    let authority = build_authority(vec![jwk_record(
        "ops",
        &key,
        Claims::default(),
        Options::default(),
    )])
    .await;

    let token = key.token("ops", "svc.example.com", &["svc.example.com"]);
    let err = authority
        .sign(&csr_pem(&["other.example.com"]), &token, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, cerion_authority::Error::Forbidden(_)), "{err}");
}

#[tokio::test]
async fn policy_deny_cites_the_identifier() {
    let key = TokenKey::generate();
    let options = Options {
        deny: PolicyRules {
            dns: vec!["*.corp.test".into()],
            ..Default::default()
        },
        ..Default::default()
    };
    let authority =
        build_authority(vec![jwk_record("ops", &key, Claims::default(), options)]).await;

    let token = key.token("ops", "admin.corp.test", &["admin.corp.test"]);
    let err = authority
        .sign(&csr_pem(&["admin.corp.test"]), &token, None, None)
        .await
        .unwrap_err();
    match err {
        cerion_authority::Error::Forbidden(detail) => {
            assert!(detail.contains("admin.corp.test"), "{detail}")
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn lifetimes_are_clamped_to_claims() {
    let key = TokenKey::generate();
    let claims = Claims {
        min_cert_lifetime: Duration::from_secs(600),
        default_cert_lifetime: Duration::from_secs(3600),
        max_cert_lifetime: Duration::from_secs(3600),
        ..Default::default()
    };
    let authority = build_authority(vec![jwk_record("ops", &key, claims, Options::default())]).await;

    let token = key.token("ops", "svc.example.com", &["svc.example.com"]);
    let chain = authority
        .sign(
            &csr_pem(&["svc.example.com"]),
            &token,
            None,
            Some(Duration::from_secs(86400)),
        )
        .await
        .unwrap();

    let record = authority.cert_record(&chain.serial).await.unwrap().unwrap();
    let window = (record.not_after - record.not_before).num_seconds();
    // one hour plus the clock-skew backdate
    assert!((3600..=3700).contains(&window), "window was {window}s");
}

#[tokio::test]
async fn key_type_restrictions_apply() {
    let key = TokenKey::generate();
    let claims = Claims {
        enabled_key_types: vec![KeyType::Ed25519],
        ..Default::default()
    };
    let authority = build_authority(vec![jwk_record("ops", &key, claims, Options::default())]).await;

    let token = key.token("ops", "svc.example.com", &["svc.example.com"]);
    // the CSR carries a P-256 key
    let err = authority
        .sign(&csr_pem(&["svc.example.com"]), &token, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, cerion_authority::Error::Forbidden(_)));
}

#[tokio::test]
async fn renew_preserves_names_and_rotates_serial() {
    let key = TokenKey::generate();
    let authority = build_authority(vec![jwk_record(
        "ops",
        &key,
        Claims::default(),
        Options::default(),
    )])
    .await;

    let token = key.token("ops", "svc.example.com", &["svc.example.com"]);
    let chain = authority
        .sign(&csr_pem(&["svc.example.com"]), &token, None, None)
        .await
        .unwrap();

    let renewed = authority.renew(&chain.leaf_pem).await.unwrap();
    assert_ne!(renewed.serial, chain.serial);

    let old = authority.cert_record(&chain.serial).await.unwrap().unwrap();
    let new = authority.cert_record(&renewed.serial).await.unwrap().unwrap();
    assert_eq!(old.sans, new.sans);
    assert_eq!(old.provisioner_id, new.provisioner_id);

    // the renewed leaf holds the same public key
    let (_, old_leaf) = x509_parser::parse_x509_certificate(&chain.leaf_der).unwrap();
    let (_, new_leaf) = x509_parser::parse_x509_certificate(&renewed.leaf_der).unwrap();
    assert_eq!(
        old_leaf.public_key().subject_public_key.data,
        new_leaf.public_key().subject_public_key.data
    );
}

#[tokio::test]
async fn renewal_can_be_disabled() {
    let key = TokenKey::generate();
    let claims = Claims {
        disable_renewal: true,
        ..Default::default()
    };
    let authority = build_authority(vec![jwk_record("ops", &key, claims, Options::default())]).await;

    let token = key.token("ops", "svc.example.com", &["svc.example.com"]);
    let chain = authority
        .sign(&csr_pem(&["svc.example.com"]), &token, None, None)
        .await
        .unwrap();

    let err = authority.renew(&chain.leaf_pem).await.unwrap_err();
    assert!(matches!(err, cerion_authority::Error::Forbidden(_)));
}

#[tokio::test]
async fn revocation_is_single_shot_and_lands_in_the_crl() {
    let key = TokenKey::generate();
    let authority = build_authority(vec![jwk_record(
        "ops",
        &key,
        Claims::default(),
        Options::default(),
    )])
    .await;

    let token = key.token("ops", "svc.example.com", &["svc.example.com"]);
    let chain = authority
        .sign(&csr_pem(&["svc.example.com"]), &token, None, None)
        .await
        .unwrap();

    let revoke_token = key.token("ops", &chain.serial, &[]);
    authority
        .revoke(&chain.serial, 1, RevocationAuth::Token(&revoke_token))
        .await
        .unwrap();

    // a second revocation conflicts
    let another = key.token("ops", &chain.serial, &[]);
    let err = authority
        .revoke(&chain.serial, 1, RevocationAuth::Token(&another))
        .await
        .unwrap_err();
    assert!(matches!(err, cerion_authority::Error::Conflict(_)));

    // renewal of a revoked certificate is refused
    assert!(authority.renew(&chain.leaf_pem).await.is_err());

    // the CRL lists the serial
    let crl_der = authority.crl_der().await.unwrap();
    let (_, crl) =
        x509_parser::revocation_list::CertificateRevocationList::from_der(&crl_der).unwrap();
    let revoked: Vec<String> = crl
        .iter_revoked_certificates()
        .map(|rc| rc.user_certificate.to_str_radix(16))
        .collect();
    assert!(
        revoked
            .iter()
            .any(|s| s.trim_start_matches('0') == chain.serial.trim_start_matches('0')),
        "serial {} not in CRL {revoked:?}",
        chain.serial
    );
}

#[tokio::test]
async fn acme_seam_issues_and_serves_by_account() {
    let authority = build_authority(vec![ProvisionerRecord {
        id: "acme/web".into(),
        name: "web".into(),
        kind: Kind::Acme,
        config_version: 0,
        claims: Claims::default(),
        options: Options::default(),
        config: serde_json::json!({}),
    }])
    .await;

    let csr = csr_pem(&["a.test"]);
    let csr_der = {
        let body: String = csr
            .lines()
            .skip(1)
            .take_while(|l| !l.starts_with("-----END"))
            .collect();
        base64::engine::general_purpose::STANDARD
            .decode(body.as_bytes())
            .unwrap()
    };
    let issued = authority
        .sign_acme(
            "web",
            "acct-1",
            &csr_der,
            &[cerion_cert::San::Dns("a.test".into())],
        )
        .await
        .unwrap();

    // the owner sees the chain; others do not
    assert!(authority
        .acme_certificate(&issued.serial, "acct-1")
        .await
        .unwrap()
        .is_some());
    assert!(authority
        .acme_certificate(&issued.serial, "acct-2")
        .await
        .unwrap()
        .is_none());

    // only the owner may revoke
    assert!(authority
        .revoke_acme(&issued.serial, 1, Some("acct-2"))
        .await
        .is_err());
    authority
        .revoke_acme(&issued.serial, 1, Some("acct-1"))
        .await
        .unwrap();

    // once revoked, the chain is gone
    assert!(authority
        .acme_certificate(&issued.serial, "acct-1")
        .await
        .unwrap()
        .is_none());
}
