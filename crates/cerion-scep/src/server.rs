//! SCEP operation handlers.

use crate::message::{PkiEnvelope, PkiResponse};
use crate::{Error, FailInfo, MessageType, PkiStatus, Result, CA_CAPS};
use async_trait::async_trait;
use cerion_db::{Bucket, Db};
use cerion_provisioner::{Provisioner as _, ScepProvisioner};
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Ref, X509};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::prelude::FromDer;

/// What the pipeline returns for an enrolled CSR.
#[derive(Debug, Clone)]
pub struct ScepIssued {
    pub serial: String,
    pub leaf_der: Vec<u8>,
}

/// The issuance pipeline, as SCEP sees it.
#[async_trait]
pub trait ScepAuthority: Send + Sync {
    /// Signs a SCEP-enrolled CSR under the named provisioner.
    async fn sign_scep(
        &self,
        provisioner_name: &str,
        csr_der: &[u8],
    ) -> std::result::Result<ScepIssued, String>;
}

#[derive(Debug, Serialize, Deserialize)]
struct TransactionRecord {
    serial: String,
    /// base64 leaf DER; replays return the same certificate.
    leaf_b64: String,
}

/// One SCEP endpoint: a provisioner plus the RA (decryption/response)
/// credentials.
pub struct ScepServer {
    provisioner: Arc<ScepProvisioner>,
    db: Arc<dyn Db>,
    ca_cert: X509,
    ra_cert: X509,
    ra_key: PKey<Private>,
}

impl ScepServer {
    /// Builds a server from PEM credentials. `ra_*` is the key pair SCEP
    /// payloads are encrypted to; the CA signing key stays behind the KMS.
    pub fn new(
        provisioner: Arc<ScepProvisioner>,
        db: Arc<dyn Db>,
        ca_cert_pem: &str,
        ra_cert_pem: &str,
        ra_key_pem: &str,
    ) -> Result<Self> {
        Ok(Self {
            provisioner,
            db,
            ca_cert: X509::from_pem(ca_cert_pem.as_bytes())?,
            ra_cert: X509::from_pem(ra_cert_pem.as_bytes())?,
            ra_key: PKey::private_key_from_pem(ra_key_pem.as_bytes())?,
        })
    }

    /// The RA certificate payloads must be encrypted to.
    pub fn ra_cert(&self) -> &X509Ref {
        &self.ra_cert
    }

    /// `GetCACert`: the CA certificate (plus the configured additional
    /// certificate, if any), DER-concatenated.
    pub fn get_ca_cert(&self) -> Result<Vec<u8>> {
        let mut out = self.ca_cert.to_der()?;
        if let Some(extra_pem) = self.provisioner.additional_ca_cert() {
            out.extend(X509::from_pem(extra_pem.as_bytes())?.to_der()?);
        }
        Ok(out)
    }

    /// `GetCACaps`: newline-separated capability list.
    pub fn get_ca_caps(&self) -> String {
        CA_CAPS.join("\n")
    }

    /// `PKIOperation`: decode, validate, enroll, respond.
    ///
    /// Post-parse failures are answered with a signed FAILURE CertRep;
    /// undecodable envelopes surface as errors for the transport layer.
    pub async fn pki_operation(
        &self,
        body: &[u8],
        authority: &dyn ScepAuthority,
    ) -> Result<Vec<u8>> {
        let envelope = PkiEnvelope::parse(body, &self.ra_cert, &self.ra_key)?;
        let requester = X509::from_der(&envelope.signer_cert_der)?;

        match self.handle(&envelope, &requester, authority).await {
            Ok(response) => Ok(response),
            Err(e) => {
                tracing::warn!(
                    transaction = %envelope.transaction_id,
                    error = %e,
                    "SCEP enrollment rejected"
                );
                PkiResponse::build(
                    PkiStatus::Failure,
                    Some(e.fail_info()),
                    &envelope.transaction_id,
                    &envelope.sender_nonce,
                    &[],
                    None,
                    &self.ra_cert,
                    &self.ra_key,
                )
            }
        }
    }

    async fn handle(
        &self,
        envelope: &PkiEnvelope,
        requester: &X509Ref,
        authority: &dyn ScepAuthority,
    ) -> Result<Vec<u8>> {
        let tx_key = format!("{}/{}", self.provisioner.name(), envelope.transaction_id);

        // a replayed transaction returns the certificate already issued
        if let Some(record) = self.lookup_transaction(&tx_key).await? {
            let leaf = base64_decode(&record.leaf_b64)?;
            return self.success(envelope, requester, &leaf);
        }

        match envelope.message_type {
            MessageType::PkcsReq => {
                self.validate_initial_signer(envelope, requester)?;
                let challenge = self.challenge_password(&envelope.csr_der)?;
                self.provisioner
                    .validate_challenge(&challenge)
                    .map_err(|_| {
                        Error::rejected(FailInfo::BadMessageCheck, "invalid challenge password")
                    })?;
            }
            MessageType::RenewalReq => {
                // the renewal must be signed with a certificate this CA
                // issued, still within its validity window
                let issued_by_us = requester
                    .verify(self.ca_cert.public_key()?.as_ref())
                    .unwrap_or(false);
                if !issued_by_us {
                    return Err(Error::rejected(
                        FailInfo::BadMessageCheck,
                        "renewal is not signed by a certificate from this CA",
                    ));
                }
            }
            MessageType::GetCertInitial => {
                // nothing issued yet for this transaction
                return PkiResponse::build(
                    PkiStatus::Pending,
                    None,
                    &envelope.transaction_id,
                    &envelope.sender_nonce,
                    &[],
                    None,
                    &self.ra_cert,
                    &self.ra_key,
                );
            }
            MessageType::CertRep => {
                return Err(Error::rejected(
                    FailInfo::BadRequest,
                    "CertRep is not a request",
                ));
            }
        }

        self.validate_csr(&envelope.csr_der)?;
        let issued = authority
            .sign_scep(self.provisioner.name(), &envelope.csr_der)
            .await
            .map_err(Error::Issuance)?;

        self.store_transaction(&tx_key, &issued).await?;
        tracing::info!(
            transaction = %envelope.transaction_id,
            serial = %issued.serial,
            "SCEP enrollment issued"
        );
        self.success(envelope, requester, &issued.leaf_der)
    }

    fn success(
        &self,
        envelope: &PkiEnvelope,
        requester: &X509Ref,
        leaf_der: &[u8],
    ) -> Result<Vec<u8>> {
        PkiResponse::build(
            PkiStatus::Success,
            None,
            &envelope.transaction_id,
            &envelope.sender_nonce,
            leaf_der,
            Some(requester),
            &self.ra_cert,
            &self.ra_key,
        )
    }

    /// Initial enrollment: the envelope must be self-signed over the CSR
    /// key (RFC 8894 §2.3).
    fn validate_initial_signer(&self, envelope: &PkiEnvelope, requester: &X509Ref) -> Result<()> {
        let self_signed = requester
            .verify(requester.public_key()?.as_ref())
            .unwrap_or(false);
        if !self_signed {
            return Err(Error::rejected(
                FailInfo::BadMessageCheck,
                "initial enrollment requires a self-signed requester certificate",
            ));
        }
        let csr = openssl::x509::X509Req::from_der(&envelope.csr_der)
            .map_err(|e| Error::rejected(FailInfo::BadRequest, format!("CSR: {e}")))?;
        let same_key = requester
            .public_key()?
            .public_eq(csr.public_key()?.as_ref());
        if !same_key {
            return Err(Error::rejected(
                FailInfo::BadMessageCheck,
                "requester certificate key does not match the CSR key",
            ));
        }
        Ok(())
    }

    fn validate_csr(&self, csr_der: &[u8]) -> Result<()> {
        let (_, csr) = X509CertificationRequest::from_der(csr_der)
            .map_err(|e| Error::rejected(FailInfo::BadRequest, format!("CSR: {e}")))?;
        csr.verify_signature()
            .map_err(|e| Error::rejected(FailInfo::BadMessageCheck, format!("CSR signature: {e}")))?;

        // RSA key floor
        if let Ok(x509_parser::public_key::PublicKey::RSA(rsa)) = csr.certification_request_info.subject_pki.parsed() {
            let bits = (rsa.modulus.len() as u32).saturating_sub(
                rsa.modulus.iter().take_while(|&&b| b == 0).count() as u32,
            ) * 8;
            if bits < self.provisioner.min_public_key_length() {
                return Err(Error::rejected(
                    FailInfo::BadRequest,
                    format!(
                        "RSA key of {bits} bits is below the {} bit minimum",
                        self.provisioner.min_public_key_length()
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Pulls the challengePassword attribute out of the CSR.
    fn challenge_password(&self, csr_der: &[u8]) -> Result<String> {
        let (_, csr) = X509CertificationRequest::from_der(csr_der)
            .map_err(|e| Error::rejected(FailInfo::BadRequest, format!("CSR: {e}")))?;
        for attribute in csr.certification_request_info.iter_attributes() {
            if let x509_parser::cri_attributes::ParsedCriAttribute::ChallengePassword(
                password,
            ) = attribute.parsed_attribute()
            {
                return Ok(password.0.clone());
            }
        }
        Err(Error::rejected(
            FailInfo::BadMessageCheck,
            "CSR carries no challengePassword",
        ))
    }

    async fn lookup_transaction(&self, key: &str) -> Result<Option<TransactionRecord>> {
        match self.db.get(Bucket::ScepTransactions, key.as_bytes()).await {
            Ok(raw) => Ok(Some(cerion_db::decode(Bucket::ScepTransactions, &raw)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn store_transaction(&self, key: &str, issued: &ScepIssued) -> Result<()> {
        let record = TransactionRecord {
            serial: issued.serial.clone(),
            leaf_b64: base64_encode(&issued.leaf_der),
        };
        let raw = cerion_db::encode(Bucket::ScepTransactions, &record)?;
        // first writer wins; a racing duplicate adopts the stored result
        match self
            .db
            .cmp_and_swap(Bucket::ScepTransactions, key.as_bytes(), None, Some(raw))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|e| Error::Malformed(format!("stored certificate: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::self_signed_requester;
    use cerion_db::MemoryDb;
    use cerion_provisioner::{Claims, Options, ScepConfig};
    use openssl::hash::MessageDigest;
    use openssl::x509::{X509NameBuilder, X509ReqBuilder};

    struct MockPipeline;

    #[async_trait]
    impl ScepAuthority for MockPipeline {
        async fn sign_scep(
            &self,
            _provisioner: &str,
            csr_der: &[u8],
        ) -> std::result::Result<ScepIssued, String> {
            // "issue" by self-signing a certificate over the CSR subject
            let csr = openssl::x509::X509Req::from_der(csr_der).map_err(|e| e.to_string())?;
            let (ca_cert, ca_key) = self_signed_requester("Mock Issuer").unwrap();
            let mut builder = X509::builder().map_err(|e| e.to_string())?;
            builder.set_version(2).unwrap();
            builder.set_subject_name(csr.subject_name()).unwrap();
            builder.set_issuer_name(ca_cert.subject_name()).unwrap();
            builder.set_pubkey(csr.public_key().unwrap().as_ref()).unwrap();
            builder
                .set_not_before(openssl::asn1::Asn1Time::days_from_now(0).unwrap().as_ref())
                .unwrap();
            builder
                .set_not_after(openssl::asn1::Asn1Time::days_from_now(1).unwrap().as_ref())
                .unwrap();
            builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
            Ok(ScepIssued {
                serial: "0ab1".into(),
                leaf_der: builder.build().to_der().unwrap(),
            })
        }
    }

    fn server(challenge: &str) -> ScepServer {
        let provisioner = Arc::new(
            ScepProvisioner::new(
                "mdm",
                ScepConfig {
                    challenge: challenge.into(),
                    ..Default::default()
                },
                Claims::default(),
                Options::default(),
            )
            .unwrap(),
        );
        let (ca_cert, _) = self_signed_requester("Cerion Test CA").unwrap();
        let (ra_cert, ra_key) = self_signed_requester("Cerion Test RA").unwrap();
        ScepServer::new(
            provisioner,
            Arc::new(MemoryDb::new()),
            &String::from_utf8(ca_cert.to_pem().unwrap()).unwrap(),
            &String::from_utf8(ra_cert.to_pem().unwrap()).unwrap(),
            &String::from_utf8(ra_key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
        )
        .unwrap()
    }

    /// Builds a CSR for `cn` signed by `key`, then splices a
    /// challengePassword attribute into the CertificationRequestInfo and
    /// re-signs (neither openssl nor rcgen expose CSR attributes).
    fn csr_with_challenge(key: &PKey<Private>, cn: &str, challenge: &str) -> Vec<u8> {
        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", cn).unwrap();
        let name = name.build();
        let mut builder = X509ReqBuilder::new().unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_pubkey(key).unwrap();
        builder.sign(key, MessageDigest::sha256()).unwrap();
        let base = builder.build().to_der().unwrap();

        // unwrap the outer SEQUENCE: cri, sigalg, signature
        let mut outer = crate::asn1::Reader::new(&base);
        let mut seq_reader = outer.sequence().unwrap();
        let cri_der = seq_reader.raw_tlv().unwrap().to_vec();

        // cri is SEQUENCE { version, subject, spki, [0] attributes }; strip
        // the empty attribute wrapper and append ours
        let mut cri_reader = crate::asn1::Reader::new(&cri_der);
        let mut cri_body = cri_reader.sequence().unwrap();
        let version = cri_body.raw_tlv().unwrap().to_vec();
        let subject = cri_body.raw_tlv().unwrap().to_vec();
        let spki = cri_body.raw_tlv().unwrap().to_vec();

        // Attribute ::= SEQUENCE { 1.2.840.113549.1.9.7, SET { PrintableString } }
        let challenge_oid: &[u8] = &[
            0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x09, 0x07,
        ];
        let password = crate::asn1::printable_string(challenge);
        let mut attr_set = vec![0x31];
        push_len(&mut attr_set, password.len());
        attr_set.extend_from_slice(&password);
        let attr_content: Vec<u8> = [challenge_oid.to_vec(), attr_set].concat();
        let mut attribute = vec![0x30];
        push_len(&mut attribute, attr_content.len());
        attribute.extend_from_slice(&attr_content);
        let mut attrs = vec![0xa0];
        push_len(&mut attrs, attribute.len());
        attrs.extend_from_slice(&attribute);

        let cri_content: Vec<u8> = [version, subject, spki, attrs].concat();
        let mut cri = vec![0x30];
        push_len(&mut cri, cri_content.len());
        cri.extend_from_slice(&cri_content);

        // re-sign the patched CertificationRequestInfo
        let mut signer =
            openssl::sign::Signer::new(MessageDigest::sha256(), key).unwrap();
        signer.update(&cri).unwrap();
        let signature = signer.sign_to_vec().unwrap();

        // sha256WithRSAEncryption
        let sig_alg: &[u8] = &[
            0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b, 0x05,
            0x00,
        ];
        let mut sig_bits = vec![0x00];
        sig_bits.extend_from_slice(&signature);
        let mut bit_string = vec![0x03];
        push_len(&mut bit_string, sig_bits.len());
        bit_string.extend_from_slice(&sig_bits);

        let csr_content: Vec<u8> = [cri, sig_alg.to_vec(), bit_string].concat();
        let mut csr = vec![0x30];
        push_len(&mut csr, csr_content.len());
        csr.extend_from_slice(&csr_content);
        csr
    }

    fn push_len(out: &mut Vec<u8>, len: usize) {
        if len < 0x80 {
            out.push(len as u8);
        } else {
            let bytes = len.to_be_bytes();
            let skip = bytes.iter().take_while(|&&b| b == 0).count();
            let significant = &bytes[skip..];
            out.push(0x80 | significant.len() as u8);
            out.extend_from_slice(significant);
        }
    }

    fn pkcs_req(server: &ScepServer, challenge: &str, txid: &str) -> (Vec<u8>, X509, PKey<Private>) {
        let (requester_cert, requester_key) = self_signed_requester("dev-1").unwrap();
        let csr = csr_with_challenge(&requester_key, "dev-1", challenge);
        let body = PkiEnvelope::build(
            MessageType::PkcsReq,
            txid,
            b"sender-nonce-1",
            &csr,
            server.ra_cert(),
            &requester_cert,
            &requester_key,
        )
        .unwrap();
        (body, requester_cert, requester_key)
    }

    #[tokio::test]
    async fn pkcs_req_enrolls_and_replay_returns_same_cert() {
        let server = server("secret");
        let (body, requester_cert, requester_key) = pkcs_req(&server, "secret", "tx-1");

        let response = server.pki_operation(&body, &MockPipeline).await.unwrap();
        let parsed = PkiResponse::parse(
            &response,
            &server.ra_cert,
            &requester_cert,
            &requester_key,
        )
        .unwrap();
        assert_eq!(parsed.status, PkiStatus::Success);
        assert_eq!(parsed.transaction_id, "tx-1");
        assert_eq!(parsed.recipient_nonce, b"sender-nonce-1");
        let issued = X509::from_der(&parsed.cert_der).unwrap();
        let cn = issued
            .subject_name()
            .entries()
            .next()
            .unwrap()
            .data()
            .as_utf8()
            .unwrap()
            .to_string();
        assert_eq!(cn, "dev-1");

        // replay with the same transaction ID: identical certificate
        let response = server.pki_operation(&body, &MockPipeline).await.unwrap();
        let replayed = PkiResponse::parse(
            &response,
            &server.ra_cert,
            &requester_cert,
            &requester_key,
        )
        .unwrap();
        assert_eq!(replayed.status, PkiStatus::Success);
        assert_eq!(replayed.cert_der, parsed.cert_der);
    }

    #[tokio::test]
    async fn wrong_challenge_fails_with_bad_message_check() {
        let server = server("secret");
        let (body, requester_cert, requester_key) = pkcs_req(&server, "wrong", "tx-2");

        let response = server.pki_operation(&body, &MockPipeline).await.unwrap();
        let parsed = PkiResponse::parse(
            &response,
            &server.ra_cert,
            &requester_cert,
            &requester_key,
        )
        .unwrap();
        assert_eq!(parsed.status, PkiStatus::Failure);
        assert_eq!(parsed.fail_info, Some(FailInfo::BadMessageCheck));
        assert!(parsed.cert_der.is_empty());
    }

    #[tokio::test]
    async fn envelope_signer_must_hold_the_csr_key() {
        let server = server("secret");
        // CSR key differs from the envelope signer's key
        let (requester_cert, requester_key) = self_signed_requester("dev-1").unwrap();
        let (_, other_key) = self_signed_requester("other").unwrap();
        let csr = csr_with_challenge(&other_key, "dev-1", "secret");
        let body = PkiEnvelope::build(
            MessageType::PkcsReq,
            "tx-3",
            b"nonce",
            &csr,
            server.ra_cert(),
            &requester_cert,
            &requester_key,
        )
        .unwrap();

        let response = server.pki_operation(&body, &MockPipeline).await.unwrap();
        let parsed = PkiResponse::parse(
            &response,
            &server.ra_cert,
            &requester_cert,
            &requester_key,
        )
        .unwrap();
        assert_eq!(parsed.status, PkiStatus::Failure);
        assert_eq!(parsed.fail_info, Some(FailInfo::BadMessageCheck));
    }

    #[tokio::test]
    async fn get_cert_initial_is_pending_until_issued() {
        let server = server("secret");
        let (requester_cert, requester_key) = self_signed_requester("dev-1").unwrap();
        let body = PkiEnvelope::build(
            MessageType::GetCertInitial,
            "tx-4",
            b"nonce",
            &[],
            server.ra_cert(),
            &requester_cert,
            &requester_key,
        )
        .unwrap();

        let response = server.pki_operation(&body, &MockPipeline).await.unwrap();
        let parsed = PkiResponse::parse(
            &response,
            &server.ra_cert,
            &requester_cert,
            &requester_key,
        )
        .unwrap();
        assert_eq!(parsed.status, PkiStatus::Pending);
    }

    #[test]
    fn ca_caps_and_cert() {
        let server = server("secret");
        let caps = server.get_ca_caps();
        assert!(caps.contains("SHA-256"));
        assert!(caps.contains("POSTPKIOperation"));
        let der = server.get_ca_cert().unwrap();
        X509::from_der(&der).unwrap();
    }

    #[tokio::test]
    async fn garbage_envelope_is_an_error() {
        let server = server("secret");
        let result = server.pki_operation(b"not pkcs7", &MockPipeline).await;
        assert!(matches!(result, Err(Error::Malformed(_))));
    }
}
