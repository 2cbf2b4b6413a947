//! pkiMessage envelopes.
//!
//! A request is PKCS#7 SignedData over the transport structure; the
//! enrollment payload inside it is PKCS#7 EnvelopedData encrypted to the
//! CA's decryption (RA) certificate, containing the PKCS#10 CSR. Responses
//! mirror the shape, with the issued certificate encrypted back to the
//! requester's certificate.
//!
//! Transport structures:
//!
//! ```text
//! request  ::= SEQUENCE { messageType INTEGER, transactionId PrintableString,
//!                         senderNonce OCTET STRING, payload OCTET STRING }
//! response ::= SEQUENCE { messageType INTEGER (3), status INTEGER,
//!                         failInfo INTEGER (when status = FAILURE),
//!                         transactionId PrintableString,
//!                         recipientNonce OCTET STRING, payload OCTET STRING }
//! ```

use crate::{asn1, Error, FailInfo, MessageType, PkiStatus, Result};
use openssl::pkey::{PKeyRef, Private};
use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::{X509Ref, X509};

/// A parsed and decrypted PKIOperation request.
#[derive(Debug)]
pub struct PkiEnvelope {
    pub message_type: MessageType,
    pub transaction_id: String,
    pub sender_nonce: Vec<u8>,
    /// Decrypted payload; the CSR DER for enrollment requests, empty for
    /// `GetCertInitial`.
    pub csr_der: Vec<u8>,
    /// The requester's signing certificate, DER.
    pub signer_cert_der: Vec<u8>,
}

impl PkiEnvelope {
    /// Parses a pkiMessage: verifies the SignedData signature against the
    /// embedded signer certificate and decrypts the enveloped payload.
    pub fn parse(
        der: &[u8],
        decrypt_cert: &X509Ref,
        decrypt_key: &PKeyRef<Private>,
    ) -> Result<Self> {
        let pkcs7 = Pkcs7::from_der(der).map_err(|e| Error::Malformed(format!("SignedData: {e}")))?;

        let empty = Stack::new()?;
        let signers = pkcs7
            .signers(&empty, Pkcs7Flags::empty())
            .map_err(|e| Error::Malformed(format!("no signer certificate: {e}")))?;
        let signer = signers
            .get(0)
            .ok_or_else(|| Error::Malformed("pkiMessage carries no signer certificate".into()))?;
        let signer_cert_der = signer.to_der()?;

        // NOVERIFY: the signature must verify against the embedded
        // certificate, but the certificate is self-signed for initial
        // enrollment, so no chain building.
        let store = X509StoreBuilder::new()?.build();
        let mut content = Vec::new();
        pkcs7
            .verify(
                &empty,
                &store,
                None,
                Some(&mut content),
                Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
            )
            .map_err(|e| Error::Malformed(format!("pkiMessage signature: {e}")))?;

        let mut outer = asn1::Reader::new(&content);
        let mut seq = outer.sequence()?;
        let message_type = MessageType::from_code(seq.integer()?)
            .ok_or_else(|| Error::Malformed("unknown messageType".into()))?;
        let transaction_id = seq.printable_string()?;
        let sender_nonce = seq.octet_string()?.to_vec();
        let payload = seq.octet_string()?.to_vec();

        let csr_der = if payload.is_empty() {
            Vec::new()
        } else {
            let enveloped = Pkcs7::from_der(&payload)
                .map_err(|e| Error::Malformed(format!("EnvelopedData: {e}")))?;
            enveloped
                .decrypt(decrypt_key, decrypt_cert, Pkcs7Flags::BINARY)
                .map_err(|e| Error::Malformed(format!("payload decryption: {e}")))?
        };

        Ok(Self {
            message_type,
            transaction_id,
            sender_nonce,
            csr_der,
            signer_cert_der,
        })
    }

    /// Builds a pkiMessage request (the client side; also used by tests).
    pub fn build(
        message_type: MessageType,
        transaction_id: &str,
        sender_nonce: &[u8],
        csr_der: &[u8],
        recipient: &X509Ref,
        signer_cert: &X509Ref,
        signer_key: &PKeyRef<Private>,
    ) -> Result<Vec<u8>> {
        let payload = if csr_der.is_empty() {
            Vec::new()
        } else {
            let mut recipients = Stack::new()?;
            recipients.push(recipient.to_owned())?;
            Pkcs7::encrypt(
                &recipients,
                csr_der,
                Cipher::aes_256_cbc(),
                Pkcs7Flags::BINARY,
            )?
            .to_der()?
        };

        let content = asn1::sequence(&[
            asn1::integer(message_type.code()),
            asn1::printable_string(transaction_id),
            asn1::octet_string(sender_nonce),
            asn1::octet_string(&payload),
        ]);

        let extra = Stack::new()?;
        let signed = Pkcs7::sign(
            signer_cert,
            signer_key,
            &extra,
            &content,
            Pkcs7Flags::BINARY,
        )?;
        Ok(signed.to_der()?)
    }
}

/// A CertRep under construction or parsed back (tests).
#[derive(Debug)]
pub struct PkiResponse {
    pub status: PkiStatus,
    pub fail_info: Option<FailInfo>,
    pub transaction_id: String,
    /// Echo of the request's senderNonce.
    pub recipient_nonce: Vec<u8>,
    /// Decrypted payload: the issued certificate DER on success.
    pub cert_der: Vec<u8>,
}

impl PkiResponse {
    /// Builds a signed CertRep. On success the issued certificate is
    /// encrypted to the requester's certificate.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        status: PkiStatus,
        fail_info: Option<FailInfo>,
        transaction_id: &str,
        recipient_nonce: &[u8],
        cert_der: &[u8],
        requester_cert: Option<&X509Ref>,
        signer_cert: &X509Ref,
        signer_key: &PKeyRef<Private>,
    ) -> Result<Vec<u8>> {
        let payload = match (status, requester_cert) {
            (PkiStatus::Success, Some(requester)) if !cert_der.is_empty() => {
                let mut recipients = Stack::new()?;
                recipients.push(requester.to_owned())?;
                Pkcs7::encrypt(
                    &recipients,
                    cert_der,
                    Cipher::aes_256_cbc(),
                    Pkcs7Flags::BINARY,
                )?
                .to_der()?
            }
            _ => Vec::new(),
        };

        let mut parts = vec![
            asn1::integer(MessageType::CertRep.code()),
            asn1::integer(status.code()),
        ];
        if status == PkiStatus::Failure {
            parts.push(asn1::integer(
                fail_info.unwrap_or(FailInfo::BadRequest).code(),
            ));
        }
        parts.push(asn1::printable_string(transaction_id));
        parts.push(asn1::octet_string(recipient_nonce));
        parts.push(asn1::octet_string(&payload));
        let content = asn1::sequence(&parts);

        let extra = Stack::new()?;
        let signed = Pkcs7::sign(
            signer_cert,
            signer_key,
            &extra,
            &content,
            Pkcs7Flags::BINARY,
        )?;
        Ok(signed.to_der()?)
    }

    /// Parses a CertRep and decrypts its payload (the client side; tests).
    pub fn parse(
        der: &[u8],
        expected_signer: &X509Ref,
        decrypt_cert: &X509Ref,
        decrypt_key: &PKeyRef<Private>,
    ) -> Result<Self> {
        let pkcs7 = Pkcs7::from_der(der)?;
        let empty = Stack::new()?;
        let signers = pkcs7.signers(&empty, Pkcs7Flags::empty())?;
        let signer = signers
            .get(0)
            .ok_or_else(|| Error::Malformed("CertRep carries no signer".into()))?;
        if signer.to_der()? != expected_signer.to_der()? {
            return Err(Error::Malformed("CertRep signed by an unexpected certificate".into()));
        }
        let store = X509StoreBuilder::new()?.build();
        let mut content = Vec::new();
        pkcs7.verify(
            &empty,
            &store,
            None,
            Some(&mut content),
            Pkcs7Flags::NOVERIFY | Pkcs7Flags::BINARY,
        )?;

        let mut outer = asn1::Reader::new(&content);
        let mut seq = outer.sequence()?;
        let message_type = seq.integer()?;
        if message_type != MessageType::CertRep.code() {
            return Err(Error::Malformed("response is not a CertRep".into()));
        }
        let status = PkiStatus::from_code(seq.integer()?)
            .ok_or_else(|| Error::Malformed("unknown pkiStatus".into()))?;
        let fail_info = if status == PkiStatus::Failure {
            let code = seq.integer()?;
            Some(match code {
                0 => FailInfo::BadAlg,
                1 => FailInfo::BadMessageCheck,
                2 => FailInfo::BadRequest,
                3 => FailInfo::BadTime,
                _ => FailInfo::BadCertId,
            })
        } else {
            None
        };
        let transaction_id = seq.printable_string()?;
        let recipient_nonce = seq.octet_string()?.to_vec();
        let payload = seq.octet_string()?.to_vec();

        let cert_der = if payload.is_empty() {
            Vec::new()
        } else {
            Pkcs7::from_der(&payload)?
                .decrypt(decrypt_key, decrypt_cert, Pkcs7Flags::BINARY)
                .map_err(|e| Error::Malformed(format!("CertRep payload: {e}")))?
        };

        Ok(Self {
            status,
            fail_info,
            transaction_id,
            recipient_nonce,
            cert_der,
        })
    }
}

/// Generates a self-signed requester certificate and key (client side of
/// initial enrollment; exposed for tests).
pub fn self_signed_requester(cn: &str) -> Result<(X509, openssl::pkey::PKey<Private>)> {
    use openssl::asn1::Asn1Time;
    use openssl::hash::MessageDigest;
    use openssl::pkey::PKey;
    use openssl::rsa::Rsa;
    use openssl::x509::X509NameBuilder;

    let rsa = Rsa::generate(2048)?;
    let key = PKey::from_rsa(rsa)?;

    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_text("CN", cn)?;
    let name = name.build();

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_subject_name(&name)?;
    builder.set_issuer_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.set_not_before(Asn1Time::days_from_now(0)?.as_ref())?;
    builder.set_not_after(Asn1Time::days_from_now(7)?.as_ref())?;
    builder.sign(&key, MessageDigest::sha256())?;
    Ok((builder.build(), key))
}
