//! Order lifecycle: creation, status recomputation, finalization.
//!
//! Status moves monotonically along pending → ready → processing → valid;
//! any non-terminal order can fall to invalid. All transitions are CAS
//! writes; losers re-read and either become no-ops or surface
//! `orderNotReady`.

use crate::db::{random_token, AcmeDb, Stored};
use crate::types::{
    Authorization, AuthzStatus, Challenge, ChallengeStatus, ChallengeType, Identifier,
    IdentifierType, Order, OrderStatus,
};
use crate::{AcmeIssuer, CertificateAuthority, Error, ErrorKind, Result};
use cerion_cert::San;
use chrono::{DateTime, Duration, Utc};
use x509_parser::certification_request::X509CertificationRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

/// Orders and authorizations expire this long after creation.
const ORDER_LIFETIME_HOURS: i64 = 24;

/// CAS transitions are retried this many times before surfacing.
const CAS_RETRIES: usize = 3;

/// Order creation and finalization over the ACME store.
#[derive(Clone)]
pub struct OrderService {
    db: AcmeDb,
}

impl OrderService {
    pub fn new(db: AcmeDb) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &AcmeDb {
        &self.db
    }

    /// Creates an order with its authorizations and challenges.
    pub async fn create_order(
        &self,
        issuer: &AcmeIssuer,
        account_id: &str,
        identifiers: Vec<Identifier>,
        not_before: Option<DateTime<Utc>>,
        not_after: Option<DateTime<Utc>>,
    ) -> Result<Order> {
        if identifiers.is_empty() {
            return Err(Error::malformed("order must name at least one identifier"));
        }
        for identifier in &identifiers {
            self.check_identifier_supported(issuer, identifier)?;
        }
        let identifiers = Order::canonicalize(identifiers);
        let expires_at = Utc::now() + Duration::hours(ORDER_LIFETIME_HOURS);
        let order_id = random_token();

        let mut authz_ids = Vec::with_capacity(identifiers.len());
        for identifier in &identifiers {
            let authz = self
                .create_authz(issuer, &order_id, account_id, identifier, expires_at)
                .await?;
            authz_ids.push(authz.id);
        }

        let order = Order {
            id: order_id,
            account_id: account_id.to_string(),
            provisioner: issuer.name().to_string(),
            status: OrderStatus::Pending,
            identifiers,
            authz_ids,
            not_before,
            not_after,
            expires_at,
            certificate_serial: None,
            error: None,
        };
        self.db.create_order(&order).await?;
        tracing::debug!(order = %order.id, account = account_id, "created order");
        Ok(order)
    }

    fn check_identifier_supported(&self, issuer: &AcmeIssuer, identifier: &Identifier) -> Result<()> {
        let supported = match identifier.kind {
            IdentifierType::Dns | IdentifierType::Ip => matches!(issuer, AcmeIssuer::Acme(_)),
            IdentifierType::PermanentIdentifier => {
                issuer.challenge_enabled(ChallengeType::DeviceAttest01)
            }
            IdentifierType::WireappUser | IdentifierType::WireappDevice => {
                matches!(issuer, AcmeIssuer::Wire(_))
            }
        };
        if supported {
            Ok(())
        } else {
            Err(Error::new(
                ErrorKind::UnsupportedIdentifier,
                format!("identifier type is not supported for {:?}", identifier.value),
            ))
        }
    }

    async fn create_authz(
        &self,
        issuer: &AcmeIssuer,
        order_id: &str,
        account_id: &str,
        identifier: &Identifier,
        expires_at: DateTime<Utc>,
    ) -> Result<Authorization> {
        let wildcard = identifier.kind == IdentifierType::Dns && identifier.value.starts_with("*.");
        let authz_id = random_token();

        let mut challenge_ids = Vec::new();
        for kind in self.offered_challenges(issuer, identifier, wildcard) {
            let challenge = Challenge {
                id: random_token(),
                authz_id: authz_id.clone(),
                account_id: account_id.to_string(),
                kind,
                token: random_token(),
                status: ChallengeStatus::Pending,
                validated_at: None,
                last_attempt_at: None,
                error: None,
                validation_proof: None,
            };
            self.db.create_challenge(&challenge).await?;
            challenge_ids.push(challenge.id);
        }
        if challenge_ids.is_empty() {
            return Err(Error::new(
                ErrorKind::UnsupportedIdentifier,
                format!("no challenge types available for {:?}", identifier.value),
            ));
        }

        let authz = Authorization {
            id: authz_id,
            order_id: order_id.to_string(),
            account_id: account_id.to_string(),
            // wildcard authorizations validate the base domain
            identifier: if wildcard {
                Identifier {
                    kind: IdentifierType::Dns,
                    value: identifier.value.trim_start_matches("*.").to_string(),
                }
            } else {
                identifier.clone()
            },
            status: AuthzStatus::Pending,
            challenge_ids,
            expires_at,
            wildcard,
        };
        self.db.create_authz(&authz).await?;
        Ok(authz)
    }

    fn offered_challenges(
        &self,
        issuer: &AcmeIssuer,
        identifier: &Identifier,
        wildcard: bool,
    ) -> Vec<ChallengeType> {
        let candidates: &[ChallengeType] = match identifier.kind {
            // wildcards can only be proven over DNS
            IdentifierType::Dns if wildcard => &[ChallengeType::Dns01],
            IdentifierType::Dns => &[
                ChallengeType::Http01,
                ChallengeType::Dns01,
                ChallengeType::TlsAlpn01,
            ],
            IdentifierType::Ip => &[ChallengeType::Http01, ChallengeType::TlsAlpn01],
            IdentifierType::PermanentIdentifier => &[ChallengeType::DeviceAttest01],
            IdentifierType::WireappUser => &[ChallengeType::WireOidc01],
            IdentifierType::WireappDevice => &[ChallengeType::WireDpop01],
        };
        candidates
            .iter()
            .copied()
            .filter(|c| issuer.challenge_enabled(*c))
            .collect()
    }

    /// Propagates a challenge result into its authorization.
    pub async fn record_challenge_result(&self, challenge: &Challenge) -> Result<()> {
        for _ in 0..CAS_RETRIES {
            let stored = self.db.authz(&challenge.authz_id).await?;
            if stored.value.status != AuthzStatus::Pending {
                return Ok(());
            }
            let mut authz = stored.value.clone();
            match challenge.status {
                ChallengeStatus::Valid => authz.status = AuthzStatus::Valid,
                ChallengeStatus::Invalid => {
                    // invalid only when no other challenge can still succeed
                    let mut any_open = false;
                    for id in &authz.challenge_ids {
                        let sibling = self.db.challenge(id).await?;
                        if !sibling.value.status.is_terminal() {
                            any_open = true;
                            break;
                        }
                    }
                    if any_open {
                        return Ok(());
                    }
                    authz.status = AuthzStatus::Invalid;
                }
                _ => return Ok(()),
            }
            match self.db.update_authz(&stored, &authz).await {
                Ok(_) => return Ok(()),
                Err(e) if e.kind == ErrorKind::OrderNotReady => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Error::server_internal("authorization update kept conflicting"))
    }

    /// Recomputes an order's status from its authorizations.
    ///
    /// pending → ready once every authorization is valid; pending →
    /// invalid when one can no longer succeed or the order expired.
    pub async fn refresh_status(&self, stored: Stored<Order>) -> Result<Stored<Order>> {
        if stored.value.status != OrderStatus::Pending {
            return Ok(stored);
        }
        if stored.value.expires_at < Utc::now() {
            return self.transition(stored, |order| {
                order.status = OrderStatus::Invalid;
                order.error = Some("order has expired".into());
            })
            .await;
        }

        let mut all_valid = true;
        for authz_id in &stored.value.authz_ids {
            let authz = self.db.authz(authz_id).await?;
            match authz.value.status {
                AuthzStatus::Valid => {}
                AuthzStatus::Pending => all_valid = false,
                _ => {
                    return self
                        .transition(stored, |order| {
                            order.status = OrderStatus::Invalid;
                            order.error = Some("an authorization failed".into());
                        })
                        .await;
                }
            }
        }
        if !all_valid {
            return Ok(stored);
        }
        self.transition(stored, |order| order.status = OrderStatus::Ready)
            .await
    }

    async fn transition(
        &self,
        stored: Stored<Order>,
        mutate: impl Fn(&mut Order),
    ) -> Result<Stored<Order>> {
        let mut updated = stored.value.clone();
        mutate(&mut updated);
        match self.db.update_order(&stored, &updated).await {
            Ok(stored) => Ok(stored),
            // a concurrent writer got there first; their view wins
            Err(e) if e.kind == ErrorKind::OrderNotReady => self.db.order(&stored.value.id).await,
            Err(e) => Err(e),
        }
    }

    /// Finalizes an order with the client's CSR.
    ///
    /// The first finalize wins the ready → processing CAS; later calls
    /// observe the current state without re-running issuance.
    pub async fn finalize(
        &self,
        issuer: &AcmeIssuer,
        authority: &dyn CertificateAuthority,
        order_id: &str,
        csr_der: &[u8],
    ) -> Result<Stored<Order>> {
        let stored = self.db.order(order_id).await?;
        let stored = self.refresh_status(stored).await?;

        match stored.value.status {
            OrderStatus::Ready => {}
            // idempotent retries observe the in-flight or finished order
            OrderStatus::Processing | OrderStatus::Valid => return Ok(stored),
            OrderStatus::Pending => {
                return Err(Error::new(
                    ErrorKind::OrderNotReady,
                    "order authorizations are not all valid",
                ))
            }
            OrderStatus::Invalid => {
                return Err(Error::malformed(
                    stored.value.error.clone().unwrap_or_else(|| "order is invalid".into()),
                ))
            }
        }

        let sans = check_csr_matches_order(csr_der, &stored.value)?;

        // claim the order
        let mut processing = stored.value.clone();
        processing.status = OrderStatus::Processing;
        let stored = match self.db.update_order(&stored, &processing).await {
            Ok(stored) => stored,
            Err(e) if e.kind == ErrorKind::OrderNotReady => {
                // lost the race; report whatever the winner produced
                return self.db.order(order_id).await;
            }
            Err(e) => return Err(e),
        };

        match authority
            .sign_acme(&stored.value.provisioner, &stored.value.account_id, csr_der, &sans)
            .await
        {
            Ok(issued) => {
                let result = self
                    .transition(stored, |order| {
                        order.status = OrderStatus::Valid;
                        order.certificate_serial = Some(issued.serial.clone());
                    })
                    .await?;
                tracing::info!(order = order_id, serial = %issued.serial, "order finalized");
                Ok(result)
            }
            Err(e) => {
                let detail = e.detail.clone();
                let _ = self
                    .transition(stored, |order| {
                        order.status = OrderStatus::Invalid;
                        order.error = Some(detail.clone());
                    })
                    .await;
                Err(e)
            }
        }
    }

    /// Deactivates a pending authorization at the client's request.
    pub async fn deactivate_authz(&self, authz_id: &str) -> Result<Stored<Authorization>> {
        let stored = self.db.authz(authz_id).await?;
        if stored.value.status != AuthzStatus::Pending {
            return Err(Error::malformed("only pending authorizations can be deactivated"));
        }
        let mut updated = stored.value.clone();
        updated.status = AuthzStatus::Deactivated;
        self.db.update_authz(&stored, &updated).await
    }
}

/// Parses the CSR, verifies its self-signature, and checks set equality of
/// its names against the order's identifiers. Returns the order's SANs.
pub fn check_csr_matches_order(csr_der: &[u8], order: &Order) -> Result<Vec<San>> {
    let (_, csr) = X509CertificationRequest::from_der(csr_der)
        .map_err(|e| Error::new(ErrorKind::BadCsr, format!("CSR does not parse: {e}")))?;
    csr.verify_signature()
        .map_err(|e| Error::new(ErrorKind::BadCsr, format!("CSR signature: {e}")))?;

    let mut csr_names: Vec<Identifier> = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for ext in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = ext {
                for name in &san.general_names {
                    match name {
                        GeneralName::DNSName(dns) => csr_names.push(Identifier {
                            kind: IdentifierType::Dns,
                            value: dns.to_ascii_lowercase(),
                        }),
                        GeneralName::IPAddress(raw) => {
                            let value = match raw.len() {
                                4 => std::net::IpAddr::from(<[u8; 4]>::try_from(*raw).unwrap())
                                    .to_string(),
                                16 => std::net::IpAddr::from(<[u8; 16]>::try_from(*raw).unwrap())
                                    .to_string(),
                                _ => {
                                    return Err(Error::new(
                                        ErrorKind::BadCsr,
                                        "CSR carries a malformed IP SAN",
                                    ))
                                }
                            };
                            csr_names.push(Identifier {
                                kind: IdentifierType::Ip,
                                value,
                            });
                        }
                        GeneralName::URI(uri) => {
                            // URI SANs stand in for permanent-identifier and
                            // Wire identifiers
                            if let Some(identifier) = order
                                .identifiers
                                .iter()
                                .find(|i| i.value == *uri && i.kind != IdentifierType::Dns)
                            {
                                csr_names.push(identifier.clone());
                            } else {
                                csr_names.push(Identifier {
                                    kind: IdentifierType::PermanentIdentifier,
                                    value: uri.to_string(),
                                });
                            }
                        }
                        _ => {
                            return Err(Error::new(
                                ErrorKind::BadCsr,
                                "CSR carries an unsupported SAN type",
                            ))
                        }
                    }
                }
            }
        }
    }

    // a DNS common name must also appear among the identifiers
    if let Some(cn) = csr
        .certification_request_info
        .subject
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
    {
        if !cn.is_empty() {
            let cn_id = Identifier {
                kind: IdentifierType::Dns,
                value: cn.to_ascii_lowercase(),
            };
            if !csr_names.contains(&cn_id) {
                csr_names.push(cn_id);
            }
        }
    }

    let csr_set = Order::canonicalize(csr_names);
    if csr_set != order.identifiers {
        return Err(Error::new(
            ErrorKind::BadCsr,
            format!(
                "CSR names do not match the order identifiers: {:?} != {:?}",
                csr_set
                    .iter()
                    .map(|i| i.value.as_str())
                    .collect::<Vec<_>>(),
                order
                    .identifiers
                    .iter()
                    .map(|i| i.value.as_str())
                    .collect::<Vec<_>>(),
            ),
        ));
    }

    Ok(order.identifiers.iter().map(|i| i.to_san()).collect())
}
