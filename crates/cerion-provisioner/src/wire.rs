//! Wire provisioner: messenger client identities over OIDC and DPoP.
//!
//! Wire clients are addressed as `wireapp://<user>!<device>@<domain>`; the
//! `!` separates the user ID from the device ID inside the URI userinfo.
//! The provisioner parses those identities and validates the two Wire ACME
//! challenge proofs: an OIDC ID token (`wire-oidc-01`) and a DPoP access
//! token minted by wire-server (`wire-dpop-01`).

use crate::jose::{self, Expected, Jwk};
use crate::oidc::{OidcConfig, OidcProvisioner};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A parsed Wire client identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientId {
    pub username: String,
    pub device_id: String,
    pub domain: String,
}

impl ClientId {
    /// Parses a Wire client ID of the form
    /// `wireapp://CzbfFjDOQrenCbDxVmgnFw!594930e9d50bb175@wire.com`.
    pub fn parse(client_id: &str) -> Result<Self> {
        let uri = url::Url::parse(client_id)
            .map_err(|e| Error::Malformed(format!("invalid Wire client ID URI {client_id:?}: {e}")))?;
        if uri.scheme() != "wireapp" {
            return Err(Error::Malformed(format!(
                "invalid Wire client ID scheme {:?}; expected \"wireapp\"",
                uri.scheme()
            )));
        }
        let full_username = uri.username();
        let (username, device_id) = full_username.split_once('!').ok_or_else(|| {
            Error::Malformed(format!("invalid Wire client ID username {full_username:?}"))
        })?;
        if username.is_empty() || device_id.is_empty() {
            return Err(Error::Malformed(format!(
                "invalid Wire client ID username {full_username:?}"
            )));
        }
        let domain = uri
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::Malformed(format!("Wire client ID {client_id:?} has no domain")))?;
        Ok(Self {
            username: username.to_string(),
            device_id: device_id.to_string(),
            domain: domain.to_string(),
        })
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "wireapp://{}!{}@{}",
            self.username, self.device_id, self.domain
        )
    }
}

impl std::str::FromStr for ClientId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A Wire user identity, as serialized inside challenge payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserId {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub handle: String,
}

/// A Wire device identity, as serialized inside challenge payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceId {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
    #[serde(default, rename = "client-id", skip_serializing_if = "String::is_empty")]
    pub client_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub handle: String,
}

/// DPoP validation settings: the Ed25519 key wire-server signs access
/// tokens with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DpopConfig {
    /// Base64url raw Ed25519 public key.
    pub signing_key: String,
}

/// Kind-specific configuration for [`WireProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WireConfig {
    pub oidc: OidcConfig,
    pub dpop: DpopConfig,
}

pub struct WireProvisioner {
    id: String,
    name: String,
    /// Inner OIDC machinery reused for the wire-oidc-01 proof.
    oidc: OidcProvisioner,
    dpop_key: Jwk,
}

impl WireProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: WireConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        if config.dpop.signing_key.is_empty() {
            return Err(Error::Config(format!(
                "wire provisioner {name}: dpop signing key must not be empty"
            )));
        }
        let dpop_key = Jwk {
            kty: "OKP".into(),
            crv: Some("Ed25519".into()),
            x: Some(config.dpop.signing_key.clone()),
            ..Default::default()
        };
        let oidc = OidcProvisioner::new(name.clone(), config.oidc, claims, options)?;
        Ok(Self {
            id: format!("{}/{}", Kind::Wire, name),
            name,
            oidc,
            dpop_key,
        })
    }

    /// Validates a `wire-oidc-01` ID token: signature and standard claims
    /// through the inner OIDC verifier, then the Wire identity claims after
    /// the configured transform.
    pub async fn verify_oidc_proof(
        &self,
        id_token: &str,
        expected: &ClientId,
    ) -> Result<serde_json::Value> {
        let claims = self.oidc.verify_token(id_token).await?;
        let claims = self.oidc.transform_claims(&claims)?;

        let name = claims.get("name").and_then(|v| v.as_str()).unwrap_or("");
        let handle = claims
            .get("preferred_username")
            .and_then(|v| v.as_str())
            .unwrap_or("");
        if name.is_empty() || handle.is_empty() {
            return Err(Error::Unauthorized(
                "wire ID token is missing name or preferred_username".into(),
            ));
        }
        let expected_handle = format!("wireapp://%40{}@{}", expected.username, expected.domain);
        let plain_handle = format!("wireapp://@{}@{}", expected.username, expected.domain);
        if handle != expected_handle && handle != plain_handle {
            return Err(Error::Unauthorized(format!(
                "handle {handle:?} does not match the order's client ID"
            )));
        }
        Ok(claims)
    }

    /// Validates a `wire-dpop-01` access token signed by wire-server:
    /// EdDSA signature, `chal` binding to the challenge token, and `sub`
    /// binding to the order's client ID.
    pub fn verify_dpop_proof(
        &self,
        access_token: &str,
        expected: &ClientId,
        challenge_token: &str,
    ) -> Result<serde_json::Value> {
        let claims = jose::verify_compact(
            access_token,
            &self.dpop_key,
            &Expected {
                issuer: None,
                audience: None,
                require_subject: true,
            },
        )?;
        let chal = claims.get("chal").and_then(|v| v.as_str()).unwrap_or("");
        if chal != challenge_token {
            return Err(Error::Unauthorized(
                "access token is not bound to this challenge".into(),
            ));
        }
        let sub = claims.get("sub").and_then(|v| v.as_str()).unwrap_or("");
        let sub_id = ClientId::parse(sub)?;
        if sub_id != *expected {
            return Err(Error::Unauthorized(format!(
                "access token subject {sub:?} does not match the order's client ID"
            )));
        }
        Ok(claims)
    }
}

#[async_trait]
impl Provisioner for WireProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Wire
    }

    fn claims(&self) -> &Claims {
        self.oidc.claims()
    }

    async fn authorize_sign(
        &self,
        _ctx: &AuthorizeContext<'_>,
        order_ref: &str,
    ) -> Result<SignOptions> {
        // Like ACME: the challenge proofs carry the authorization, the
        // finalize path only needs the issuance options.
        tracing::debug!(provisioner = %self.name, order = order_ref, "assembling Wire sign options");
        Ok(self.oidc.bare_sign_options())
    }

    async fn authorize_revoke(
        &self,
        _ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(_) | RevokeProof::CertificateKey => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::JwkSet;
    use crate::testutil::{base_claims, TestKey};
    use proptest::prelude::*;

    #[test]
    fn parse_client_id() {
        let id = ClientId::parse("wireapp://CzbfFjDOQrenCbDxVmgnFw!594930e9d50bb175@wire.com")
            .unwrap();
        assert_eq!(id.username, "CzbfFjDOQrenCbDxVmgnFw");
        assert_eq!(id.device_id, "594930e9d50bb175");
        assert_eq!(id.domain, "wire.com");
    }

    #[test]
    fn parse_rejects_malformed_ids() {
        // wrong scheme
        assert!(ClientId::parse("https://u!d@wire.com").is_err());
        // no separator
        assert!(ClientId::parse("wireapp://userdevice@wire.com").is_err());
        // missing domain
        assert!(ClientId::parse("wireapp://u!d").is_err());
        // empty parts
        assert!(ClientId::parse("wireapp://!d@wire.com").is_err());
        assert!(ClientId::parse("wireapp://u!@wire.com").is_err());
    }

    #[test]
    fn format_roundtrip() {
        let input = "wireapp://u1!dev1@wire.example.com";
        let id = ClientId::parse(input).unwrap();
        assert_eq!(id.to_string(), input);
        let again = ClientId::parse(&id.to_string()).unwrap();
        assert_eq!(again, id);
    }

    proptest! {
        #[test]
        fn parse_format_roundtrip(
            user in "[A-Za-z0-9_-]{1,24}",
            device in "[a-f0-9]{1,16}",
            domain in "[a-z0-9]{1,12}(\\.[a-z0-9]{1,12}){0,3}",
        ) {
            let input = format!("wireapp://{user}!{device}@{domain}");
            let id = ClientId::parse(&input).unwrap();
            prop_assert_eq!(id.to_string(), input);
        }
    }

    #[test]
    fn user_and_device_id_json() {
        let user: UserId =
            serde_json::from_str(r#"{"name":"Alice","domain":"wire.com","handle":"@alice"}"#)
                .unwrap();
        assert_eq!(user.name, "Alice");
        let device: DeviceId = serde_json::from_str(
            r#"{"name":"laptop","client-id":"wireapp://u!d@wire.com","domain":"wire.com"}"#,
        )
        .unwrap();
        assert_eq!(device.client_id, "wireapp://u!d@wire.com");
    }

    fn wire_provisioner(oidc_key: &TestKey, dpop_key: &TestKey) -> WireProvisioner {
        WireProvisioner::new(
            "wire",
            WireConfig {
                oidc: OidcConfig {
                    issuer: "https://idp.wire.example.com".into(),
                    client_id: "wireapp".into(),
                    jwks: Some(JwkSet {
                        keys: vec![oidc_key.jwk.clone()],
                    }),
                    transform: Some(
                        r#"{"name": "{{ display_name }}", "preferred_username": "{{ handle }}"}"#
                            .into(),
                    ),
                    ..Default::default()
                },
                dpop: DpopConfig {
                    signing_key: dpop_key.jwk.x.clone().unwrap(),
                },
            },
            Claims::default(),
            Options::default(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn oidc_proof_cross_checks_handle() {
        let oidc_key = TestKey::generate_p256(Some("wire-idp"));
        let dpop_key = TestKey::generate_ed25519(None);
        let p = wire_provisioner(&oidc_key, &dpop_key);
        let client = ClientId::parse("wireapp://u1!dev1@wire.com").unwrap();

        let mut claims = base_claims("https://idp.wire.example.com", "wireapp", "u1");
        claims["display_name"] = serde_json::json!("Alice");
        claims["handle"] = serde_json::json!("wireapp://%40u1@wire.com");
        let token = oidc_key.sign_claims(&claims);
        let out = p.verify_oidc_proof(&token, &client).await.unwrap();
        assert_eq!(out["name"], "Alice");

        // wrong handle
        let mut claims = base_claims("https://idp.wire.example.com", "wireapp", "u1");
        claims["display_name"] = serde_json::json!("Mallory");
        claims["handle"] = serde_json::json!("wireapp://%40mallory@wire.com");
        let token = oidc_key.sign_claims(&claims);
        assert!(p.verify_oidc_proof(&token, &client).await.is_err());
    }

    #[test]
    fn dpop_proof_binds_challenge_and_subject() {
        let oidc_key = TestKey::generate_p256(Some("wire-idp"));
        let dpop_key = TestKey::generate_ed25519(None);
        let p = wire_provisioner(&oidc_key, &dpop_key);
        let client = ClientId::parse("wireapp://u1!dev1@wire.com").unwrap();

        let mut claims = base_claims("wire-server", "", "wireapp://u1!dev1@wire.com");
        claims.as_object_mut().unwrap().remove("aud");
        claims["chal"] = serde_json::json!("tok-123");
        let access = dpop_key.sign_claims(&claims);

        p.verify_dpop_proof(&access, &client, "tok-123").unwrap();
        assert!(p.verify_dpop_proof(&access, &client, "tok-999").is_err());

        let other = ClientId::parse("wireapp://u2!dev9@wire.com").unwrap();
        assert!(p.verify_dpop_proof(&access, &other, "tok-123").is_err());

        // signed by the wrong key
        let rogue = TestKey::generate_ed25519(None);
        let access = rogue.sign_claims(&claims);
        assert!(p.verify_dpop_proof(&access, &client, "tok-123").is_err());
    }
}
