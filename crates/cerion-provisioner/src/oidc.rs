//! OIDC provisioner: ID tokens from an upstream identity provider.
//!
//! Trust anchors come from one of three places, in order of preference:
//! statically configured JWKs, a statically configured JWKS endpoint, or
//! the provider's `.well-known/openid-configuration` discovery document.
//! The verifier is built lazily, at most once per provisioner instance, and
//! shared by every request.
//!
//! An optional transform template remaps provider-specific claims into a
//! canonical shape; claims the transform does not mention are preserved.

use crate::jose::{self, Expected, JwkSet, RemoteJwks};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use cerion_cert::{Policy, San};
use minijinja::UndefinedBehavior;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;

/// Kind-specific configuration for [`OidcProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OidcConfig {
    /// Issuer URL; also the base for discovery when no endpoint is given.
    pub issuer: String,
    /// OAuth client ID; ID tokens must be addressed to it.
    pub client_id: String,
    /// Statically configured keys. Skips all network fetches.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,
    /// Statically configured JWKS endpoint. Skips discovery.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_uri: Option<String>,
    /// Emails that may request certificates for arbitrary names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub admins: Vec<String>,
    /// Allowed email domains for non-admin subjects.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<String>,
    /// Required group membership (any listed group suffices).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
    /// Claim transform template rendering to a JSON object.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transform: Option<String>,
}

enum Verifier {
    Static(JwkSet),
    Remote(RemoteJwks),
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    issuer: String,
    jwks_uri: String,
}

/// A provisioner validating OIDC ID tokens.
pub struct OidcProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    config: OidcConfig,
    verifier: OnceCell<Verifier>,
    http: reqwest::Client,
}

impl OidcProvisioner {
    /// Builds the provisioner from its configuration.
    pub fn new(
        name: impl Into<String>,
        config: OidcConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        if config.issuer.is_empty() {
            return Err(Error::Config(format!("oidc provisioner {name}: issuer URL must not be empty")));
        }
        if config.client_id.is_empty() {
            return Err(Error::Config(format!("oidc provisioner {name}: client ID must not be empty")));
        }
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        Ok(Self {
            id: format!("{}/{}", Kind::Oidc, name),
            name,
            claims,
            options,
            policy,
            config,
            verifier: OnceCell::new(),
            http: reqwest::Client::new(),
        })
    }

    /// Builds (once) and returns the token verifier.
    async fn verifier(&self) -> Result<&Verifier> {
        self.verifier
            .get_or_try_init(|| async {
                if let Some(keys) = &self.config.jwks {
                    return Ok(Verifier::Static(keys.clone()));
                }
                let jwks_uri = match &self.config.jwks_uri {
                    Some(uri) => uri.clone(),
                    None => self.discover_jwks_uri().await?,
                };
                Ok(Verifier::Remote(RemoteJwks::new(jwks_uri, self.http.clone())))
            })
            .await
    }

    async fn discover_jwks_uri(&self) -> Result<String> {
        let url = format!(
            "{}/.well-known/openid-configuration",
            self.config.issuer.trim_end_matches('/')
        );
        tracing::debug!(provisioner = %self.name, %url, "fetching OIDC discovery document");
        let doc: DiscoveryDocument = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::Transient(format!("OIDC discovery: {e}")))?
            .error_for_status()
            .map_err(|e| Error::Transient(format!("OIDC discovery: {e}")))?
            .json()
            .await
            .map_err(|e| Error::Transient(format!("OIDC discovery decode: {e}")))?;
        if doc.issuer.trim_end_matches('/') != self.config.issuer.trim_end_matches('/') {
            return Err(Error::Unauthorized(format!(
                "discovery issuer {:?} does not match configured issuer {:?}",
                doc.issuer, self.config.issuer
            )));
        }
        Ok(doc.jwks_uri)
    }

    /// Verifies an ID token and returns its claims, untransformed.
    pub async fn verify_token(&self, token: &str) -> Result<serde_json::Value> {
        let header = jose::decode_header(token)?;
        let key = match self.verifier().await? {
            Verifier::Static(set) => set
                .find(header.kid.as_deref())
                .cloned()
                .ok_or_else(|| Error::Unauthorized(format!("unknown kid {:?}", header.kid)))?,
            Verifier::Remote(jwks) => jwks.get_key(header.kid.as_deref()).await?,
        };
        jose::verify_compact(
            token,
            &key,
            &Expected {
                issuer: Some(self.config.issuer.clone()),
                audience: Some(self.config.client_id.clone()),
                require_subject: true,
            },
        )
    }

    /// Applies the configured claim transform, preserving unmapped claims.
    pub fn transform_claims(&self, claims: &serde_json::Value) -> Result<serde_json::Value> {
        let Some(template) = &self.config.transform else {
            return Ok(claims.clone());
        };
        let mut env = minijinja::Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Lenient);
        let rendered = env
            .render_str(template, minijinja::Value::from_serialize(claims))
            .map_err(|e| Error::Config(format!("claim transform: {e}")))?;
        let mut map: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&rendered)
            .map_err(|e| Error::Config(format!("claim transform output: {e}")))?;
        if let Some(original) = claims.as_object() {
            for (key, value) in original {
                map.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        Ok(serde_json::Value::Object(map))
    }

    /// Assembles sign options carrying no token claims. Used by the Wire
    /// provisioner, whose proofs run through ACME challenges instead of a
    /// bearer token on the sign call.
    pub(crate) fn bare_sign_options(&self) -> SignOptions {
        SignOptions {
            template: self.options.template.clone(),
            template_data: self.options.template_data.clone(),
            token_claims: serde_json::Value::Null,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject: None,
            sans: None,
        }
    }

    fn is_admin(&self, email: &str) -> bool {
        self.config.admins.iter().any(|a| a == email)
    }

    fn check_groups(&self, claims: &serde_json::Value) -> Result<()> {
        if self.config.groups.is_empty() {
            return Ok(());
        }
        let member = claims
            .get("groups")
            .and_then(|v| v.as_array())
            .map(|groups| {
                groups
                    .iter()
                    .filter_map(|g| g.as_str())
                    .any(|g| self.config.groups.iter().any(|want| want == g))
            })
            .unwrap_or(false);
        if member {
            Ok(())
        } else {
            Err(Error::Unauthorized("subject is not in an allowed group".into()))
        }
    }
}

#[async_trait]
impl Provisioner for OidcProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Oidc
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        ctx: &AuthorizeContext<'_>,
        token: &str,
    ) -> Result<SignOptions> {
        let claims = self.verify_token(token).await?;

        let email = claims
            .get("email")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        let admin = !email.is_empty() && self.is_admin(&email);

        if !admin {
            if email.is_empty() {
                return Err(Error::Unauthorized("token carries no email claim".into()));
            }
            if !self.config.domains.is_empty() {
                let domain = email.rsplit_once('@').map(|(_, d)| d).unwrap_or("");
                if !self.config.domains.iter().any(|d| d.eq_ignore_ascii_case(domain)) {
                    return Err(Error::Unauthorized(format!(
                        "email domain {domain:?} is not allowed"
                    )));
                }
            }
        }
        self.check_groups(&claims)?;

        // ID tokens carry `nonce` from the auth flow; CLI-minted tokens a
        // `jti`. Either marks the token used.
        let exp = claims.get("exp").and_then(|v| v.as_i64()).unwrap_or(0);
        let once_id = claims
            .get("jti")
            .or_else(|| claims.get("nonce"))
            .and_then(|v| v.as_str());
        if let Some(id) = once_id {
            jose::consume_once(ctx.db, &self.id, id, exp).await?;
        }

        let transformed = self.transform_claims(&claims)?;
        let subject = if email.is_empty() {
            claims.get("sub").and_then(|v| v.as_str()).map(str::to_string)
        } else {
            Some(email.clone())
        };
        let sans = if admin {
            None
        } else {
            Some(vec![San::Email(email)])
        };

        Ok(SignOptions {
            template: self.options.template.clone(),
            template_data: self.options.template_data.clone(),
            token_claims: transformed,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject,
            sans,
        })
    }

    async fn authorize_revoke(
        &self,
        _ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(token) => self.verify_token(token).await.map(|_| ()),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}
