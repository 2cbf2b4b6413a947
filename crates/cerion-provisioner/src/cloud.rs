//! Cloud instance-identity provisioners: AWS, GCP, Azure.
//!
//! Each platform hands its VMs a signed identity document; the provisioner
//! verifies the platform signature and freshness, checks the configured
//! account/project/tenant allowlists, and threads the instance metadata
//! into template data. By default an instance can enroll once (trust on
//! first use); re-enrollment requires `disableTrustOnFirstUse`.

use crate::jose::{self, Expected, JwkSet, RemoteJwks};
use crate::{
    AuthorizeContext, Claims, Error, Kind, Options, Provisioner, Result, RevokeProof, SignOptions,
};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use cerion_cert::{Policy, San};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rsa::pkcs1v15::{Signature as RsaSignature, VerifyingKey};
use rsa::signature::Verifier as _;
use rsa::{BigUint, RsaPublicKey};
use serde::{Deserialize, Serialize};
use x509_parser::prelude::FromDer;

const GCP_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GCP_ISSUER: &str = "https://accounts.google.com";
const AZURE_JWKS_URL: &str = "https://login.microsoftonline.com/common/discovery/keys";

/// Marks an instance identity as used (trust on first use).
async fn tofu(db: &dyn cerion_db::Db, scope: &str, instance: &str) -> Result<()> {
    // Far-future expiry: the slot is never reclaimed.
    let expires_at = (Utc::now() + ChronoDuration::days(365 * 50)).timestamp();
    jose::consume_once(db, scope, instance, expires_at)
        .await
        .map_err(|e| match e {
            Error::Unauthorized(_) => Error::Unauthorized(format!(
                "instance {instance} has already enrolled (trust on first use)"
            )),
            other => other,
        })
}

// ───────────────────────────── AWS ─────────────────────────────

/// Kind-specific configuration for [`AwsProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AwsConfig {
    /// Allowed AWS account IDs. Empty allows any account.
    pub accounts: Vec<String>,
    /// PEM certificate AWS signs instance-identity documents with for the
    /// deployment's regions.
    pub signing_certificate: String,
    /// Maximum age of the document's `pendingTime` in seconds.
    pub max_age_secs: Option<u64>,
    /// Permit CSR SANs beyond the instance defaults.
    pub disable_custom_sans: bool,
    /// Permit re-enrollment of an instance.
    pub disable_trust_on_first_use: bool,
}

/// The identity proof an AWS instance presents: the raw document plus its
/// RSA-SHA256 signature, both base64.
#[derive(Debug, Deserialize)]
struct AwsIdentityProof {
    document: String,
    signature: String,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct AwsIdentityDocument {
    instance_id: String,
    account_id: String,
    region: String,
    private_ip: String,
    pending_time: DateTime<Utc>,
    #[serde(default)]
    image_id: Option<String>,
}

pub struct AwsProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    config: AwsConfig,
    verifying_key: VerifyingKey<sha2::Sha256>,
}

impl AwsProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: AwsConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        let verifying_key = rsa_key_from_pem(&config.signing_certificate)
            .map_err(|e| Error::Config(format!("aws provisioner {name}: {e}")))?;
        Ok(Self {
            id: format!("{}/{}", Kind::Aws, name),
            name,
            claims,
            options,
            policy,
            config,
            verifying_key,
        })
    }

    fn verify_document(&self, token: &str) -> Result<AwsIdentityDocument> {
        let proof: AwsIdentityProof = serde_json::from_str(token)
            .map_err(|e| Error::Malformed(format!("identity proof: {e}")))?;
        let document = STANDARD
            .decode(proof.document.as_bytes())
            .map_err(|e| Error::Malformed(format!("identity document: {e}")))?;
        let signature = STANDARD
            .decode(proof.signature.as_bytes())
            .map_err(|e| Error::Malformed(format!("identity signature: {e}")))?;
        let signature = RsaSignature::try_from(signature.as_slice())
            .map_err(|e| Error::Malformed(format!("identity signature: {e}")))?;
        self.verifying_key
            .verify(&document, &signature)
            .map_err(|_| Error::Unauthorized("identity document signature is invalid".into()))?;

        let doc: AwsIdentityDocument = serde_json::from_slice(&document)
            .map_err(|e| Error::Malformed(format!("identity document: {e}")))?;

        let max_age = ChronoDuration::seconds(self.config.max_age_secs.unwrap_or(300) as i64);
        if doc.pending_time + max_age < Utc::now() {
            return Err(Error::Unauthorized(format!(
                "identity document for {} is too old",
                doc.instance_id
            )));
        }
        if !self.config.accounts.is_empty() && !self.config.accounts.contains(&doc.account_id) {
            return Err(Error::Unauthorized(format!(
                "account {} is not allowed",
                doc.account_id
            )));
        }
        Ok(doc)
    }

    fn default_sans(doc: &AwsIdentityDocument) -> Vec<San> {
        let mut sans = vec![San::Dns(format!(
            "{}.{}.compute.internal",
            doc.instance_id, doc.region
        ))];
        if let Ok(ip) = doc.private_ip.parse() {
            sans.push(San::Ip(ip));
        }
        sans
    }
}

#[async_trait]
impl Provisioner for AwsProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Aws
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        ctx: &AuthorizeContext<'_>,
        token: &str,
    ) -> Result<SignOptions> {
        let doc = self.verify_document(token)?;
        if !self.config.disable_trust_on_first_use {
            tofu(ctx.db, &self.id, &doc.instance_id).await?;
        }

        let sans = if self.config.disable_custom_sans {
            Some(Self::default_sans(&doc))
        } else {
            None
        };
        let mut template_data = self.options.template_data.clone();
        template_data.insert(
            "aws".into(),
            serde_json::to_value(&doc).map_err(|e| Error::Malformed(e.to_string()))?,
        );

        Ok(SignOptions {
            template: self.options.template.clone(),
            template_data,
            token_claims: serde_json::json!({ "sub": doc.instance_id }),
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject: Some(doc.instance_id),
            sans,
        })
    }

    async fn authorize_revoke(
        &self,
        _ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(token) => self.verify_document(token).map(|_| ()),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}

/// Extracts the RSA public key from a PEM certificate.
fn rsa_key_from_pem(pem: &str) -> std::result::Result<VerifyingKey<sha2::Sha256>, String> {
    let der = pem
        .lines()
        .filter(|l| !l.starts_with("-----"))
        .collect::<String>();
    let der = STANDARD
        .decode(der.as_bytes())
        .map_err(|e| format!("invalid PEM: {e}"))?;
    let (_, cert) = x509_parser::certificate::X509Certificate::from_der(&der)
        .map_err(|e| format!("invalid certificate: {e}"))?;
    let jwk = jose::jwk_from_spki(cert.public_key()).map_err(|e| e.to_string())?;
    if jwk.kty != "RSA" {
        return Err("signing certificate does not hold an RSA key".into());
    }
    let decode = |b64: &str| {
        base64::engine::general_purpose::URL_SAFE_NO_PAD
            .decode(b64.as_bytes())
            .map_err(|e| format!("invalid key component: {e}"))
    };
    let n = BigUint::from_bytes_be(&decode(jwk.n.as_deref().unwrap_or_default())?);
    let e = BigUint::from_bytes_be(&decode(jwk.e.as_deref().unwrap_or_default())?);
    let key = RsaPublicKey::new(n, e).map_err(|e| format!("invalid RSA key: {e}"))?;
    Ok(VerifyingKey::new(key))
}

// ───────────────────────────── GCP ─────────────────────────────

/// Kind-specific configuration for [`GcpProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GcpConfig {
    /// Allowed GCP project IDs. Empty allows any project.
    pub project_ids: Vec<String>,
    /// Allowed service-account emails. Empty allows any.
    pub service_accounts: Vec<String>,
    /// Static keys (testing); otherwise Google's JWKS endpoint is used.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,
    pub disable_custom_sans: bool,
    pub disable_trust_on_first_use: bool,
}

#[derive(Debug, Deserialize, Serialize)]
struct GcpComputeEngine {
    project_id: String,
    instance_id: String,
    instance_name: String,
    zone: String,
}

pub struct GcpProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    config: GcpConfig,
    jwks: Option<RemoteJwks>,
}

impl GcpProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: GcpConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        let jwks = if config.jwks.is_none() {
            Some(RemoteJwks::new(GCP_JWKS_URL.into(), reqwest::Client::new()))
        } else {
            None
        };
        Ok(Self {
            id: format!("{}/{}", Kind::Gcp, name),
            name,
            claims,
            options,
            policy,
            config,
            jwks,
        })
    }

    async fn verify(&self, ctx: &AuthorizeContext<'_>, token: &str) -> Result<serde_json::Value> {
        let header = jose::decode_header(token)?;
        let key = match (&self.config.jwks, &self.jwks) {
            (Some(set), _) => set
                .find(header.kid.as_deref())
                .cloned()
                .ok_or_else(|| Error::Unauthorized(format!("unknown kid {:?}", header.kid)))?,
            (None, Some(remote)) => remote.get_key(header.kid.as_deref()).await?,
            (None, None) => unreachable!("constructor always sets one source"),
        };
        jose::verify_compact(
            token,
            &key,
            &Expected {
                issuer: Some(GCP_ISSUER.to_string()),
                audience: Some(ctx.audience.to_string()),
                require_subject: true,
            },
        )
    }
}

#[async_trait]
impl Provisioner for GcpProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Gcp
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        ctx: &AuthorizeContext<'_>,
        token: &str,
    ) -> Result<SignOptions> {
        let claims = self.verify(ctx, token).await?;

        let ce: GcpComputeEngine = serde_json::from_value(
            claims
                .pointer("/google/compute_engine")
                .cloned()
                .ok_or_else(|| {
                    Error::Unauthorized("token carries no compute_engine claims".into())
                })?,
        )
        .map_err(|e| Error::Malformed(format!("compute_engine claims: {e}")))?;

        if !self.config.project_ids.is_empty()
            && !self.config.project_ids.contains(&ce.project_id)
        {
            return Err(Error::Unauthorized(format!(
                "project {} is not allowed",
                ce.project_id
            )));
        }
        if !self.config.service_accounts.is_empty() {
            let email = claims.get("email").and_then(|v| v.as_str()).unwrap_or("");
            if !self.config.service_accounts.iter().any(|sa| sa == email) {
                return Err(Error::Unauthorized(format!(
                    "service account {email:?} is not allowed"
                )));
            }
        }
        if !self.config.disable_trust_on_first_use {
            tofu(ctx.db, &self.id, &ce.instance_id).await?;
        }

        let sans = if self.config.disable_custom_sans {
            Some(vec![San::Dns(format!(
                "{}.c.{}.internal",
                ce.instance_name, ce.project_id
            ))])
        } else {
            None
        };
        let subject = Some(ce.instance_name.clone());
        let mut template_data = self.options.template_data.clone();
        template_data.insert(
            "gcp".into(),
            serde_json::to_value(&ce).map_err(|e| Error::Malformed(e.to_string()))?,
        );

        Ok(SignOptions {
            template: self.options.template.clone(),
            template_data,
            token_claims: claims,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject,
            sans,
        })
    }

    async fn authorize_revoke(
        &self,
        ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(token) => self.verify(ctx, token).await.map(|_| ()),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}

// ──────────────────────────── Azure ────────────────────────────

/// Kind-specific configuration for [`AzureProvisioner`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AzureConfig {
    /// The Azure AD tenant VMs must belong to.
    pub tenant_id: String,
    /// Allowed resource groups. Empty allows any.
    pub resource_groups: Vec<String>,
    /// Expected token audience (the value VMs request from IMDS).
    pub audience: String,
    /// Static keys (testing); otherwise the Microsoft JWKS endpoint.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks: Option<JwkSet>,
    pub disable_custom_sans: bool,
    pub disable_trust_on_first_use: bool,
}

pub struct AzureProvisioner {
    id: String,
    name: String,
    claims: Claims,
    options: Options,
    policy: Policy,
    config: AzureConfig,
    jwks: Option<RemoteJwks>,
}

impl AzureProvisioner {
    pub fn new(
        name: impl Into<String>,
        config: AzureConfig,
        claims: Claims,
        options: Options,
    ) -> Result<Self> {
        let name = name.into();
        if config.tenant_id.is_empty() {
            return Err(Error::Config(format!("azure provisioner {name}: tenant ID must not be empty")));
        }
        claims.validate().map_err(Error::Config)?;
        let policy = options.policy()?;
        let jwks = if config.jwks.is_none() {
            Some(RemoteJwks::new(AZURE_JWKS_URL.into(), reqwest::Client::new()))
        } else {
            None
        };
        Ok(Self {
            id: format!("{}/{}", Kind::Azure, name),
            name,
            claims,
            options,
            policy,
            config,
            jwks,
        })
    }

    async fn verify(&self, token: &str) -> Result<serde_json::Value> {
        let header = jose::decode_header(token)?;
        let key = match (&self.config.jwks, &self.jwks) {
            (Some(set), _) => set
                .find(header.kid.as_deref())
                .cloned()
                .ok_or_else(|| Error::Unauthorized(format!("unknown kid {:?}", header.kid)))?,
            (None, Some(remote)) => remote.get_key(header.kid.as_deref()).await?,
            (None, None) => unreachable!("constructor always sets one source"),
        };
        jose::verify_compact(
            token,
            &key,
            &Expected {
                issuer: Some(format!("https://sts.windows.net/{}/", self.config.tenant_id)),
                audience: Some(self.config.audience.clone()),
                require_subject: true,
            },
        )
    }

    /// Parses `xms_mirid`:
    /// `/subscriptions/<id>/resourceGroups/<group>/providers/Microsoft.Compute/virtualMachines/<name>`.
    fn parse_mirid(mirid: &str) -> Result<(String, String)> {
        let parts: Vec<&str> = mirid.split('/').collect();
        let group = parts
            .iter()
            .position(|p| p.eq_ignore_ascii_case("resourceGroups"))
            .and_then(|i| parts.get(i + 1));
        let name = parts
            .iter()
            .position(|p| p.eq_ignore_ascii_case("virtualMachines"))
            .and_then(|i| parts.get(i + 1));
        match (group, name) {
            (Some(group), Some(name)) if !group.is_empty() && !name.is_empty() => {
                Ok((group.to_string(), name.to_string()))
            }
            _ => Err(Error::Malformed(format!("unexpected xms_mirid {mirid:?}"))),
        }
    }
}

#[async_trait]
impl Provisioner for AzureProvisioner {
    fn id(&self) -> &str {
        &self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> Kind {
        Kind::Azure
    }

    fn claims(&self) -> &Claims {
        &self.claims
    }

    async fn authorize_sign(
        &self,
        ctx: &AuthorizeContext<'_>,
        token: &str,
    ) -> Result<SignOptions> {
        let claims = self.verify(token).await?;

        let mirid = claims
            .get("xms_mirid")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Unauthorized("token carries no xms_mirid claim".into()))?;
        let (group, vm_name) = Self::parse_mirid(mirid)?;
        if !self.config.resource_groups.is_empty()
            && !self
                .config
                .resource_groups
                .iter()
                .any(|g| g.eq_ignore_ascii_case(&group))
        {
            return Err(Error::Unauthorized(format!(
                "resource group {group:?} is not allowed"
            )));
        }
        if !self.config.disable_trust_on_first_use {
            tofu(ctx.db, &self.id, mirid).await?;
        }

        let sans = if self.config.disable_custom_sans {
            Some(vec![San::Dns(vm_name.clone())])
        } else {
            None
        };
        let mut template_data = self.options.template_data.clone();
        template_data.insert(
            "azure".into(),
            serde_json::json!({ "resourceGroup": group, "virtualMachine": vm_name }),
        );

        Ok(SignOptions {
            template: self.options.template.clone(),
            template_data,
            token_claims: claims,
            policy: self.policy.clone(),
            claims: self.claims.clone(),
            subject: Some(vm_name),
            sans,
        })
    }

    async fn authorize_revoke(
        &self,
        _ctx: &AuthorizeContext<'_>,
        proof: &RevokeProof<'_>,
    ) -> Result<()> {
        match proof {
            RevokeProof::Token(token) => self.verify(token).await.map(|_| ()),
            RevokeProof::CertificateKey => Ok(()),
        }
    }
}
