//! Certificate templates and issuance policy.
//!
//! Issuance renders a text template into a JSON [`Leaf`] document describing
//! the certificate to mint, then checks every requested identifier against
//! the provisioner's allow/deny policy before anything is signed.
//!
//! # Components
//!
//! - [`leaf`] - the rendered certificate document and its rcgen mapping
//! - [`template`] - the minijinja engine and its curated helper set
//! - [`policy`] - allow/deny evaluation over DNS, IP, email, URI, and
//!   principal identifiers

pub mod leaf;
pub mod policy;
pub mod template;

pub use leaf::{ExtKeyUsage, Extension, KeyUsage, Leaf, San, Subject};
pub use policy::{Policy, PolicyRules};
pub use template::{TemplateContext, TemplateEngine, DEFAULT_LEAF_TEMPLATE};

/// Errors from template rendering and policy evaluation.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The template failed to parse or render.
    #[error("template error: {0}")]
    Template(String),

    /// Rendering succeeded but the output is not a valid leaf document.
    #[error("invalid leaf document: {0}")]
    InvalidLeaf(String),

    /// A policy entry could not be parsed.
    #[error("invalid policy entry {entry:?}: {reason}")]
    InvalidPolicyEntry { entry: String, reason: String },

    /// An identifier was rejected by policy. The offending value is carried
    /// so callers can surface it verbatim.
    #[error("{kind} {value:?} is not allowed by policy")]
    Denied { kind: &'static str, value: String },

    /// A leaf field could not be mapped onto certificate parameters.
    #[error("certificate field error: {0}")]
    CertField(String),
}

/// Result type for template and policy operations.
pub type Result<T> = std::result::Result<T, Error>;
