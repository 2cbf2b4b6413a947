//! Certificate template engine.
//!
//! Templates are minijinja text templates rendering to the JSON [`Leaf`]
//! document. The helper set is curated: encoding filters, time math, a
//! hostname sanitizer, OID validation, and a `fail` function that aborts
//! rendering with a message surfaced to the caller. Rendering is
//! deterministic for identical inputs (the `uuidv4` and `now` helpers are
//! the deliberate exceptions).

mod filters;

use crate::leaf::Leaf;
use crate::{Error, Result, San, Subject};
use minijinja::{Environment, UndefinedBehavior};
use serde::Serialize;

/// The leaf template used when a provisioner configures none.
pub const DEFAULT_LEAF_TEMPLATE: &str = r#"{
  "subject": {{ subject | tojson }},
  "sans": {{ sans | tojson }},
  "keyUsage": ["digitalSignature"],
  "extKeyUsage": ["serverAuth", "clientAuth"]
}"#;

/// Inputs available to a certificate template.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TemplateContext {
    /// Subject carried over from the CSR.
    pub subject: Subject,
    /// Requested SANs, already canonicalized.
    pub sans: Vec<San>,
    /// Validated token claims from the provisioner.
    pub token: serde_json::Value,
    /// Provisioner-configured template data.
    pub data: serde_json::Map<String, serde_json::Value>,
    /// CSR details (public key algorithm, raw subject, requested extensions).
    pub csr: serde_json::Value,
}

impl TemplateContext {
    /// Creates a context for the given request subject and SANs.
    pub fn new(subject: Subject, sans: Vec<San>) -> Self {
        Self {
            subject,
            sans,
            ..Default::default()
        }
    }

    /// Attaches validated token claims.
    pub fn with_token(mut self, claims: serde_json::Value) -> Self {
        self.token = claims;
        self
    }

    /// Attaches provisioner template data.
    pub fn with_data(mut self, data: serde_json::Map<String, serde_json::Value>) -> Self {
        self.data = data;
        self
    }

    /// Attaches CSR details.
    pub fn with_csr(mut self, csr: serde_json::Value) -> Self {
        self.csr = csr;
        self
    }
}

/// The shared template environment.
pub struct TemplateEngine {
    env: Environment<'static>,
}

impl TemplateEngine {
    /// Creates an engine with the curated helper set registered.
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_filter("b64enc", filters::b64enc);
        env.add_filter("b64dec", filters::b64dec);
        env.add_filter("b64urlenc", filters::b64urlenc);
        env.add_filter("b64urldec", filters::b64urldec);
        env.add_filter("hexenc", filters::hexenc);
        env.add_filter("hexdec", filters::hexdec);
        env.add_filter("sanitize_host", filters::sanitize_host);

        env.add_function("uuidv4", filters::uuidv4);
        env.add_function("now", filters::now_rfc3339);
        env.add_function("time_add", filters::time_add);
        env.add_function("oid", filters::oid);
        env.add_function("fail", filters::fail);

        Self { env }
    }

    /// Renders a template string with the given context.
    pub fn render(&self, template: &str, ctx: &TemplateContext) -> Result<String> {
        self.env
            .render_str(template, minijinja::Value::from_serialize(ctx))
            .map_err(|e| Error::Template(template_error_chain(&e)))
    }

    /// Renders a leaf document, falling back to [`DEFAULT_LEAF_TEMPLATE`].
    pub fn render_leaf(&self, template: Option<&str>, ctx: &TemplateContext) -> Result<Leaf> {
        let rendered = self.render(template.unwrap_or(DEFAULT_LEAF_TEMPLATE), ctx)?;
        Leaf::parse(&rendered)
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

// minijinja buries the interesting message (e.g. from `fail`) in the error
// source chain; flatten it so callers see the user-visible cause.
fn template_error_chain(err: &minijinja::Error) -> String {
    let mut msg = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> TemplateContext {
        TemplateContext::new(
            Subject {
                common_name: "dev-1".into(),
                ..Default::default()
            },
            vec![San::Dns("dev-1.example.com".into())],
        )
    }

    #[test]
    fn default_template_renders_leaf() {
        let engine = TemplateEngine::new();
        let leaf = engine.render_leaf(None, &ctx()).unwrap();
        assert_eq!(leaf.subject.common_name, "dev-1");
        assert_eq!(leaf.sans, vec![San::Dns("dev-1.example.com".into())]);
        assert_eq!(leaf.ext_key_usage.len(), 2);
    }

    #[test]
    fn rendering_is_deterministic() {
        let engine = TemplateEngine::new();
        let ctx = ctx();
        let a = engine.render(DEFAULT_LEAF_TEMPLATE, &ctx).unwrap();
        let b = engine.render(DEFAULT_LEAF_TEMPLATE, &ctx).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn token_claims_are_reachable() {
        let engine = TemplateEngine::new();
        let ctx = ctx().with_token(serde_json::json!({"email": "ops@example.com"}));
        let out = engine
            .render(r#"{"subject": {"commonName": {{ token.email | tojson }}}, "sans": []}"#, &ctx)
            .unwrap();
        let leaf = Leaf::parse(&out).unwrap();
        assert_eq!(leaf.subject.common_name, "ops@example.com");
    }

    #[test]
    fn undefined_variable_is_an_error() {
        let engine = TemplateEngine::new();
        assert!(engine.render("{{ nope }}", &ctx()).is_err());
    }

    #[test]
    fn fail_aborts_with_message() {
        let engine = TemplateEngine::new();
        let err = engine
            .render(r#"{{ fail("subject is required") }}"#, &ctx())
            .unwrap_err();
        assert!(err.to_string().contains("subject is required"), "{err}");
    }

    #[test]
    fn encoding_filters() {
        let engine = TemplateEngine::new();
        assert_eq!(
            engine.render(r#"{{ "hello" | b64enc }}"#, &ctx()).unwrap(),
            "aGVsbG8="
        );
        assert_eq!(
            engine.render(r#"{{ "aGVsbG8=" | b64dec }}"#, &ctx()).unwrap(),
            "hello"
        );
        assert_eq!(
            engine.render(r#"{{ "hello" | b64urlenc }}"#, &ctx()).unwrap(),
            "aGVsbG8"
        );
        assert_eq!(
            engine.render(r#"{{ "hello" | hexenc }}"#, &ctx()).unwrap(),
            "68656c6c6f"
        );
        assert_eq!(
            engine.render(r#"{{ "68656c6c6f" | hexdec }}"#, &ctx()).unwrap(),
            "hello"
        );
    }

    #[test]
    fn hostname_filter_and_oid_function() {
        let engine = TemplateEngine::new();
        assert_eq!(
            engine
                .render(r#"{{ "Svc.Example.COM." | sanitize_host }}"#, &ctx())
                .unwrap(),
            "svc.example.com"
        );
        assert_eq!(
            engine
                .render(r#"{{ oid("1.3.6.1.5.5.7.1.31") }}"#, &ctx())
                .unwrap(),
            "1.3.6.1.5.5.7.1.31"
        );
        assert!(engine.render(r#"{{ oid("bogus") }}"#, &ctx()).is_err());
    }

    #[test]
    fn time_add_shifts_rfc3339() {
        let engine = TemplateEngine::new();
        let out = engine
            .render(r#"{{ time_add("2026-01-01T00:00:00Z", 3600) }}"#, &ctx())
            .unwrap();
        assert_eq!(out, "2026-01-01T01:00:00+00:00");
    }
}
