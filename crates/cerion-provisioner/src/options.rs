//! Template and policy options shared by every provisioner kind.

use crate::Result;
use cerion_cert::{Policy, PolicyRules};
use serde::{Deserialize, Serialize};

/// Configured issuance options.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Options {
    /// Leaf template text; `None` selects the default template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Static data exposed to the template as `data`.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub template_data: serde_json::Map<String, serde_json::Value>,
    /// Identifier allow list.
    #[serde(skip_serializing_if = "is_default_rules")]
    pub allow: PolicyRules,
    /// Identifier deny list, checked first.
    #[serde(skip_serializing_if = "is_default_rules")]
    pub deny: PolicyRules,
}

fn is_default_rules(rules: &PolicyRules) -> bool {
    *rules == PolicyRules::default()
}

impl Options {
    /// Compiles the configured allow/deny lists.
    pub fn policy(&self) -> Result<Policy> {
        Ok(Policy::new(self.allow.clone(), self.deny.clone())?)
    }
}
