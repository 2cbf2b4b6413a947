//! Per-provisioner issuance policy.
//!
//! Policy is a pair of rule sets. Deny rules are evaluated first and any
//! match rejects; then, for each identifier kind with a non-empty allow
//! list, the value must match at least one entry. An empty allow list
//! permits every value of that kind. Every SAN must individually pass.
//!
//! Wildcard semantics: a leading `*.` matches exactly one DNS label.

use crate::leaf::San;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Configured rule lists, as they appear in provisioner options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PolicyRules {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dns: Vec<String>,
    /// IP addresses or CIDR blocks.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ip: Vec<String>,
    /// `user@domain` entries; an empty local part (`@domain`) matches any
    /// user, and the domain side takes DNS wildcards.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub email: Vec<String>,
    /// Host patterns matched against the URI authority.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub uri: Vec<String>,
    /// SSH principal names, matched exactly.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub principal: Vec<String>,
}

impl PolicyRules {
    fn is_empty(&self) -> bool {
        self.dns.is_empty()
            && self.ip.is_empty()
            && self.email.is_empty()
            && self.uri.is_empty()
            && self.principal.is_empty()
    }
}

/// A compiled allow/deny policy.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    allow: Compiled,
    deny: Compiled,
}

#[derive(Debug, Clone, Default)]
struct Compiled {
    dns: Vec<DnsRule>,
    ip: Vec<CidrRule>,
    email: Vec<EmailRule>,
    uri: Vec<DnsRule>,
    principal: Vec<String>,
}

#[derive(Debug, Clone)]
enum DnsRule {
    Exact(String),
    /// Matches `<one-label>.<base>`.
    Wildcard(String),
}

#[derive(Debug, Clone)]
struct CidrRule {
    net: IpAddr,
    prefix: u8,
}

#[derive(Debug, Clone)]
struct EmailRule {
    /// Empty matches any local part.
    local: String,
    domain: DnsRule,
}

impl Policy {
    /// Compiles the configured rule lists, validating every entry.
    pub fn new(allow: PolicyRules, deny: PolicyRules) -> Result<Self> {
        Ok(Self {
            allow: Compiled::compile(&allow)?,
            deny: Compiled::compile(&deny)?,
        })
    }

    /// A policy that permits everything.
    pub fn permissive() -> Self {
        Self::default()
    }

    /// True when no rules are configured at all.
    pub fn is_permissive(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Checks every SAN; the first disallowed identifier is returned in the
    /// error.
    pub fn check_sans(&self, sans: &[San]) -> Result<()> {
        for san in sans {
            self.check_san(san)?;
        }
        Ok(())
    }

    fn check_san(&self, san: &San) -> Result<()> {
        let denied = |kind: &'static str| Error::Denied {
            kind,
            value: san.value(),
        };
        match san {
            San::Dns(name) => {
                if self.deny.dns.iter().any(|r| r.matches(name)) {
                    return Err(denied("dns"));
                }
                if !self.allow.dns.is_empty() && !self.allow.dns.iter().any(|r| r.matches(name)) {
                    return Err(denied("dns"));
                }
            }
            San::Ip(addr) => {
                if self.deny.ip.iter().any(|r| r.contains(addr)) {
                    return Err(denied("ip"));
                }
                if !self.allow.ip.is_empty() && !self.allow.ip.iter().any(|r| r.contains(addr)) {
                    return Err(denied("ip"));
                }
            }
            San::Email(addr) => {
                if self.deny.email.iter().any(|r| r.matches(addr)) {
                    return Err(denied("email"));
                }
                if !self.allow.email.is_empty()
                    && !self.allow.email.iter().any(|r| r.matches(addr))
                {
                    return Err(denied("email"));
                }
            }
            San::Uri(uri) => {
                let host = uri_host(uri);
                if let Some(host) = &host {
                    if self.deny.uri.iter().any(|r| r.matches(host)) {
                        return Err(denied("uri"));
                    }
                }
                if !self.allow.uri.is_empty() {
                    let allowed = host
                        .as_deref()
                        .map(|h| self.allow.uri.iter().any(|r| r.matches(h)))
                        .unwrap_or(false);
                    if !allowed {
                        return Err(denied("uri"));
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks SSH principal names.
    pub fn check_principals(&self, principals: &[String]) -> Result<()> {
        for name in principals {
            if self.deny.principal.iter().any(|p| p == name) {
                return Err(Error::Denied {
                    kind: "principal",
                    value: name.clone(),
                });
            }
            if !self.allow.principal.is_empty() && !self.allow.principal.iter().any(|p| p == name) {
                return Err(Error::Denied {
                    kind: "principal",
                    value: name.clone(),
                });
            }
        }
        Ok(())
    }
}

impl Compiled {
    fn compile(rules: &PolicyRules) -> Result<Self> {
        Ok(Self {
            dns: rules
                .dns
                .iter()
                .map(|e| DnsRule::parse(e))
                .collect::<Result<_>>()?,
            ip: rules
                .ip
                .iter()
                .map(|e| CidrRule::parse(e))
                .collect::<Result<_>>()?,
            email: rules
                .email
                .iter()
                .map(|e| EmailRule::parse(e))
                .collect::<Result<_>>()?,
            uri: rules
                .uri
                .iter()
                .map(|e| DnsRule::parse(e))
                .collect::<Result<_>>()?,
            principal: rules.principal.clone(),
        })
    }

    fn is_empty(&self) -> bool {
        self.dns.is_empty()
            && self.ip.is_empty()
            && self.email.is_empty()
            && self.uri.is_empty()
            && self.principal.is_empty()
    }
}

impl DnsRule {
    fn parse(entry: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPolicyEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };
        let lowered = entry.trim().to_ascii_lowercase();
        if let Some(base) = lowered.strip_prefix("*.") {
            if base.is_empty() || base.contains('*') {
                return Err(invalid("wildcard must be a single leading label"));
            }
            Ok(DnsRule::Wildcard(base.to_string()))
        } else if lowered.is_empty() || lowered.contains('*') {
            Err(invalid("wildcard only allowed as leading label"))
        } else {
            Ok(DnsRule::Exact(lowered))
        }
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.to_ascii_lowercase();
        match self {
            DnsRule::Exact(entry) => *entry == name,
            DnsRule::Wildcard(base) => name
                .strip_suffix(base)
                .and_then(|head| head.strip_suffix('.'))
                .map(|label| !label.is_empty() && !label.contains('.'))
                .unwrap_or(false),
        }
    }
}

impl CidrRule {
    fn parse(entry: &str) -> Result<Self> {
        let invalid = |reason: String| Error::InvalidPolicyEntry {
            entry: entry.to_string(),
            reason,
        };
        let (addr, prefix) = match entry.split_once('/') {
            Some((addr, prefix)) => {
                let prefix: u8 = prefix
                    .parse()
                    .map_err(|_| invalid(format!("invalid prefix length {prefix:?}")))?;
                (addr, Some(prefix))
            }
            None => (entry, None),
        };
        let net: IpAddr = addr
            .parse()
            .map_err(|_| invalid(format!("invalid address {addr:?}")))?;
        let max = if net.is_ipv4() { 32 } else { 128 };
        let prefix = prefix.unwrap_or(max);
        if prefix > max {
            return Err(invalid(format!("prefix /{prefix} exceeds /{max}")));
        }
        Ok(Self { net, prefix })
    }

    fn contains(&self, addr: &IpAddr) -> bool {
        match (self.net, addr) {
            (IpAddr::V4(net), IpAddr::V4(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(self.prefix))
                };
                (u32::from(net) & mask) == (u32::from(*addr) & mask)
            }
            (IpAddr::V6(net), IpAddr::V6(addr)) => {
                let mask = if self.prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(self.prefix))
                };
                (u128::from(net) & mask) == (u128::from(*addr) & mask)
            }
            _ => false,
        }
    }
}

impl EmailRule {
    fn parse(entry: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidPolicyEntry {
            entry: entry.to_string(),
            reason: reason.to_string(),
        };
        let (local, domain) = entry
            .rsplit_once('@')
            .ok_or_else(|| invalid("missing @"))?;
        if domain.is_empty() {
            return Err(invalid("missing domain"));
        }
        Ok(Self {
            local: local.to_string(),
            domain: DnsRule::parse(domain)?,
        })
    }

    fn matches(&self, addr: &str) -> bool {
        let Some((local, domain)) = addr.rsplit_once('@') else {
            return false;
        };
        (self.local.is_empty() || self.local == local) && self.domain.matches(domain)
    }
}

fn uri_host(uri: &str) -> Option<String> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dns(value: &str) -> San {
        San::Dns(value.into())
    }

    #[test]
    fn wildcard_matches_exactly_one_label() {
        let rule = DnsRule::parse("*.corp.test").unwrap();
        assert!(rule.matches("admin.corp.test"));
        assert!(rule.matches("A.CORP.TEST"));
        assert!(!rule.matches("corp.test"));
        assert!(!rule.matches("a.b.corp.test"));
        assert!(!rule.matches("xcorp.test"));
    }

    #[test]
    fn deny_wins_over_allow() {
        let policy = Policy::new(
            PolicyRules {
                dns: vec!["*.corp.test".into()],
                ..Default::default()
            },
            PolicyRules {
                dns: vec!["admin.corp.test".into()],
                ..Default::default()
            },
        )
        .unwrap();
        policy.check_sans(&[dns("web.corp.test")]).unwrap();
        let err = policy.check_sans(&[dns("admin.corp.test")]).unwrap_err();
        assert!(err.to_string().contains("admin.corp.test"));
    }

    #[test]
    fn denied_wildcard_cites_the_identifier() {
        let policy = Policy::new(
            PolicyRules::default(),
            PolicyRules {
                dns: vec!["*.corp.test".into()],
                ..Default::default()
            },
        )
        .unwrap();
        let err = policy.check_sans(&[dns("admin.corp.test")]).unwrap_err();
        match err {
            Error::Denied { kind, value } => {
                assert_eq!(kind, "dns");
                assert_eq!(value, "admin.corp.test");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn empty_allow_permits_the_kind() {
        let policy = Policy::new(
            PolicyRules {
                dns: vec!["*.example.com".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .unwrap();
        // dns is constrained, ip is not
        policy
            .check_sans(&[San::Ip("192.0.2.1".parse().unwrap())])
            .unwrap();
        assert!(policy.check_sans(&[dns("other.test")]).is_err());
    }

    #[test]
    fn cidr_matching() {
        let policy = Policy::new(
            PolicyRules {
                ip: vec!["10.0.0.0/8".into(), "2001:db8::/32".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .unwrap();
        policy
            .check_sans(&[San::Ip("10.1.2.3".parse().unwrap())])
            .unwrap();
        policy
            .check_sans(&[San::Ip("2001:db8::1".parse().unwrap())])
            .unwrap();
        assert!(policy
            .check_sans(&[San::Ip("192.0.2.1".parse().unwrap())])
            .is_err());
        assert!(policy
            .check_sans(&[San::Ip("2001:db9::1".parse().unwrap())])
            .is_err());
    }

    #[test]
    fn email_rules() {
        let policy = Policy::new(
            PolicyRules {
                email: vec!["@example.com".into(), "root@*.corp.test".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .unwrap();
        policy
            .check_sans(&[San::Email("anyone@example.com".into())])
            .unwrap();
        policy
            .check_sans(&[San::Email("root@eu.corp.test".into())])
            .unwrap();
        assert!(policy
            .check_sans(&[San::Email("user@eu.corp.test".into())])
            .is_err());
        assert!(policy
            .check_sans(&[San::Email("anyone@other.test".into())])
            .is_err());
    }

    #[test]
    fn uri_rules_match_host() {
        let policy = Policy::new(
            PolicyRules {
                uri: vec!["*.example.com".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .unwrap();
        policy
            .check_sans(&[San::Uri("spiffe://svc.example.com/workload".into())])
            .unwrap();
        assert!(policy
            .check_sans(&[San::Uri("spiffe://other.test/workload".into())])
            .is_err());
        // unparseable URIs never satisfy a non-empty allow list
        assert!(policy.check_sans(&[San::Uri("not a uri".into())]).is_err());
    }

    #[test]
    fn principal_rules_match_exactly() {
        let policy = Policy::new(
            PolicyRules {
                principal: vec!["ops".into()],
                ..Default::default()
            },
            PolicyRules {
                principal: vec!["root".into()],
                ..Default::default()
            },
        )
        .unwrap();
        policy.check_principals(&["ops".into()]).unwrap();
        assert!(policy.check_principals(&["root".into()]).is_err());
        assert!(policy.check_principals(&["dev".into()]).is_err());
    }

    #[test]
    fn every_san_must_pass() {
        let policy = Policy::new(
            PolicyRules {
                dns: vec!["*.example.com".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .unwrap();
        let err = policy
            .check_sans(&[dns("ok.example.com"), dns("bad.test")])
            .unwrap_err();
        assert!(err.to_string().contains("bad.test"));
    }

    #[test]
    fn invalid_entries_are_rejected_at_compile() {
        assert!(Policy::new(
            PolicyRules {
                dns: vec!["a.*.example.com".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .is_err());
        assert!(Policy::new(
            PolicyRules {
                ip: vec!["10.0.0.0/40".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .is_err());
        assert!(Policy::new(
            PolicyRules {
                email: vec!["no-at-sign".into()],
                ..Default::default()
            },
            PolicyRules::default(),
        )
        .is_err());
    }

    #[test]
    fn permissive_policy_allows_everything() {
        let policy = Policy::permissive();
        assert!(policy.is_permissive());
        policy
            .check_sans(&[
                dns("anything.test"),
                San::Ip("203.0.113.9".parse().unwrap()),
                San::Email("a@b.test".into()),
                San::Uri("https://x.test/".into()),
            ])
            .unwrap();
    }
}
