//! Whitelist matching for captured destinations.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{matches_domain_pattern, validate_domain_pattern, InspectorConfig};
use crate::error::InspectorError;

/// One whitelist rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchRule {
    /// Exact host name, case-insensitive.
    Exact(String),
    /// `*.example.com`: any subdomain of the base, not the base itself.
    Wildcard(String),
    /// A literal IP address.
    Address(IpAddr),
}

impl MatchRule {
    fn parse(pattern: &str) -> Result<Self, InspectorError> {
        validate_domain_pattern(pattern)?;
        if let Ok(addr) = pattern.parse::<IpAddr>() {
            return Ok(MatchRule::Address(addr));
        }
        let lower = pattern.to_lowercase();
        Ok(match lower.strip_prefix("*.") {
            Some(_) => MatchRule::Wildcard(lower),
            None => MatchRule::Exact(lower),
        })
    }

    /// Check a destination against this rule.
    pub fn matches(&self, host: &str, address: Option<IpAddr>) -> bool {
        match self {
            MatchRule::Exact(pattern) | MatchRule::Wildcard(pattern) => {
                matches_domain_pattern(host, pattern)
            }
            MatchRule::Address(allowed) => {
                address == Some(*allowed) || host.parse::<IpAddr>().ok() == Some(*allowed)
            }
        }
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchRule::Exact(host) => write!(f, "{}", host),
            MatchRule::Wildcard(pattern) => write!(f, "{}", pattern),
            MatchRule::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// Content hash identifying one exact rule list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyVersion(String);

impl PolicyVersion {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PolicyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered, immutable set of whitelist rules.
#[derive(Debug, Clone)]
pub struct WhitelistPolicy {
    rules: Vec<MatchRule>,
    version: PolicyVersion,
}

impl WhitelistPolicy {
    /// Build a policy from raw patterns. Duplicates keep their first position.
    pub fn new<I, S>(patterns: I) -> Result<Self, InspectorError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut rules: Vec<MatchRule> = Vec::new();
        for pattern in patterns {
            let rule = MatchRule::parse(pattern.as_ref().trim())?;
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }

        let mut hasher = Sha256::new();
        for rule in &rules {
            hasher.update(rule.to_string().as_bytes());
            hasher.update(b"\n");
        }
        let version = PolicyVersion(hex::encode(hasher.finalize()));

        Ok(Self { rules, version })
    }

    /// Build the policy from the effective configuration's whitelist.
    pub fn from_config(config: &InspectorConfig) -> Result<Self, InspectorError> {
        Self::new(&config.host_whitelist)
    }

    /// The first rule matching a destination, if any.
    pub fn matching_rule(&self, host: &str, address: Option<IpAddr>) -> Option<&MatchRule> {
        self.rules.iter().find(|rule| rule.matches(host, address))
    }

    pub fn is_whitelisted(&self, host: &str, address: Option<IpAddr>) -> bool {
        self.matching_rule(host, address).is_some()
    }

    pub fn rules(&self) -> &[MatchRule] {
        &self.rules
    }

    pub fn version(&self) -> &PolicyVersion {
        &self.version
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_and_wildcard_rules() {
        let policy = WhitelistPolicy::new(["registry.npmjs.org", "*.github.com"]).unwrap();

        assert!(policy.is_whitelisted("registry.npmjs.org", None));
        assert!(policy.is_whitelisted("REGISTRY.NPMJS.ORG", None));
        assert!(policy.is_whitelisted("codeload.github.com", None));
        assert!(!policy.is_whitelisted("github.com", None));
        assert!(!policy.is_whitelisted("evil.example", None));
    }

    #[test]
    fn test_address_rules() {
        let policy = WhitelistPolicy::new(["10.0.2.3"]).unwrap();
        let resolver: IpAddr = "10.0.2.3".parse().unwrap();

        assert!(policy.is_whitelisted("10.0.2.3", None));
        assert!(policy.is_whitelisted("dns.internal", Some(resolver)));
        assert!(!policy.is_whitelisted("10.0.2.4", None));
    }

    #[test]
    fn test_matching_rule_is_first_in_order() {
        let policy = WhitelistPolicy::new(["*.example.com", "api.example.com"]).unwrap();
        assert_eq!(
            policy.matching_rule("api.example.com", None),
            Some(&MatchRule::Wildcard("*.example.com".to_string()))
        );
    }

    #[test]
    fn test_version_is_stable_and_order_sensitive() {
        let a = WhitelistPolicy::new(["a.example.com", "b.example.com"]).unwrap();
        let b = WhitelistPolicy::new(["a.example.com", "b.example.com", "a.example.com"]).unwrap();
        let c = WhitelistPolicy::new(["b.example.com", "a.example.com"]).unwrap();

        assert_eq!(a.version(), b.version());
        assert_ne!(a.version(), c.version());
        assert_eq!(a.version().as_str().len(), 64);
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(WhitelistPolicy::new(["*"]).is_err());
        assert!(WhitelistPolicy::new(["host:443"]).is_err());
    }
}
