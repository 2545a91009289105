//! Classified network events and their aggregates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::capture::{NetworkEvent, Protocol};
use crate::policy::{PolicyVersion, WhitelistPolicy};

/// Label used for findings that come from lines with no host at all.
pub const UNPARSED_HOST: &str = "(unparsed)";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Whitelisted,
    Unresolvable,
    Unauthorized,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Classification::Whitelisted => "whitelisted",
            Classification::Unresolvable => "unresolvable",
            Classification::Unauthorized => "unauthorized",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    High,
}

impl From<Classification> for Severity {
    fn from(classification: Classification) -> Self {
        match classification {
            Classification::Whitelisted => Severity::Info,
            Classification::Unresolvable => Severity::Warning,
            Classification::Unauthorized => Severity::High,
        }
    }
}

/// One network event judged against one policy version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub event: NetworkEvent,
    pub classification: Classification,
    pub severity: Severity,
    pub policy_version: PolicyVersion,
    /// The whitelist rule that matched, for whitelisted events.
    pub rule: Option<String>,
    /// Why an event could not be classified normally.
    pub detail: Option<String>,
}

impl Finding {
    /// Classify a captured event.
    pub fn classify(event: NetworkEvent, policy: &WhitelistPolicy) -> Self {
        let rule = policy
            .matching_rule(&event.host, event.address)
            .map(|rule| rule.to_string());

        let classification = if rule.is_some() {
            Classification::Whitelisted
        } else if event.is_resolved() {
            Classification::Unauthorized
        } else {
            Classification::Unresolvable
        };

        let detail = match (classification, event.protocol) {
            (Classification::Unresolvable, Protocol::Dns) => {
                Some(format!("lookup of {} returned no address", event.host))
            }
            _ => None,
        };

        Self {
            severity: classification.into(),
            classification,
            policy_version: policy.version().clone(),
            rule,
            detail,
            event,
        }
    }

    /// A record that could not be turned into an event. Never dropped.
    pub fn unresolvable(event: NetworkEvent, policy: &WhitelistPolicy, detail: String) -> Self {
        Self {
            event,
            classification: Classification::Unresolvable,
            severity: Severity::Warning,
            policy_version: policy.version().clone(),
            rule: None,
            detail: Some(detail),
        }
    }

    pub fn host_label(&self) -> &str {
        if self.event.host.is_empty() {
            UNPARSED_HOST
        } else {
            &self.event.host
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingCounts {
    pub whitelisted: usize,
    pub unauthorized: usize,
    pub unresolvable: usize,
}

impl FindingCounts {
    pub fn tally(findings: &[Finding]) -> Self {
        let mut counts = Self::default();
        for finding in findings {
            match finding.classification {
                Classification::Whitelisted => counts.whitelisted += 1,
                Classification::Unauthorized => counts.unauthorized += 1,
                Classification::Unresolvable => counts.unresolvable += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.whitelisted + self.unauthorized + self.unresolvable
    }
}

/// Per-destination rollup of findings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostSummary {
    pub host: String,
    /// The most severe classification seen for this host.
    pub classification: Classification,
    pub addresses: BTreeSet<String>,
    pub ports: BTreeSet<u16>,
    pub protocols: BTreeSet<Protocol>,
    pub connections: u64,
    pub bytes: u64,
}

/// Summaries sorted by host name.
pub fn summarize_hosts(findings: &[Finding]) -> Vec<HostSummary> {
    let mut hosts: BTreeMap<&str, HostSummary> = BTreeMap::new();

    for finding in findings {
        let host = finding.host_label();
        let summary = hosts.entry(host).or_insert_with(|| HostSummary {
            host: host.to_string(),
            classification: finding.classification,
            addresses: BTreeSet::new(),
            ports: BTreeSet::new(),
            protocols: BTreeSet::new(),
            connections: 0,
            bytes: 0,
        });

        summary.classification = summary.classification.max(finding.classification);
        if let Some(addr) = finding.event.address {
            summary.addresses.insert(addr.to_string());
        }
        if finding.event.port != 0 {
            summary.ports.insert(finding.event.port);
        }
        summary.protocols.insert(finding.event.protocol);
        summary.connections += 1;
        summary.bytes += finding.event.bytes;
    }

    hosts.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn event(host: &str, address: Option<&str>, port: u16) -> NetworkEvent {
        NetworkEvent {
            timestamp: Utc::now(),
            host: host.to_string(),
            address: address.map(|a| a.parse().unwrap()),
            port,
            protocol: Protocol::Tcp,
            bytes: 100,
            process: None,
        }
    }

    fn policy() -> WhitelistPolicy {
        WhitelistPolicy::new(["registry.example.com", "*.github.com"]).unwrap()
    }

    #[test]
    fn test_exact_match_is_whitelisted() {
        let finding = Finding::classify(
            event("registry.example.com", Some("198.51.100.1"), 443),
            &policy(),
        );
        assert_eq!(finding.classification, Classification::Whitelisted);
        assert_eq!(finding.severity, Severity::Info);
        assert_eq!(finding.rule.as_deref(), Some("registry.example.com"));
    }

    #[test]
    fn test_resolved_unknown_host_is_unauthorized() {
        let finding = Finding::classify(event("evil.example", Some("203.0.113.9"), 443), &policy());
        assert_eq!(finding.classification, Classification::Unauthorized);
        assert_eq!(finding.severity, Severity::High);
        assert_eq!(&finding.policy_version, policy().version());
    }

    #[test]
    fn test_address_literal_host_without_address_is_unauthorized() {
        let finding = Finding::classify(event("203.0.113.9", None, 443), &policy());
        assert_eq!(finding.classification, Classification::Unauthorized);
        assert_eq!(finding.severity, Severity::High);

        let allowed = WhitelistPolicy::new(["203.0.113.9"]).unwrap();
        let finding = Finding::classify(event("203.0.113.9", None, 443), &allowed);
        assert_eq!(finding.classification, Classification::Whitelisted);
    }

    #[test]
    fn test_unresolved_unknown_host_is_unresolvable() {
        let mut lookup = event("nothing.invalid", None, 53);
        lookup.protocol = Protocol::Dns;
        let finding = Finding::classify(lookup, &policy());
        assert_eq!(finding.classification, Classification::Unresolvable);
        assert!(finding.detail.unwrap().contains("no address"));
    }

    #[test]
    fn test_host_summary_takes_worst_classification() {
        let policy = policy();
        let findings = vec![
            Finding::classify(event("api.github.com", Some("140.82.112.6"), 443), &policy),
            Finding::classify(event("api.github.com", Some("140.82.112.6"), 22), &policy),
            Finding::classify(event("203.0.113.50", Some("203.0.113.50"), 8080), &policy),
            Finding::unresolvable(NetworkEvent::unparsed(Utc::now()), &policy, "junk".into()),
        ];

        let hosts = summarize_hosts(&findings);
        let names: Vec<&str> = hosts.iter().map(|h| h.host.as_str()).collect();
        assert_eq!(names, vec!["(unparsed)", "203.0.113.50", "api.github.com"]);

        let github = &hosts[2];
        assert_eq!(github.connections, 2);
        assert_eq!(github.bytes, 200);
        assert_eq!(github.ports.iter().copied().collect::<Vec<_>>(), vec![22, 443]);
        assert_eq!(github.classification, Classification::Whitelisted);
        assert_eq!(hosts[1].classification, Classification::Unauthorized);
    }
}
