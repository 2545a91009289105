//! Configuration schema types for the inspector settings file.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, InspectorError};

/// Default working directory for the build inside the VM.
pub const DEFAULT_WORKDIR: &str = "/home/vagrant/build";

/// Default snapshot name used for the clean restore point.
pub const DEFAULT_SNAPSHOT_NAME: &str = "build-inspector-clean";

/// A build command, either a bare shell string or a string with its own timeout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum CommandSpec {
    Plain(String),
    #[serde(rename_all = "camelCase")]
    Detailed {
        run: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

impl CommandSpec {
    /// The shell text of the command.
    pub fn run(&self) -> &str {
        match self {
            CommandSpec::Plain(run) => run,
            CommandSpec::Detailed { run, .. } => run,
        }
    }

    /// Per-command timeout, if one was configured.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            CommandSpec::Plain(_) => None,
            CommandSpec::Detailed { timeout_secs, .. } => timeout_secs.map(Duration::from_secs),
        }
    }
}

impl From<&str> for CommandSpec {
    fn from(run: &str) -> Self {
        CommandSpec::Plain(run.to_string())
    }
}

/// Package-specific overrides, selected with `--package`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageConfig {
    /// Replaces the global command list when non-empty.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,

    /// Added to the global evidence file patterns.
    #[serde(default)]
    pub evidence_files: Vec<String>,

    /// Added to the global whitelist.
    #[serde(default)]
    pub host_whitelist: Vec<String>,
}

/// Vagrant backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VagrantConfig {
    /// Directory holding the Vagrantfile (default: current directory).
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// Name of the clean restore point.
    #[serde(default = "default_snapshot_name")]
    pub snapshot_name: String,

    /// Interface tcpdump listens on inside the VM.
    #[serde(default = "default_capture_interface")]
    pub capture_interface: String,

    /// Leave the VM running after the run instead of halting it.
    #[serde(default)]
    pub keep_running: bool,
}

impl Default for VagrantConfig {
    fn default() -> Self {
        Self {
            directory: None,
            snapshot_name: default_snapshot_name(),
            capture_interface: default_capture_interface(),
            keep_running: false,
        }
    }
}

fn default_snapshot_name() -> String {
    DEFAULT_SNAPSHOT_NAME.to_string()
}

fn default_capture_interface() -> String {
    "any".to_string()
}

fn default_workdir() -> String {
    DEFAULT_WORKDIR.to_string()
}

/// Main inspector configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectorConfig {
    /// Ordered build commands.
    #[serde(default)]
    pub commands: Vec<CommandSpec>,

    /// Files inside the VM collected as evidence (glob patterns).
    #[serde(default)]
    pub evidence_files: Vec<String>,

    /// Permitted network destinations (e.g., "registry.npmjs.org", "*.github.com").
    #[serde(default)]
    pub host_whitelist: Vec<String>,

    /// Package-specific overrides.
    #[serde(default)]
    pub packages: BTreeMap<String, PackageConfig>,

    /// Timeout applied to every command without its own.
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,

    /// Keep running the sequence after a failing command.
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Working directory for the build inside the VM.
    #[serde(default = "default_workdir")]
    pub workdir: String,

    /// Vagrant backend settings.
    #[serde(default)]
    pub vagrant: VagrantConfig,
}

impl Default for InspectorConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            evidence_files: Vec::new(),
            host_whitelist: Vec::new(),
            packages: BTreeMap::new(),
            command_timeout_secs: None,
            continue_on_failure: false,
            workdir: default_workdir(),
            vagrant: VagrantConfig::default(),
        }
    }
}

impl InspectorConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), InspectorError> {
        for pattern in &self.host_whitelist {
            validate_domain_pattern(pattern)?;
        }
        for pattern in &self.evidence_files {
            validate_evidence_pattern(pattern)?;
        }

        for (name, package) in &self.packages {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "package names cannot be empty".to_string(),
                )
                .into());
            }
            for pattern in &package.host_whitelist {
                validate_domain_pattern(pattern)?;
            }
            for pattern in &package.evidence_files {
                validate_evidence_pattern(pattern)?;
            }
        }

        if self.workdir.trim().is_empty() {
            return Err(ConfigError::ValidationError("workdir cannot be empty".to_string()).into());
        }

        Ok(())
    }

    /// Flatten package overrides into the effective configuration for a run.
    pub fn for_package(&self, package: Option<&str>) -> Result<InspectorConfig, InspectorError> {
        let effective = self.with_overrides(package);

        if effective.commands.is_empty() {
            return Err(ConfigError::ValidationError(match package {
                Some(name) => format!("no build commands configured for package '{}'", name),
                None => "no build commands configured".to_string(),
            })
            .into());
        }

        Ok(effective)
    }

    /// Apply a package's overrides without requiring any build commands.
    /// Offline processing only needs the merged whitelist.
    pub fn with_overrides(&self, package: Option<&str>) -> InspectorConfig {
        let mut effective = self.clone();

        if let Some(overrides) = package.and_then(|name| self.packages.get(name)) {
            if !overrides.commands.is_empty() {
                effective.commands = overrides.commands.clone();
            }
            for pattern in &overrides.evidence_files {
                if !effective.evidence_files.contains(pattern) {
                    effective.evidence_files.push(pattern.clone());
                }
            }
            for host in &overrides.host_whitelist {
                if !effective.host_whitelist.contains(host) {
                    effective.host_whitelist.push(host.clone());
                }
            }
        }

        effective
    }

    /// Timeout for a command: its own, else the global one.
    pub fn timeout_for(&self, command: &CommandSpec) -> Option<Duration> {
        command
            .timeout()
            .or_else(|| self.command_timeout_secs.map(Duration::from_secs))
    }
}

/// Validate a whitelist pattern. IP literals are accepted as exact rules.
pub fn validate_domain_pattern(pattern: &str) -> Result<(), InspectorError> {
    if pattern.is_empty() {
        return Err(ConfigError::InvalidDomainPattern {
            pattern: pattern.to_string(),
            reason: "domain pattern cannot be empty".to_string(),
        }
        .into());
    }

    if pattern.parse::<IpAddr>().is_ok() {
        return Ok(());
    }

    if pattern == "*" {
        return Err(ConfigError::InvalidDomainPattern {
            pattern: pattern.to_string(),
            reason: "wildcard-only patterns are not allowed".to_string(),
        }
        .into());
    }

    if let Some(suffix) = pattern.strip_prefix("*.") {
        if !suffix.contains('.') && suffix.len() <= 4 {
            return Err(ConfigError::InvalidDomainPattern {
                pattern: pattern.to_string(),
                reason: "pattern is too broad (matches entire TLD)".to_string(),
            }
            .into());
        }
    }

    if pattern.contains(':') {
        return Err(ConfigError::InvalidDomainPattern {
            pattern: pattern.to_string(),
            reason: "domain patterns cannot include port numbers".to_string(),
        }
        .into());
    }

    let check_part = pattern.strip_prefix("*.").unwrap_or(pattern);
    for ch in check_part.chars() {
        if !ch.is_ascii_alphanumeric() && ch != '.' && ch != '-' && ch != '_' {
            return Err(ConfigError::InvalidDomainPattern {
                pattern: pattern.to_string(),
                reason: format!("invalid character '{}' in domain pattern", ch),
            }
            .into());
        }
    }

    Ok(())
}

fn validate_evidence_pattern(pattern: &str) -> Result<(), InspectorError> {
    if pattern.trim().is_empty() {
        return Err(ConfigError::InvalidPathPattern {
            pattern: pattern.to_string(),
            reason: "pattern cannot be empty".to_string(),
        }
        .into());
    }
    if pattern.split('/').any(|part| part == "..") {
        return Err(ConfigError::InvalidPathPattern {
            pattern: pattern.to_string(),
            reason: "parent directory references are not allowed".to_string(),
        }
        .into());
    }
    glob::Pattern::new(pattern).map_err(|e| ConfigError::InvalidPathPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })?;
    Ok(())
}

/// Check if a hostname matches a whitelist pattern.
pub fn matches_domain_pattern(hostname: &str, pattern: &str) -> bool {
    let hostname_lower = hostname.trim_end_matches('.').to_lowercase();
    let pattern_lower = pattern.to_lowercase();

    if let Some(base_domain) = pattern_lower.strip_prefix("*.") {
        // *.example.com matches api.example.com but NOT example.com
        hostname_lower.ends_with(&format!(".{}", base_domain))
    } else {
        hostname_lower == pattern_lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_pattern_matching() {
        assert!(matches_domain_pattern("example.com", "example.com"));
        assert!(matches_domain_pattern("EXAMPLE.COM", "example.com"));
        assert!(matches_domain_pattern("example.com.", "example.com"));
        assert!(!matches_domain_pattern("api.example.com", "example.com"));

        assert!(matches_domain_pattern("api.example.com", "*.example.com"));
        assert!(matches_domain_pattern("deep.api.example.com", "*.example.com"));
        assert!(!matches_domain_pattern("example.com", "*.example.com"));
        assert!(!matches_domain_pattern("badexample.com", "*.example.com"));
    }

    #[test]
    fn test_domain_pattern_validation() {
        assert!(validate_domain_pattern("example.com").is_ok());
        assert!(validate_domain_pattern("*.example.com").is_ok());
        assert!(validate_domain_pattern("localhost").is_ok());
        assert!(validate_domain_pattern("10.0.2.3").is_ok());
        assert!(validate_domain_pattern("2606:4700::6810:84e5").is_ok());

        assert!(validate_domain_pattern("").is_err());
        assert!(validate_domain_pattern("*").is_err());
        assert!(validate_domain_pattern("*.com").is_err());
        assert!(validate_domain_pattern("example.com:8080").is_err());
        assert!(validate_domain_pattern("exa mple.com").is_err());
    }

    #[test]
    fn test_for_package_overrides() {
        let mut config = InspectorConfig {
            commands: vec!["make".into()],
            host_whitelist: vec!["github.com".to_string()],
            ..Default::default()
        };
        config.packages.insert(
            "left-pad".to_string(),
            PackageConfig {
                commands: vec!["npm install {package}".into()],
                evidence_files: vec!["/home/vagrant/.npm/_logs/*".to_string()],
                host_whitelist: vec!["registry.npmjs.org".to_string()],
            },
        );

        let effective = config.for_package(Some("left-pad")).unwrap();
        assert_eq!(effective.commands, vec![CommandSpec::from("npm install {package}")]);
        assert_eq!(effective.host_whitelist, vec!["github.com", "registry.npmjs.org"]);
        assert_eq!(effective.evidence_files.len(), 1);

        let global = config.for_package(None).unwrap();
        assert_eq!(global.commands, vec![CommandSpec::from("make")]);
    }

    #[test]
    fn test_for_package_requires_commands() {
        let mut config = InspectorConfig::default();
        config.packages.insert(
            "left-pad".to_string(),
            PackageConfig {
                host_whitelist: vec!["registry.npmjs.org".to_string()],
                ..Default::default()
            },
        );
        assert!(config.for_package(Some("left-pad")).is_err());

        let merged = config.with_overrides(Some("left-pad"));
        assert_eq!(merged.host_whitelist, vec!["registry.npmjs.org"]);
    }

    #[test]
    fn test_timeout_resolution() {
        let config = InspectorConfig {
            command_timeout_secs: Some(600),
            ..Default::default()
        };
        let plain = CommandSpec::from("make");
        let detailed = CommandSpec::Detailed {
            run: "make test".to_string(),
            timeout_secs: Some(30),
        };
        assert_eq!(config.timeout_for(&plain), Some(Duration::from_secs(600)));
        assert_eq!(config.timeout_for(&detailed), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_evidence_pattern_validation() {
        assert!(validate_evidence_pattern("/var/log/*.log").is_ok());
        assert!(validate_evidence_pattern("").is_err());
        assert!(validate_evidence_pattern("../etc/passwd").is_err());
        assert!(validate_evidence_pattern("/tmp/[").is_err());
    }
}
