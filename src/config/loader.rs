//! Configuration loader for the inspector settings file.

use std::path::{Path, PathBuf};

use crate::config::schema::InspectorConfig;
use crate::error::{ConfigError, InspectorError};
use crate::utils::expand_home;

/// Default settings file name, resolved against the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "inspector.json";

/// Get the default settings file path.
pub fn default_settings_path() -> PathBuf {
    PathBuf::from(DEFAULT_SETTINGS_FILE)
}

/// Load configuration from a file path.
pub fn load_config(path: &Path) -> Result<InspectorConfig, InspectorError> {
    let path = PathBuf::from(expand_home(&path.display().to_string()));
    if !path.is_file() {
        return Err(ConfigError::FileNotFound(path.display().to_string()).into());
    }

    let content = std::fs::read_to_string(&path).map_err(|e| {
        ConfigError::ParseError(format!("Failed to read config file: {}", e))
    })?;

    tracing::debug!("Loaded configuration from {}", path.display());
    parse_config(&content)
}

/// Parse configuration from a JSON string.
pub fn parse_config(json: &str) -> Result<InspectorConfig, InspectorError> {
    let config: InspectorConfig = serde_json::from_str(json).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse config JSON: {}", e))
    })?;

    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommandSpec;

    #[test]
    fn test_parse_minimal_config() {
        let config = parse_config("{}").unwrap();
        assert!(config.commands.is_empty());
        assert!(config.host_whitelist.is_empty());
        assert_eq!(config.workdir, crate::config::DEFAULT_WORKDIR);
        assert!(!config.continue_on_failure);
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "commands": [
                "npm install",
                { "run": "npm test", "timeoutSecs": 120 }
            ],
            "evidenceFiles": ["/home/vagrant/.npm/_logs/*.log"],
            "hostWhitelist": ["registry.npmjs.org", "*.github.com", "10.0.2.3"],
            "packages": {
                "express": { "commands": ["npm install {package}"] }
            },
            "commandTimeoutSecs": 900,
            "continueOnFailure": true,
            "workdir": "/srv/build",
            "vagrant": {
                "directory": "/opt/inspector",
                "snapshotName": "clean",
                "captureInterface": "eth0",
                "keepRunning": true
            }
        }"#;

        let config = parse_config(json).unwrap();
        assert_eq!(config.commands.len(), 2);
        assert_eq!(
            config.commands[1],
            CommandSpec::Detailed {
                run: "npm test".to_string(),
                timeout_secs: Some(120)
            }
        );
        assert_eq!(config.evidence_files.len(), 1);
        assert_eq!(config.host_whitelist.len(), 3);
        assert!(config.packages.contains_key("express"));
        assert_eq!(config.command_timeout_secs, Some(900));
        assert!(config.continue_on_failure);
        assert_eq!(config.workdir, "/srv/build");
        assert_eq!(config.vagrant.snapshot_name, "clean");
        assert_eq!(config.vagrant.capture_interface, "eth0");
        assert!(config.vagrant.keep_running);
    }

    #[test]
    fn test_invalid_whitelist_pattern() {
        let json = r#"{ "hostWhitelist": ["*.com"] }"#;
        assert!(parse_config(json).is_err());
    }

    #[test]
    fn test_invalid_package_whitelist_pattern() {
        let json = r#"{ "packages": { "x": { "hostWhitelist": ["*"] } } }"#;
        assert!(parse_config(json).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_config(Path::new("/nonexistent/inspector.json")).unwrap_err();
        assert!(matches!(
            err,
            InspectorError::Config(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inspector.json");
        std::fs::write(&path, r#"{"commands": ["make"]}"#).unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.commands, vec![CommandSpec::from("make")]);
    }
}
