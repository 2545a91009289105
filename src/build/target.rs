//! Resolution of what is being built.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, InspectorError};
use crate::utils::expand_home;

/// The source tree a build runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildTarget {
    /// A directory on the host, copied into the VM.
    LocalPath { path: PathBuf },
    /// A git repository cloned inside the VM.
    Url { url: String, branch: Option<String> },
    /// A package the build commands fetch themselves.
    Package { name: String },
}

impl BuildTarget {
    /// Pick a target from the command line. Runs before anything is
    /// provisioned, so an unreachable target never costs a VM.
    pub fn resolve(
        path: Option<&str>,
        url: Option<&str>,
        package: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Self, InspectorError> {
        if let Some(url) = url {
            if url.trim().is_empty() {
                return Err(ConfigError::TargetUnreachable("empty repository URL".to_string()).into());
            }
            return Ok(BuildTarget::Url {
                url: url.to_string(),
                branch: branch.map(str::to_string),
            });
        }

        if let Some(raw) = path {
            let expanded = PathBuf::from(expand_home(raw));
            if expanded.is_dir() {
                let path = expanded.canonicalize().unwrap_or(expanded);
                return Ok(BuildTarget::LocalPath { path });
            }
            if package.is_none() {
                return Err(ConfigError::TargetUnreachable(format!(
                    "{} does not exist and no --url or --package was given",
                    raw
                ))
                .into());
            }
        }

        match package {
            Some(name) if !name.trim().is_empty() => Ok(BuildTarget::Package {
                name: name.to_string(),
            }),
            _ => Err(ConfigError::TargetUnreachable(
                "no build target: give a path, --url or --package".to_string(),
            )
            .into()),
        }
    }

    /// Short name used in bundle names and templates.
    pub fn repo_name(&self) -> String {
        match self {
            BuildTarget::LocalPath { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "source".to_string()),
            BuildTarget::Url { url, .. } => repo_name_from_url(url),
            BuildTarget::Package { name } => name.clone(),
        }
    }

    pub fn branch(&self) -> Option<&str> {
        match self {
            BuildTarget::Url { branch, .. } => branch.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for BuildTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildTarget::LocalPath { path } => write!(f, "{}", path.display()),
            BuildTarget::Url { url, branch: Some(branch) } => write!(f, "{} ({})", url, branch),
            BuildTarget::Url { url, branch: None } => write!(f, "{}", url),
            BuildTarget::Package { name } => write!(f, "package {}", name),
        }
    }
}

fn repo_name_from_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_wins() {
        let target = BuildTarget::resolve(
            Some("/does/not/exist"),
            Some("https://github.com/expressjs/express.git"),
            None,
            Some("4.x"),
        )
        .unwrap();
        assert_eq!(target.repo_name(), "express");
        assert_eq!(target.branch(), Some("4.x"));
    }

    #[test]
    fn test_missing_path_is_unreachable() {
        let err = BuildTarget::resolve(Some("/does/not/exist"), None, None, None).unwrap_err();
        assert!(matches!(
            err,
            InspectorError::Config(ConfigError::TargetUnreachable(_))
        ));
    }

    #[test]
    fn test_missing_path_falls_back_to_package() {
        let target = BuildTarget::resolve(Some("left-pad"), None, Some("left-pad"), None).unwrap();
        assert_eq!(
            target,
            BuildTarget::Package {
                name: "left-pad".to_string()
            }
        );
    }

    #[test]
    fn test_local_directory() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("my-lib");
        std::fs::create_dir(&src).unwrap();

        let target = BuildTarget::resolve(src.to_str(), None, None, None).unwrap();
        assert_eq!(target.repo_name(), "my-lib");
        assert!(matches!(target, BuildTarget::LocalPath { .. }));
    }

    #[test]
    fn test_nothing_given() {
        assert!(BuildTarget::resolve(None, None, None, None).is_err());
    }

    #[test]
    fn test_repo_name_from_scp_style_url() {
        assert_eq!(repo_name_from_url("git@github.com:owner/tool.git"), "tool");
        assert_eq!(repo_name_from_url("https://example.org/"), "example.org");
    }
}
