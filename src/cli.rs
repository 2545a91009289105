//! CLI parsing.

use std::path::PathBuf;

use clap::Parser;

use crate::build::BuildTarget;
use crate::error::InspectorError;

/// Build Inspector - audit the network behavior of a software build
#[derive(Parser, Debug)]
#[command(name = "build-inspector")]
#[command(about = "Build a project inside a disposable VM and report every network destination it reached")]
#[command(version)]
pub struct Cli {
    /// Project to build: a local directory, or a repository URL with --url
    pub target: Option<String>,

    /// Path to the settings file (default: ./inspector.json)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Package to build; selects package-specific settings
    #[arg(short = 'p', long = "package")]
    pub package: Option<String>,

    /// Treat TARGET as a git repository URL to clone inside the VM
    #[arg(long = "url")]
    pub url: bool,

    /// Branch to check out when cloning
    #[arg(short = 'b', long = "branch")]
    pub branch: Option<String>,

    /// Package manager label used in bundle names
    #[arg(short = 'm', long = "package-manager", default_value = "generic")]
    pub package_manager: String,

    /// Roll the VM back to its clean snapshot after collecting evidence
    #[arg(long = "rollback")]
    pub rollback: bool,

    /// Skip the build and only process an existing evidence archive
    #[arg(long = "only-process", value_name = "ZIP")]
    pub only_process: Option<PathBuf>,

    /// With --only-process, accept bundles in non-standard layouts
    #[arg(long = "script", requires = "only_process")]
    pub script: bool,

    /// Directory to create evidence bundles in
    #[arg(short = 'o', long = "output", default_value = ".")]
    pub output: PathBuf,

    /// Leave the VM running after the run
    #[arg(long = "keep-vm")]
    pub keep_vm: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Cli {
    /// Parse CLI arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the settings file path.
    pub fn settings_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(crate::config::default_settings_path)
    }

    /// Resolve what to build. Fails before any VM is touched.
    pub fn build_target(&self) -> Result<BuildTarget, InspectorError> {
        let (path, url) = if self.url {
            (None, self.target.as_deref())
        } else {
            (self.target.as_deref(), None)
        };
        BuildTarget::resolve(path, url, self.package.as_deref(), self.branch.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_mode() {
        let cli = Cli::parse_from([
            "build-inspector",
            "--url",
            "https://github.com/acme/widget.git",
            "-b",
            "dev",
            "-m",
            "npm",
        ]);
        assert_eq!(
            cli.build_target().unwrap(),
            BuildTarget::Url {
                url: "https://github.com/acme/widget.git".to_string(),
                branch: Some("dev".to_string())
            }
        );
        assert_eq!(cli.package_manager, "npm");
        assert_eq!(cli.settings_path(), PathBuf::from("inspector.json"));
    }

    #[test]
    fn test_script_requires_only_process() {
        assert!(Cli::try_parse_from(["build-inspector", "--script"]).is_err());
        let cli = Cli::try_parse_from([
            "build-inspector",
            "--only-process",
            "evidence.zip",
            "--script",
        ])
        .unwrap();
        assert!(cli.script);
    }

    #[test]
    fn test_unreachable_path() {
        let cli = Cli::parse_from(["build-inspector", "/nope/not/here"]);
        assert!(cli.build_target().is_err());
    }
}
