//! Vagrant-backed hypervisor.
//!
//! Every operation shells out to the `vagrant` CLI in the directory holding
//! the Vagrantfile. Files cross the VM boundary through the default
//! `/vagrant` synced folder.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use crate::capture::{PacketSource, TcpdumpSource};
use crate::error::InspectorError;
use crate::sandbox::{CommandOutput, Hypervisor};
use crate::utils::{copy_dir_recursive, quote, quote_glob, slugify, Verbosity};

/// Staging directory under the Vagrant project, visible in the VM as `/vagrant/.inspector-staging`.
const STAGING_DIR: &str = ".inspector-staging";
const GUEST_SYNCED_DIR: &str = "/vagrant";

/// A VM managed by the `vagrant` CLI.
#[derive(Debug, Clone)]
pub struct VagrantHypervisor {
    directory: PathBuf,
    verbosity: Verbosity,
}

impl VagrantHypervisor {
    pub fn new(directory: impl Into<PathBuf>, verbosity: Verbosity) -> Self {
        Self {
            directory: directory.into(),
            verbosity,
        }
    }

    /// A `vagrant` invocation rooted at the project directory.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        let mut cmd = Command::new("vagrant");
        cmd.args(args)
            .current_dir(&self.directory)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// A `vagrant ssh -c` invocation running `remote` in the guest.
    pub fn ssh(&self, remote: &str) -> Command {
        self.command(["ssh", "-c", remote])
    }

    async fn run(&self, mut cmd: Command, what: &str) -> Result<CommandOutput, InspectorError> {
        let output = cmd
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    InspectorError::Hypervisor("vagrant not found in PATH".to_string())
                }
                _ => InspectorError::Hypervisor(format!("failed to run vagrant {}: {}", what, e)),
            })?;

        let result = CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if self.verbosity.is_verbose() {
            tracing::debug!("vagrant {} exited with {:?}", what, result.exit_code);
            for line in result.stdout.lines() {
                tracing::debug!("  {}", line);
            }
        }
        Ok(result)
    }

    async fn run_checked(&self, cmd: Command, what: &str) -> Result<CommandOutput, InspectorError> {
        let output = self.run(cmd, what).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(InspectorError::Hypervisor(format!(
                "vagrant {} failed ({}): {}",
                what,
                describe_exit(output.exit_code),
                tail(&output.stderr, 5)
            )))
        }
    }

    fn staging(&self) -> PathBuf {
        self.directory.join(STAGING_DIR)
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "killed by signal".to_string(),
    }
}

/// The last `lines` lines of command output, for error messages.
fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Every usable address in `hostname -I` output, in the order listed.
fn parse_guest_addresses(output: &str) -> Vec<IpAddr> {
    let mut addresses = Vec::new();
    for addr in output
        .split_whitespace()
        .filter_map(|token| token.parse::<IpAddr>().ok())
        .filter(|addr| !addr.is_loopback())
    {
        if !addresses.contains(&addr) {
            addresses.push(addr);
        }
    }
    addresses
}

#[async_trait]
impl Hypervisor for VagrantHypervisor {
    fn handle(&self) -> String {
        format!("vagrant:{}", self.directory.display())
    }

    async fn provision(&self) -> Result<(), InspectorError> {
        if !self.directory.join("Vagrantfile").exists() {
            return Err(InspectorError::Provision(format!(
                "no Vagrantfile in {}",
                self.directory.display()
            )));
        }

        let output = self.run(self.command(["up"]), "up").await?;
        if !output.success() {
            return Err(InspectorError::Provision(format!(
                "vagrant up failed ({}): {}",
                describe_exit(output.exit_code),
                tail(&output.stderr, 5)
            )));
        }
        Ok(())
    }

    async fn snapshot(&self, name: &str) -> Result<(), InspectorError> {
        self.run_checked(
            self.command(["snapshot", "save", "--force", name]),
            "snapshot save",
        )
        .await?;
        Ok(())
    }

    async fn rollback(&self, name: &str) -> Result<(), InspectorError> {
        self.run_checked(
            self.command(["snapshot", "restore", "--no-provision", name]),
            "snapshot restore",
        )
        .await?;
        Ok(())
    }

    async fn addresses(&self) -> Result<Vec<IpAddr>, InspectorError> {
        let output = self
            .run_checked(self.ssh("hostname -I"), "ssh hostname")
            .await?;
        let addresses = parse_guest_addresses(&output.stdout);
        if addresses.is_empty() {
            return Err(InspectorError::Hypervisor(format!(
                "could not determine guest address from '{}'",
                output.stdout.trim()
            )));
        }
        Ok(addresses)
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, InspectorError> {
        self.run(self.ssh(command), "ssh").await
    }

    async fn upload(&self, local: &Path, remote: &str) -> Result<(), InspectorError> {
        let slot = format!("source-{}", slugify(&local.display().to_string(), 48));
        let staged = self.staging().join(&slot);
        if staged.exists() {
            std::fs::remove_dir_all(&staged)?;
        }
        let copied = copy_dir_recursive(local, &staged)?;
        tracing::debug!("Staged {} files from {}", copied.len(), local.display());

        let guest_staged = format!("{}/{}/{}", GUEST_SYNCED_DIR, STAGING_DIR, slot);
        let script = format!(
            "mkdir -p {remote} && cp -r {src}/. {remote}/",
            remote = quote(remote),
            src = quote(&guest_staged)
        );
        let result = self.run_checked(self.ssh(&script), "ssh upload").await;
        std::fs::remove_dir_all(&staged).ok();
        result.map(|_| ())
    }

    async fn fetch(&self, patterns: &[String], dest: &Path) -> Result<Vec<PathBuf>, InspectorError> {
        let slot = "evidence";
        let staged = self.staging().join(slot);
        if staged.exists() {
            std::fs::remove_dir_all(&staged)?;
        }

        let guest_staged = format!("{}/{}/{}", GUEST_SYNCED_DIR, STAGING_DIR, slot);
        let globs: Vec<String> = patterns.iter().map(|p| quote_glob(p)).collect();
        let script = format!(
            "mkdir -p {dst} && for f in {globs}; do [ -e \"$f\" ] && cp -r --parents \"$f\" {dst}/; done; true",
            dst = quote(&guest_staged),
            globs = globs.join(" ")
        );
        self.run_checked(self.ssh(&script), "ssh fetch").await?;

        let fetched = if staged.exists() {
            copy_dir_recursive(&staged, dest)?
        } else {
            Vec::new()
        };
        std::fs::remove_dir_all(&staged).ok();
        Ok(fetched)
    }

    async fn shutdown(&self) -> Result<(), InspectorError> {
        self.run_checked(self.command(["halt"]), "halt").await?;
        Ok(())
    }

    fn packet_source(&self, interface: &str) -> Box<dyn PacketSource> {
        Box::new(TcpdumpSource::new(self.clone(), interface))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_guest_addresses() {
        let addresses: Vec<IpAddr> = ["10.0.2.15", "192.168.56.10", "2001:db8::5"]
            .iter()
            .map(|a| a.parse().unwrap())
            .collect();
        assert_eq!(
            parse_guest_addresses("10.0.2.15 192.168.56.10 2001:db8::5 10.0.2.15 \n"),
            addresses
        );
        assert_eq!(
            parse_guest_addresses("127.0.0.1 fd00::2"),
            vec!["fd00::2".parse::<IpAddr>().unwrap()]
        );
        assert!(parse_guest_addresses("Connection refused").is_empty());
    }

    #[test]
    fn test_tail() {
        assert_eq!(tail("a\nb\n\nc\nd\n", 2), "c\nd");
        assert_eq!(tail("only", 5), "only");
    }

    #[tokio::test]
    async fn test_provision_requires_vagrantfile() {
        let dir = tempfile::tempdir().unwrap();
        let vagrant = VagrantHypervisor::new(dir.path(), Verbosity::quiet());
        assert!(matches!(
            vagrant.provision().await,
            Err(InspectorError::Provision(_))
        ));
    }
}
