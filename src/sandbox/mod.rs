//! Sandbox virtual machine control.

pub mod controller;
pub mod fake;
pub mod vagrant;

use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::capture::PacketSource;
use crate::error::InspectorError;

pub use controller::{SandboxController, SandboxSession};
pub use fake::{FakeHypervisor, FakePacketSource};
pub use vagrant::VagrantHypervisor;

/// Lifecycle state of a sandbox session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Down,
    Provisioning,
    Up,
    Snapshotted,
    Executing,
    Collected,
    RolledBack,
}

impl SessionState {
    /// The VM exists and can be addressed.
    pub fn is_running(&self) -> bool {
        !matches!(self, SessionState::Down | SessionState::Provisioning)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Down => "down",
            SessionState::Provisioning => "provisioning",
            SessionState::Up => "up",
            SessionState::Snapshotted => "snapshotted",
            SessionState::Executing => "executing",
            SessionState::Collected => "collected",
            SessionState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// Output of one command run inside the VM.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when the command was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// The operations the controller needs from a virtualization backend.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// A stable handle naming the VM, for logs and reports.
    fn handle(&self) -> String;

    /// Create or resume the VM.
    async fn provision(&self) -> Result<(), InspectorError>;

    /// Record a restore point, replacing any with the same name.
    async fn snapshot(&self, name: &str) -> Result<(), InspectorError>;

    /// Revert disk state to a restore point.
    async fn rollback(&self, name: &str) -> Result<(), InspectorError>;

    /// Every network address the VM may send from, as seen in captured
    /// traffic. Never empty on success.
    async fn addresses(&self) -> Result<Vec<IpAddr>, InspectorError>;

    /// Run a shell command inside the VM.
    async fn exec(&self, command: &str) -> Result<CommandOutput, InspectorError>;

    /// Copy a host directory into the VM at `remote`.
    async fn upload(&self, local: &Path, remote: &str) -> Result<(), InspectorError>;

    /// Copy files matching `patterns` out of the VM into `dest`.
    async fn fetch(&self, patterns: &[String], dest: &Path) -> Result<Vec<PathBuf>, InspectorError>;

    /// Halt the VM.
    async fn shutdown(&self) -> Result<(), InspectorError>;

    /// A packet source recording traffic on `interface` inside the VM.
    fn packet_source(&self, interface: &str) -> Box<dyn PacketSource>;
}
