//! Sandbox lifecycle controller.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::capture::PacketSource;
use crate::error::InspectorError;
use crate::sandbox::{CommandOutput, Hypervisor, SessionState};
use crate::utils::Verbosity;

/// The one VM session of a run.
#[derive(Debug, Clone)]
pub struct SandboxSession {
    pub handle: String,
    pub state: SessionState,
    pub addresses: Vec<IpAddr>,
    pub verbosity: Verbosity,
    /// Name of the current restore point, once one exists.
    pub snapshot: Option<String>,
}

/// Drives exactly one VM through provision, snapshot, build, collection and rollback.
pub struct SandboxController {
    hypervisor: Arc<dyn Hypervisor>,
    session: SandboxSession,
    snapshot_name: String,
}

impl SandboxController {
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        snapshot_name: impl Into<String>,
        verbosity: Verbosity,
    ) -> Self {
        let session = SandboxSession {
            handle: hypervisor.handle(),
            state: SessionState::Down,
            addresses: Vec::new(),
            verbosity,
            snapshot: None,
        };
        Self {
            hypervisor,
            session,
            snapshot_name: snapshot_name.into(),
        }
    }

    pub fn session(&self) -> &SandboxSession {
        &self.session
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    /// Provision or resume the VM. A no-op once the session is up.
    pub async fn up(&mut self) -> Result<(), InspectorError> {
        if self.session.state != SessionState::Down {
            tracing::debug!("Sandbox {} already {}", self.session.handle, self.session.state);
            return Ok(());
        }

        tracing::info!("Provisioning sandbox {}", self.session.handle);
        self.session.state = SessionState::Provisioning;

        match self.hypervisor.provision().await {
            Ok(()) => {
                self.session.state = SessionState::Up;
                tracing::info!("Sandbox {} is up", self.session.handle);
                Ok(())
            }
            Err(e) => {
                self.session.state = SessionState::Down;
                Err(match e {
                    InspectorError::Provision(_) => e,
                    other => InspectorError::Provision(other.to_string()),
                })
            }
        }
    }

    /// Record the clean restore point. Calling it again overwrites the previous one.
    pub async fn snapshot(&mut self) -> Result<(), InspectorError> {
        self.require(&[SessionState::Up, SessionState::Snapshotted], "snapshot")?;

        if self.session.snapshot.is_some() {
            tracing::warn!(
                "Overwriting restore point '{}' for sandbox {}",
                self.snapshot_name,
                self.session.handle
            );
        }

        self.hypervisor.snapshot(&self.snapshot_name).await?;
        self.session.snapshot = Some(self.snapshot_name.clone());
        self.session.state = SessionState::Snapshotted;
        tracing::info!("Snapshot '{}' recorded", self.snapshot_name);
        Ok(())
    }

    /// Network addresses of the VM.
    pub async fn ip_addresses(&mut self) -> Result<Vec<IpAddr>, InspectorError> {
        if !self.session.state.is_running() {
            return Err(InspectorError::NotReady {
                state: self.session.state.to_string(),
            });
        }

        if !self.session.addresses.is_empty() {
            return Ok(self.session.addresses.clone());
        }

        let addresses = self.hypervisor.addresses().await?;
        tracing::debug!("Sandbox {} addresses are {:?}", self.session.handle, addresses);
        self.session.addresses = addresses.clone();
        Ok(addresses)
    }

    /// Enter the build window. Only valid once a restore point exists.
    pub fn begin_execution(&mut self) -> Result<(), InspectorError> {
        self.require(&[SessionState::Snapshotted], "start the build")?;
        self.session.state = SessionState::Executing;
        Ok(())
    }

    /// Run one command inside the VM during the build window.
    pub async fn exec(&self, command: &str) -> Result<CommandOutput, InspectorError> {
        self.require(&[SessionState::Executing], "run a build command")?;
        self.hypervisor.exec(command).await
    }

    /// Stage a host source tree into the VM during the build window.
    pub async fn upload(&self, local: &Path, remote: &str) -> Result<(), InspectorError> {
        self.require(&[SessionState::Executing], "upload sources")?;
        self.hypervisor.upload(local, remote).await
    }

    /// Copy evidence files out of the VM.
    pub async fn fetch_evidence(
        &self,
        patterns: &[String],
        dest: &Path,
    ) -> Result<Vec<PathBuf>, InspectorError> {
        self.require(
            &[SessionState::Executing, SessionState::Collected],
            "fetch evidence",
        )?;
        if patterns.is_empty() {
            return Ok(Vec::new());
        }
        self.hypervisor.fetch(patterns, dest).await
    }

    /// Mark evidence as collected, closing the build window.
    pub fn mark_collected(&mut self) -> Result<(), InspectorError> {
        self.require(
            &[SessionState::Executing, SessionState::Collected],
            "mark evidence collected",
        )?;
        self.session.state = SessionState::Collected;
        Ok(())
    }

    /// Revert the VM to the clean restore point, discarding build changes.
    pub async fn rollback(&mut self) -> Result<(), InspectorError> {
        self.require(&[SessionState::Collected], "roll back")?;
        let name = self
            .session
            .snapshot
            .clone()
            .ok_or_else(|| InspectorError::InvalidTransition {
                from: self.session.state.to_string(),
                operation: "roll back without a snapshot",
            })?;

        tracing::info!("Rolling sandbox {} back to '{}'", self.session.handle, name);
        self.hypervisor.rollback(&name).await?;
        self.session.state = SessionState::RolledBack;
        Ok(())
    }

    /// Return a rolled-back session to the clean state so it can run again.
    pub fn reuse(&mut self) -> Result<(), InspectorError> {
        self.require(&[SessionState::RolledBack], "reuse the sandbox")?;
        self.session.state = SessionState::Snapshotted;
        Ok(())
    }

    /// Halt the VM, or leave it running when `keep_running` is set.
    pub async fn teardown(&mut self, keep_running: bool) -> Result<(), InspectorError> {
        if self.session.state == SessionState::Down {
            return Ok(());
        }
        if keep_running {
            tracing::info!(
                "Leaving sandbox {} running ({})",
                self.session.handle,
                self.session.state
            );
            return Ok(());
        }

        self.hypervisor.shutdown().await?;
        self.session.state = SessionState::Down;
        self.session.addresses.clear();
        tracing::info!("Sandbox {} halted", self.session.handle);
        Ok(())
    }

    /// Packet source for the VM's traffic on `interface`.
    pub fn packet_source(&self, interface: &str) -> Result<Box<dyn PacketSource>, InspectorError> {
        if !self.session.state.is_running() {
            return Err(InspectorError::NotReady {
                state: self.session.state.to_string(),
            });
        }
        Ok(self.hypervisor.packet_source(interface))
    }

    fn require(&self, allowed: &[SessionState], operation: &'static str) -> Result<(), InspectorError> {
        if allowed.contains(&self.session.state) {
            Ok(())
        } else {
            Err(InspectorError::InvalidTransition {
                from: self.session.state.to_string(),
                operation,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::FakeHypervisor;

    fn controller(fake: &Arc<FakeHypervisor>) -> SandboxController {
        SandboxController::new(fake.clone(), "clean", Verbosity::quiet())
    }

    #[tokio::test]
    async fn test_up_is_idempotent() {
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = controller(&fake);

        sandbox.up().await.unwrap();
        sandbox.up().await.unwrap();

        assert_eq!(sandbox.state(), SessionState::Up);
        assert_eq!(fake.calls_matching("provision"), 1);
    }

    #[tokio::test]
    async fn test_provision_failure_returns_to_down() {
        let fake = Arc::new(FakeHypervisor::new().failing_provision());
        let mut sandbox = controller(&fake);

        let err = sandbox.up().await.unwrap_err();
        assert!(matches!(err, InspectorError::Provision(_)));
        assert_eq!(sandbox.state(), SessionState::Down);
    }

    #[tokio::test]
    async fn test_ip_addresses_require_running_vm() {
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = controller(&fake);

        assert!(matches!(
            sandbox.ip_addresses().await,
            Err(InspectorError::NotReady { .. })
        ));

        sandbox.up().await.unwrap();
        assert_eq!(sandbox.ip_addresses().await.unwrap(), fake.addresses_value());
    }

    #[tokio::test]
    async fn test_snapshot_only_from_up() {
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = controller(&fake);

        assert!(sandbox.snapshot().await.is_err());
        sandbox.up().await.unwrap();
        sandbox.snapshot().await.unwrap();
        // Second snapshot overwrites.
        sandbox.snapshot().await.unwrap();
        assert_eq!(fake.calls_matching("snapshot clean"), 2);
        assert_eq!(sandbox.state(), SessionState::Snapshotted);
    }

    #[tokio::test]
    async fn test_build_requires_snapshot() {
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = controller(&fake);
        sandbox.up().await.unwrap();

        assert!(sandbox.begin_execution().is_err());
        assert!(sandbox.exec("make").await.is_err());

        sandbox.snapshot().await.unwrap();
        sandbox.begin_execution().unwrap();
        assert!(sandbox.exec("make").await.unwrap().success());
    }

    #[tokio::test]
    async fn test_rollback_only_after_collection() {
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = controller(&fake);
        sandbox.up().await.unwrap();
        sandbox.snapshot().await.unwrap();
        sandbox.begin_execution().unwrap();

        assert!(sandbox.rollback().await.is_err());

        sandbox.mark_collected().unwrap();
        sandbox.rollback().await.unwrap();
        assert_eq!(sandbox.state(), SessionState::RolledBack);
        assert_eq!(fake.calls_matching("rollback clean"), 1);

        sandbox.reuse().unwrap();
        sandbox.begin_execution().unwrap();
        assert!(sandbox.reuse().is_err());
    }

    #[tokio::test]
    async fn test_teardown_respects_keep_running() {
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = controller(&fake);
        sandbox.up().await.unwrap();

        sandbox.teardown(true).await.unwrap();
        assert_eq!(sandbox.state(), SessionState::Up);

        sandbox.teardown(false).await.unwrap();
        assert_eq!(sandbox.state(), SessionState::Down);
        assert_eq!(fake.calls_matching("shutdown"), 1);
    }
}
