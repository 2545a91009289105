//! tcpdump running inside the VM, streamed back over `vagrant ssh`.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;

use crate::capture::PacketSource;
use crate::error::CaptureError;
use crate::sandbox::VagrantHypervisor;
use crate::utils::join_args;

/// How long to wait for tcpdump to report that it is listening.
const BANNER_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for tcpdump to exit after being asked to stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(15);

/// Traffic on the SSH control channel is ours, not the build's.
const CAPTURE_FILTER: &str = "not port 22";

/// Line-buffered `tcpdump -n -tt` inside the guest.
pub struct TcpdumpSource {
    vagrant: VagrantHypervisor,
    interface: String,
    child: Option<Child>,
}

impl TcpdumpSource {
    pub fn new(vagrant: VagrantHypervisor, interface: impl Into<String>) -> Self {
        Self {
            vagrant,
            interface: interface.into(),
            child: None,
        }
    }

    fn remote_command(&self) -> String {
        let tcpdump = join_args(["sudo", "tcpdump", "-l", "-n", "-tt", "-i", self.interface.as_str()]);
        format!("{} {}", tcpdump, CAPTURE_FILTER)
    }
}

#[async_trait]
impl PacketSource for TcpdumpSource {
    async fn open(&mut self) -> Result<Box<dyn AsyncRead + Send + Unpin>, CaptureError> {
        let mut child = self
            .vagrant
            .ssh(&self.remote_command())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| CaptureError::StartFailed(format!("failed to launch tcpdump: {}", e)))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(CaptureError::StartFailed(
                "tcpdump pipes unavailable".to_string(),
            ));
        };

        // tcpdump announces "listening on <iface>" on stderr once packets flow.
        let mut stderr = BufReader::new(stderr).lines();
        let mut diagnostics = Vec::new();
        let banner = tokio::time::timeout(BANNER_TIMEOUT, async {
            while let Some(line) = stderr.next_line().await? {
                if line.contains("listening on") {
                    return Ok::<bool, std::io::Error>(true);
                }
                diagnostics.push(line);
            }
            Ok(false)
        })
        .await;

        match banner {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                return Err(CaptureError::StartFailed(format!(
                    "tcpdump exited before listening: {}",
                    diagnostics.join("; ")
                )))
            }
            Ok(Err(e)) => return Err(CaptureError::StartFailed(e.to_string())),
            Err(_) => {
                return Err(CaptureError::StartFailed(format!(
                    "tcpdump did not start listening within {}s",
                    BANNER_TIMEOUT.as_secs()
                )))
            }
        }

        tracing::debug!("tcpdump listening on {}", self.interface);
        tokio::spawn(async move {
            while let Ok(Some(line)) = stderr.next_line().await {
                tracing::debug!("tcpdump: {}", line);
            }
        });

        self.child = Some(child);
        Ok(Box::new(stdout))
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        // SIGINT makes tcpdump flush its buffer before exiting.
        let stop = self
            .vagrant
            .ssh("sudo pkill -INT -x tcpdump")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        if let Err(e) = stop {
            tracing::warn!("Could not signal tcpdump in the guest: {}", e);
        }

        match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) if status.success() => Ok(()),
            Ok(Ok(status)) => Err(CaptureError::Recorder(format!(
                "tcpdump exited with {}",
                status
            ))),
            Ok(Err(e)) => Err(CaptureError::Io(e)),
            Err(_) => {
                interrupt_local(&child);
                if tokio::time::timeout(Duration::from_secs(5), child.wait())
                    .await
                    .is_err()
                {
                    child.kill().await.ok();
                }
                Err(CaptureError::Recorder(
                    "tcpdump did not stop in time and was killed".to_string(),
                ))
            }
        }
    }
}

/// Send SIGINT to the local ssh session so the remote side sees a hangup.
#[cfg(unix)]
fn interrupt_local(child: &Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = child.id() {
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            tracing::debug!("SIGINT to capture session failed: {}", e);
        }
    }
}

#[cfg(not(unix))]
fn interrupt_local(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::Verbosity;

    #[test]
    fn test_remote_command_excludes_ssh() {
        let source = TcpdumpSource::new(VagrantHypervisor::new("/tmp", Verbosity::quiet()), "any");
        assert_eq!(
            source.remote_command(),
            "sudo tcpdump -l -n -tt -i any not port 22"
        );
    }

    #[tokio::test]
    async fn test_close_without_open_is_noop() {
        let mut source =
            TcpdumpSource::new(VagrantHypervisor::new("/tmp", Verbosity::quiet()), "eth0");
        assert!(source.close().await.is_ok());
    }
}
