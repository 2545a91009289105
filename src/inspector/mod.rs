//! Run orchestration: the collect-and-analyze pipeline and offline processing.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::build::{BuildExecutor, BuildTarget, BuildTranscript};
use crate::capture::{TrafficCapture, DEFAULT_DRAIN_TIMEOUT};
use crate::config::InspectorConfig;
use crate::error::InspectorError;
use crate::evidence::{unpack, BundleManifest, EvidenceBundle, EvidenceCollector};
use crate::policy::WhitelistPolicy;
use crate::processor::{resolve_bundle_root, NetworkEvidenceProcessor, ProcessingReport};
use crate::report::{ReportBuilder, ReportPaths, RunMetadata};
use crate::sandbox::{Hypervisor, SandboxController};
use crate::utils::Verbosity;

/// Per-run choices made on the command line.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub target: BuildTarget,
    pub package: Option<String>,
    pub package_manager: String,
    pub rollback: bool,
    pub keep_vm: bool,
    /// Directory bundles are created in.
    pub output_dir: PathBuf,
    pub config_path: Option<PathBuf>,
}

/// Everything a completed collect-and-analyze run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub bundle: EvidenceBundle,
    pub transcript: BuildTranscript,
    pub report: ProcessingReport,
    pub report_paths: ReportPaths,
}

/// Result of reprocessing an existing bundle.
#[derive(Debug, Clone)]
pub struct OfflineOutcome {
    pub bundle_root: PathBuf,
    pub report: ProcessingReport,
    pub report_paths: ReportPaths,
}

/// Drives one sandbox through one audited build.
pub struct BuildInspector {
    config: InspectorConfig,
    policy: WhitelistPolicy,
    hypervisor: Arc<dyn Hypervisor>,
    verbosity: Verbosity,
    drain_timeout: Duration,
}

impl BuildInspector {
    /// `config` is the effective configuration, package overrides already applied.
    pub fn new(
        config: InspectorConfig,
        hypervisor: Arc<dyn Hypervisor>,
        verbosity: Verbosity,
    ) -> Result<Self, InspectorError> {
        config.validate()?;
        let policy = WhitelistPolicy::from_config(&config)?;
        tracing::debug!(
            "Whitelist policy {} with {} rules",
            policy.version(),
            policy.rules().len()
        );
        Ok(Self {
            config,
            policy,
            hypervisor,
            verbosity,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &WhitelistPolicy {
        &self.policy
    }

    /// Provision, snapshot, capture the build, collect, optionally roll back,
    /// classify and report. The VM is halted afterwards unless asked to keep it.
    pub async fn collect_and_analyze(
        &self,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, InspectorError> {
        let mut sandbox = SandboxController::new(
            self.hypervisor.clone(),
            self.config.vagrant.snapshot_name.clone(),
            self.verbosity,
        );

        let result = self.run(&mut sandbox, options, cancel).await;

        let keep = options.keep_vm || self.config.vagrant.keep_running;
        if let Err(e) = sandbox.teardown(keep).await {
            tracing::warn!("Failed to halt sandbox: {}", e);
        }
        result
    }

    async fn run(
        &self,
        sandbox: &mut SandboxController,
        options: &RunOptions,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, InspectorError> {
        let started_at = Utc::now();

        sandbox.up().await?;
        sandbox.snapshot().await?;
        let addresses = sandbox.ip_addresses().await?;

        let collector = EvidenceCollector::new(
            &options.output_dir,
            &options.package_manager,
            options.target.clone(),
            self.config.clone(),
            started_at,
        );
        let log_path = collector.prepare()?;

        // Start barrier: no build command is issued until this returns.
        let source = sandbox.packet_source(&self.config.vagrant.capture_interface)?;
        let active = TrafficCapture::new(log_path, addresses)
            .with_drain_timeout(self.drain_timeout)
            .start(source)
            .await?;

        let executor = BuildExecutor::new(self.config.clone(), options.target.clone())
            .with_package(options.package.clone());
        let transcript = match executor.run(sandbox, &active, cancel).await {
            Ok(transcript) => transcript,
            Err(e) => {
                active.stop(true).await.ok();
                return Err(e);
            }
        };

        // Stop barrier: collection only ever sees a flushed log.
        let interrupted = transcript.interrupted() || cancel.is_cancelled();
        let flushed = active.stop(interrupted).await?;

        let bundle = collector.collect(sandbox, &flushed, &transcript).await?;

        if options.rollback {
            if let Err(e) = sandbox.rollback().await {
                tracing::error!("Rollback failed; the VM may still carry build changes: {}", e);
            }
        }

        let processor = NetworkEvidenceProcessor::new(self.policy.clone());
        let report = processor.process(&bundle.root)?;

        let run = RunMetadata {
            target: options.target.to_string(),
            package_manager: options.package_manager.clone(),
            package: options.package.clone(),
            branch: options.target.branch().map(str::to_string),
            config_path: options.config_path.as_ref().map(|p| p.display().to_string()),
            mode: "collect".to_string(),
            started_at,
            finished_at: Utc::now(),
        };
        let report_paths = ReportBuilder::build(&bundle.root, &report, &run)?;

        tracing::info!(
            "Build inspector finished after {:.1} seconds",
            run.elapsed_secs()
        );

        Ok(RunOutcome {
            bundle,
            transcript,
            report,
            report_paths,
        })
    }
}

/// Reprocess a previously collected bundle without touching a VM. A `.zip`
/// is extracted next to itself first. `script` selects the lenient entry
/// point that accepts nested or externally produced layouts.
pub fn process_only(
    config: &InspectorConfig,
    evidence: &Path,
    script: bool,
    package_manager: &str,
    config_path: Option<&Path>,
) -> Result<OfflineOutcome, InspectorError> {
    let started_at = Utc::now();
    let policy = WhitelistPolicy::from_config(config)?;
    let processor = NetworkEvidenceProcessor::new(policy);

    let extracted = if evidence.is_file() {
        unpack(evidence)?
    } else {
        evidence.to_path_buf()
    };

    let (bundle_root, report) = if script {
        let root = resolve_bundle_root(&extracted)?;
        let report = processor.process_evidence(&root)?;
        (root, report)
    } else {
        let report = processor.process(&extracted)?;
        (extracted, report)
    };

    let manifest = BundleManifest::load(&bundle_root).ok();
    let run = RunMetadata {
        target: manifest
            .as_ref()
            .map(|m| m.target.to_string())
            .unwrap_or_else(|| evidence.display().to_string()),
        package_manager: manifest
            .as_ref()
            .map(|m| m.package_manager.clone())
            .unwrap_or_else(|| package_manager.to_string()),
        package: None,
        branch: manifest
            .as_ref()
            .and_then(|m| m.target.branch().map(str::to_string)),
        config_path: config_path.map(|p| p.display().to_string()),
        mode: "process-only".to_string(),
        started_at,
        finished_at: Utc::now(),
    };
    let report_paths = ReportBuilder::build(&bundle_root, &report, &run)?;

    Ok(OfflineOutcome {
        bundle_root,
        report,
        report_paths,
    })
}
