//! Evidence bundle collection.
//!
//! A bundle is a directory named after the run:
//!
//! ```text
//! evidence-<pm>-<repo>-<timestamp>/
//!   manifest.json
//!   inspector-config.json
//!   capture.jsonl
//!   transcripts/NN-<command>.log
//!   evidence/<files fetched from the VM>
//! ```
//!
//! and its zipped copy `<name>.zip` next to it.

pub mod archive;
pub mod manifest;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::build::{BuildTarget, BuildTranscript, CommandOutcome};
use crate::capture::{FlushedCapture, CAPTURE_LOG_FILE};
use crate::config::InspectorConfig;
use crate::error::{CollectionError, InspectorError};
use crate::sandbox::SandboxController;
use crate::utils::slugify;

pub use archive::{extraction_dir, pack, unpack};
pub use manifest::{
    bundle_name, BundleManifest, StepRecord, CONFIG_SNAPSHOT_FILE, EVIDENCE_DIR, MANIFEST_FILE,
    TRANSCRIPTS_DIR,
};

/// A collected bundle on disk.
#[derive(Debug, Clone)]
pub struct EvidenceBundle {
    pub name: String,
    pub root: PathBuf,
    pub archive: PathBuf,
    pub manifest: BundleManifest,
}

/// Builds one bundle for one run.
pub struct EvidenceCollector {
    name: String,
    root: PathBuf,
    package_manager: String,
    target: BuildTarget,
    config: InspectorConfig,
}

impl EvidenceCollector {
    pub fn new(
        output_dir: &Path,
        package_manager: &str,
        target: BuildTarget,
        config: InspectorConfig,
        created_at: DateTime<Utc>,
    ) -> Self {
        let name = bundle_name(package_manager, &target.repo_name(), created_at);
        Self {
            root: output_dir.join(&name),
            name,
            package_manager: package_manager.to_string(),
            target,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the bundle directory and return where the capture log goes.
    /// An existing bundle of the same name is never overwritten.
    pub fn prepare(&self) -> Result<PathBuf, CollectionError> {
        if let Some(parent) = self.root.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::create_dir(&self.root).map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => {
                CollectionError::BundleExists(self.root.display().to_string())
            }
            _ => CollectionError::Io(e),
        })?;
        Ok(self.root.join(CAPTURE_LOG_FILE))
    }

    /// Write transcripts, fetch evidence files, record the manifest and
    /// archive the bundle. Takes a flushed capture, so the log is complete
    /// on disk before anything reads it.
    pub async fn collect(
        &self,
        sandbox: &mut SandboxController,
        capture: &FlushedCapture,
        transcript: &BuildTranscript,
    ) -> Result<EvidenceBundle, InspectorError> {
        let expected_log = self.root.join(CAPTURE_LOG_FILE);
        if capture.log_path() != expected_log {
            return Err(CollectionError::InvalidLayout {
                path: capture.log_path().display().to_string(),
                reason: format!("capture log must live at {}", expected_log.display()),
            }
            .into());
        }

        let mut warnings = Vec::new();
        if let Some(reason) = capture.completeness().reason() {
            warnings.push(format!("capture incomplete: {}", reason));
        }

        let steps = self.write_transcripts(transcript)?;

        let evidence_dir = self.root.join(EVIDENCE_DIR);
        let patterns = self.evidence_patterns();
        let fetched = match sandbox.fetch_evidence(&patterns, &evidence_dir).await {
            Ok(files) => files,
            Err(e) => {
                tracing::warn!("Could not fetch evidence files: {}", e);
                warnings.push(format!("evidence fetch failed: {}", e));
                Vec::new()
            }
        };
        let mut evidence_files: Vec<String> = fetched
            .iter()
            .filter_map(|path| path.strip_prefix(&self.root).ok())
            .map(|path| path.to_string_lossy().replace('\\', "/"))
            .collect();
        evidence_files.sort();

        sandbox.mark_collected()?;

        std::fs::write(
            self.root.join(CONFIG_SNAPSHOT_FILE),
            serde_json::to_string_pretty(&self.config)?,
        )?;

        let manifest = BundleManifest {
            name: self.name.clone(),
            package_manager: self.package_manager.clone(),
            repo: self.target.repo_name(),
            target: self.target.clone(),
            sandbox: sandbox.session().handle.clone(),
            created_at: Utc::now(),
            window: capture.window(),
            completeness: capture.completeness().clone(),
            capture: capture.stats(),
            build: transcript.status(),
            steps,
            evidence_files,
            warnings,
        };
        manifest.save(&self.root)?;

        let archive = self.root.with_file_name(format!("{}.zip", self.name));
        let members = pack(&self.root, &archive)?;
        tracing::info!(
            "Collected bundle {} ({} files, archived to {})",
            self.name,
            members,
            archive.display()
        );

        Ok(EvidenceBundle {
            name: self.name.clone(),
            root: self.root.clone(),
            archive,
            manifest,
        })
    }

    /// Evidence patterns with relative entries anchored at the build workdir.
    fn evidence_patterns(&self) -> Vec<String> {
        self.config
            .evidence_files
            .iter()
            .map(|pattern| {
                if pattern.starts_with('/') {
                    pattern.clone()
                } else {
                    format!("{}/{}", self.config.workdir.trim_end_matches('/'), pattern)
                }
            })
            .collect()
    }

    fn write_transcripts(&self, transcript: &BuildTranscript) -> Result<Vec<StepRecord>, InspectorError> {
        let dir = self.root.join(TRANSCRIPTS_DIR);
        std::fs::create_dir_all(&dir)?;

        let mut records = Vec::new();
        for outcome in transcript.steps() {
            let file = format!("{:02}-{}.log", outcome.index, slugify(&outcome.command, 48));
            std::fs::write(dir.join(&file), render_transcript(outcome))?;
            records.push(StepRecord {
                index: outcome.index,
                command: outcome.command.clone(),
                status: outcome.status.clone(),
                transcript: format!("{}/{}", TRANSCRIPTS_DIR, file),
                started_at: outcome.started_at,
                finished_at: outcome.finished_at,
            });
        }
        Ok(records)
    }
}

fn render_transcript(outcome: &CommandOutcome) -> String {
    let mut out = format!("$ {}\n# {}\n", outcome.command, outcome.status.label());
    if let (Some(start), Some(end)) = (outcome.started_at, outcome.finished_at) {
        out.push_str(&format!("# {} .. {}\n", start.to_rfc3339(), end.to_rfc3339()));
    }
    out.push_str("\n--- stdout ---\n");
    out.push_str(&outcome.stdout);
    out.push_str("\n--- stderr ---\n");
    out.push_str(&outcome.stderr);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn collector(dir: &Path) -> EvidenceCollector {
        EvidenceCollector::new(
            dir,
            "npm",
            BuildTarget::Package {
                name: "left-pad".to_string(),
            },
            InspectorConfig {
                evidence_files: vec!["dist/*.tgz".to_string(), "/var/log/build.log".to_string()],
                ..Default::default()
            },
            Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap(),
        )
    }

    #[test]
    fn test_prepare_refuses_existing_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let collector = collector(dir.path());
        assert_eq!(collector.name(), "evidence-npm-left-pad-20240102030405");

        let log = collector.prepare().unwrap();
        assert_eq!(log, collector.root().join(CAPTURE_LOG_FILE));
        assert!(matches!(
            collector.prepare(),
            Err(CollectionError::BundleExists(_))
        ));
    }

    #[test]
    fn test_relative_patterns_anchor_at_workdir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            collector(dir.path()).evidence_patterns(),
            vec![
                "/home/vagrant/build/dist/*.tgz".to_string(),
                "/var/log/build.log".to_string()
            ]
        );
    }
}
