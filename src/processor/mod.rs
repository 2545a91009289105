//! Classification of a bundle's capture log against a whitelist.
//!
//! [`NetworkEvidenceProcessor::process`] and
//! [`NetworkEvidenceProcessor::process_evidence`] differ only in how they find
//! the bundle root; both hand it to the same classification routine.

pub mod finding;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::build::BuildStatus;
use crate::capture::{CaptureLog, CaptureRecord, CaptureWindow, Completeness, NetworkEvent, CAPTURE_LOG_FILE};
use crate::error::{CollectionError, InspectorError};
use crate::evidence::{unpack, BundleManifest, StepRecord, MANIFEST_FILE, TRANSCRIPTS_DIR};
use crate::policy::{PolicyVersion, WhitelistPolicy};

pub use finding::{summarize_hosts, Classification, Finding, FindingCounts, HostSummary, Severity};

/// Overall network verdict for a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Complete capture, every destination whitelisted.
    Clean,
    UnauthorizedAccess,
    /// No unauthorized access seen, but the evidence cannot prove there was none.
    Inconclusive,
}

/// Build outcome as recorded in the bundle manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSummary {
    pub status: BuildStatus,
    pub steps: Vec<StepRecord>,
}

/// Aggregated findings for one bundle and one policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReport {
    pub bundle: String,
    pub policy_version: PolicyVersion,
    pub window: CaptureWindow,
    pub completeness: Completeness,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: i64,
    /// Events the recorder discarded for falling outside the window.
    pub out_of_window: u64,
    pub findings: Vec<Finding>,
    pub hosts: Vec<HostSummary>,
    pub counts: FindingCounts,
    pub build: Option<BuildSummary>,
}

impl ProcessingReport {
    pub fn verdict(&self) -> Verdict {
        if self.counts.unauthorized > 0 {
            Verdict::UnauthorizedAccess
        } else if !self.completeness.is_complete() || self.counts.unresolvable > 0 {
            Verdict::Inconclusive
        } else {
            Verdict::Clean
        }
    }

    pub fn has_unauthorized(&self) -> bool {
        self.counts.unauthorized > 0
    }

    pub fn unauthorized(&self) -> impl Iterator<Item = &Finding> {
        self.findings
            .iter()
            .filter(|f| f.classification == Classification::Unauthorized)
    }
}

/// Classifies bundles against one immutable policy.
pub struct NetworkEvidenceProcessor {
    policy: WhitelistPolicy,
}

impl NetworkEvidenceProcessor {
    pub fn new(policy: WhitelistPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &WhitelistPolicy {
        &self.policy
    }

    /// Process a bundle produced by this tool, in the standard layout.
    pub fn process(&self, bundle_root: &Path) -> Result<ProcessingReport, InspectorError> {
        for required in [MANIFEST_FILE, CAPTURE_LOG_FILE, TRANSCRIPTS_DIR] {
            if !bundle_root.join(required).exists() {
                return Err(CollectionError::InvalidLayout {
                    path: bundle_root.display().to_string(),
                    reason: format!("missing {}", required),
                }
                .into());
            }
        }
        self.classify_bundle(bundle_root)
    }

    /// Process a bundle from anywhere: a bundle directory, a directory
    /// holding exactly one bundle, or a `.zip` archive of one.
    pub fn process_evidence(&self, path: &Path) -> Result<ProcessingReport, InspectorError> {
        let root = resolve_bundle_root(path)?;
        self.classify_bundle(&root)
    }

    fn classify_bundle(&self, root: &Path) -> Result<ProcessingReport, InspectorError> {
        let manifest = if root.join(MANIFEST_FILE).exists() {
            Some(BundleManifest::load(root)?)
        } else {
            None
        };

        let log = CaptureLog::new(root.join(CAPTURE_LOG_FILE));

        // First pass: the window. Classification only ever runs on a flushed log.
        let mut start: Option<DateTime<Utc>> = None;
        let mut stop: Option<(DateTime<Utc>, Completeness, u64)> = None;
        for record in log.records()? {
            match record? {
                Ok(CaptureRecord::Start { at }) if start.is_none() => start = Some(at),
                Ok(CaptureRecord::Stop {
                    at,
                    complete,
                    reason,
                    out_of_window,
                }) => {
                    let completeness = if complete {
                        Completeness::Complete
                    } else {
                        Completeness::Incomplete {
                            reason: reason.unwrap_or_else(|| "capture marked incomplete".to_string()),
                        }
                    };
                    stop = Some((at, completeness, out_of_window));
                }
                _ => {}
            }
        }
        let (started_at, stopped_at, completeness, out_of_window) = match (start, stop, &manifest) {
            (Some(start), Some((stop, completeness, out_of_window)), _) => {
                (start, stop, completeness, out_of_window)
            }
            // The recorder could not seal the log, but collection recorded
            // the window. Classify what exists and never call it complete.
            (start, stop, Some(m)) => {
                tracing::warn!(
                    "Capture log in {} is not sealed; using the manifest's window",
                    root.display()
                );
                let completeness = match &m.completeness {
                    Completeness::Complete => Completeness::Incomplete {
                        reason: "capture log has no start or stop record".to_string(),
                    },
                    incomplete => incomplete.clone(),
                };
                (
                    start.unwrap_or(m.window.start),
                    stop.map(|(at, _, _)| at).unwrap_or(m.window.stop),
                    completeness,
                    m.capture.out_of_window,
                )
            }
            _ => {
                return Err(InspectorError::Processing(format!(
                    "capture log in {} was never flushed; refusing to classify a partial log",
                    root.display()
                )));
            }
        };
        let window = CaptureWindow {
            start: started_at,
            stop: stopped_at,
        };

        // Second pass: every record becomes a finding, in log order.
        let mut findings = Vec::new();
        for record in log.records()? {
            match record? {
                Ok(CaptureRecord::Event(event)) if window.contains(event.timestamp) => {
                    findings.push(Finding::classify(event, &self.policy));
                }
                Ok(CaptureRecord::Event(event)) => {
                    findings.push(Finding::unresolvable(
                        event,
                        &self.policy,
                        "event recorded outside the capture window".to_string(),
                    ));
                }
                Ok(CaptureRecord::Unparsed { at, line }) => {
                    findings.push(Finding::unresolvable(
                        NetworkEvent::unparsed(at),
                        &self.policy,
                        format!("unparsed capture line: {}", line),
                    ));
                }
                Ok(CaptureRecord::Start { .. } | CaptureRecord::Stop { .. }) => {}
                Err(malformed) => {
                    tracing::warn!("Malformed capture record at line {}", malformed.line_number);
                    findings.push(Finding::unresolvable(
                        NetworkEvent::unparsed(stopped_at),
                        &self.policy,
                        format!(
                            "malformed capture record at line {}: {}",
                            malformed.line_number, malformed.content
                        ),
                    ));
                }
            }
        }

        let completeness = match (&completeness, &manifest) {
            (Completeness::Complete, Some(m)) if !m.completeness.is_complete() => m.completeness.clone(),
            _ => completeness,
        };

        let counts = FindingCounts::tally(&findings);
        let hosts = summarize_hosts(&findings);

        let bundle = manifest
            .as_ref()
            .map(|m| m.name.clone())
            .or_else(|| root.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();

        tracing::info!(
            "Classified {} events from {}: {} whitelisted, {} unauthorized, {} unresolvable",
            counts.total(),
            bundle,
            counts.whitelisted,
            counts.unauthorized,
            counts.unresolvable
        );

        Ok(ProcessingReport {
            bundle,
            policy_version: self.policy.version().clone(),
            window,
            completeness,
            started_at,
            finished_at: stopped_at,
            elapsed_ms: (stopped_at - started_at).num_milliseconds(),
            out_of_window,
            findings,
            hosts,
            counts,
            build: manifest.map(|m| BuildSummary {
                status: m.build,
                steps: m.steps,
            }),
        })
    }
}

/// Find the bundle root for an arbitrary evidence path.
pub fn resolve_bundle_root(path: &Path) -> Result<PathBuf, InspectorError> {
    let is_bundle = |dir: &Path| dir.join(CAPTURE_LOG_FILE).is_file();

    if path.is_file() {
        if path.extension().and_then(|e| e.to_str()) != Some("zip") {
            return Err(CollectionError::InvalidLayout {
                path: path.display().to_string(),
                reason: "expected a bundle directory or a .zip archive".to_string(),
            }
            .into());
        }
        let extracted = unpack(path)?;
        return resolve_bundle_root(&extracted);
    }

    if is_bundle(path) {
        return Ok(path.to_path_buf());
    }

    if path.is_dir() {
        let mut nested = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let candidate = entry?.path();
            if candidate.is_dir() && is_bundle(&candidate) {
                nested.push(candidate);
            }
        }
        if nested.len() == 1 {
            return Ok(nested.remove(0));
        }
        return Err(CollectionError::InvalidLayout {
            path: path.display().to_string(),
            reason: format!("expected exactly one bundle, found {}", nested.len()),
        }
        .into());
    }

    Err(CollectionError::InvalidLayout {
        path: path.display().to_string(),
        reason: "no such file or directory".to_string(),
    }
    .into())
}
