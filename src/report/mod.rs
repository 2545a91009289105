//! HTML and JSON reports for a processed bundle.
//!
//! Build status and network verdict are reported as separate sections: a
//! failed build says nothing about network access, and a clean network
//! verdict says nothing about whether the build worked.

mod html;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::build::BuildStatus;
use crate::error::InspectorError;
use crate::processor::{ProcessingReport, Verdict};

pub const HTML_REPORT_FILE: &str = "build-report.html";
pub const JSON_REPORT_FILE: &str = "build-report.json";

/// How the run was invoked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub target: String,
    pub package_manager: String,
    pub package: Option<String>,
    pub branch: Option<String>,
    pub config_path: Option<String>,
    /// `collect` or `process-only`.
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunMetadata {
    pub fn elapsed_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

/// Build section of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum BuildSection {
    Succeeded,
    Failed { step: usize, command: String },
    Interrupted,
    /// The bundle carries no build record.
    Unknown,
}

impl From<Option<&BuildStatus>> for BuildSection {
    fn from(status: Option<&BuildStatus>) -> Self {
        match status {
            Some(BuildStatus::Succeeded) => BuildSection::Succeeded,
            Some(BuildStatus::Failed { step, command }) => BuildSection::Failed {
                step: *step,
                command: command.clone(),
            },
            Some(BuildStatus::Interrupted) => BuildSection::Interrupted,
            None => BuildSection::Unknown,
        }
    }
}

/// The JSON report document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportDocument {
    pub run: RunMetadata,
    pub build: BuildSection,
    pub verdict: Verdict,
    pub capture_complete: bool,
    pub network: ProcessingReport,
}

/// Files written for one report.
#[derive(Debug, Clone)]
pub struct ReportPaths {
    pub html: PathBuf,
    pub json: PathBuf,
}

pub struct ReportBuilder;

impl ReportBuilder {
    pub fn document(report: &ProcessingReport, run: &RunMetadata) -> ReportDocument {
        ReportDocument {
            run: run.clone(),
            build: BuildSection::from(report.build.as_ref().map(|b| &b.status)),
            verdict: report.verdict(),
            capture_complete: report.completeness.is_complete(),
            network: report.clone(),
        }
    }

    /// Write both report files into the bundle directory.
    pub fn build(
        bundle_root: &Path,
        report: &ProcessingReport,
        run: &RunMetadata,
    ) -> Result<ReportPaths, InspectorError> {
        let document = Self::document(report, run);

        let html_path = bundle_root.join(HTML_REPORT_FILE);
        std::fs::write(&html_path, html::render(&document))?;

        let json_path = bundle_root.join(JSON_REPORT_FILE);
        std::fs::write(&json_path, serde_json::to_string_pretty(&document)?)?;

        tracing::info!("Report written to {}", html_path.display());
        Ok(ReportPaths {
            html: html_path,
            json: json_path,
        })
    }
}
