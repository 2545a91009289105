//! Bundle naming and the self-describing manifest.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::build::{BuildStatus, BuildTarget, CommandStatus};
use crate::capture::{CaptureStats, CaptureWindow, Completeness};
use crate::error::{CollectionError, InspectorError};
use crate::utils::slugify;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CONFIG_SNAPSHOT_FILE: &str = "inspector-config.json";
pub const TRANSCRIPTS_DIR: &str = "transcripts";
pub const EVIDENCE_DIR: &str = "evidence";

/// `evidence-<package-manager>-<repo>-<YYYYmmddHHMMSS>`.
pub fn bundle_name(package_manager: &str, repo: &str, at: DateTime<Utc>) -> String {
    format!(
        "evidence-{}-{}-{}",
        slugify(package_manager, 32),
        slugify(repo, 64),
        at.format("%Y%m%d%H%M%S")
    )
}

/// One build step as recorded in the manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepRecord {
    pub index: usize,
    pub command: String,
    pub status: CommandStatus,
    /// Transcript path relative to the bundle root.
    pub transcript: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Everything needed to interpret a bundle without the run that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleManifest {
    pub name: String,
    pub package_manager: String,
    pub repo: String,
    pub target: BuildTarget,
    pub sandbox: String,
    pub created_at: DateTime<Utc>,
    pub window: CaptureWindow,
    pub completeness: Completeness,
    pub capture: CaptureStats,
    pub build: BuildStatus,
    pub steps: Vec<StepRecord>,
    /// Evidence files relative to the bundle root.
    pub evidence_files: Vec<String>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl BundleManifest {
    /// Length of the build window in milliseconds.
    pub fn elapsed_ms(&self) -> i64 {
        (self.window.stop - self.window.start).num_milliseconds()
    }

    pub fn load(bundle_root: &Path) -> Result<Self, InspectorError> {
        let path = bundle_root.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                InspectorError::Collection(CollectionError::InvalidLayout {
                    path: bundle_root.display().to_string(),
                    reason: format!("missing {}", MANIFEST_FILE),
                })
            } else {
                InspectorError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, bundle_root: &Path) -> Result<(), InspectorError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(bundle_root.join(MANIFEST_FILE), content)?;
        Ok(())
    }
}
