//! Build Inspector - audit the network behavior of a software build.
//!
//! A build runs inside a disposable virtual machine that is snapshotted
//! beforehand. Traffic is captured for exactly the duration of the build,
//! packaged into an evidence bundle together with command transcripts, and
//! every destination is classified against a host whitelist:
//! - `Whitelisted`: matched a whitelist rule
//! - `Unauthorized`: resolved to an address no rule allows
//! - `Unresolvable`: could not be resolved or parsed, never silently dropped

pub mod build;
pub mod capture;
pub mod cli;
pub mod config;
pub mod error;
pub mod evidence;
pub mod inspector;
pub mod policy;
pub mod processor;
pub mod report;
pub mod sandbox;
pub mod utils;

pub use config::{CommandSpec, InspectorConfig, PackageConfig, VagrantConfig};
pub use error::{CaptureError, CollectionError, ConfigError, InspectorError, Result};
pub use inspector::{process_only, BuildInspector, RunOptions, RunOutcome};
pub use policy::WhitelistPolicy;
pub use processor::{NetworkEvidenceProcessor, ProcessingReport, Verdict};

/// Re-export commonly used items.
pub mod prelude {
    pub use crate::build::{BuildExecutor, BuildTarget};
    pub use crate::capture::{NetworkEvent, TrafficCapture};
    pub use crate::config::InspectorConfig;
    pub use crate::error::{InspectorError, Result};
    pub use crate::inspector::{BuildInspector, RunOptions};
    pub use crate::processor::{Classification, Finding, NetworkEvidenceProcessor};
    pub use crate::sandbox::{Hypervisor, SandboxController};
}
