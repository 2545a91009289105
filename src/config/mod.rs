//! Configuration module.

pub mod loader;
pub mod schema;

pub use loader::{default_settings_path, load_config, parse_config, DEFAULT_SETTINGS_FILE};
pub use schema::{
    matches_domain_pattern, validate_domain_pattern, CommandSpec, InspectorConfig, PackageConfig,
    VagrantConfig, DEFAULT_SNAPSHOT_NAME, DEFAULT_WORKDIR,
};
