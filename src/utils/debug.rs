//! Logging setup and the verbosity value threaded through components.

use tracing_subscriber::EnvFilter;

/// Environment variable that forces verbose output.
pub const DEBUG_ENV: &str = "BUILD_INSPECTOR_DEBUG";

/// Verbosity of a run. Passed to constructors instead of living in a global.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Verbosity {
    verbose: bool,
}

impl Verbosity {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn quiet() -> Self {
        Self { verbose: false }
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Initialize logging from the `--verbose` flag or the BUILD_INSPECTOR_DEBUG variable.
pub fn init_logging(force_verbose: bool) -> Verbosity {
    let verbose = force_verbose || std::env::var(DEBUG_ENV).is_ok();

    let filter = if verbose {
        EnvFilter::new("build_inspector=debug,warn")
    } else {
        EnvFilter::new("build_inspector=info,warn")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(verbose)
        .with_ansi(true)
        .try_init()
        .ok();

    Verbosity::new(verbose)
}
