//! Utility modules.

pub mod debug;
pub mod path;
pub mod shell;

pub use debug::{init_logging, Verbosity, DEBUG_ENV};
pub use path::{copy_dir_recursive, enclosed_join, expand_home, slugify};
pub use shell::{join_args, quote, quote_glob, split_args};
