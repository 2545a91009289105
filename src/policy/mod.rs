//! Whitelist policy: the permitted network destinations for a build.

mod whitelist;

pub use whitelist::{MatchRule, PolicyVersion, WhitelistPolicy};
