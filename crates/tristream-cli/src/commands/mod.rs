//! CLI commands.

pub mod run;
pub mod snapshots;
pub mod validate;
