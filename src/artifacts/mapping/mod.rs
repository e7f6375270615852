//! Branch mapping: which Git branch lands where in the depot
//!
//! - `config`: INI repository config with per-branch mapping entries
//! - `view`: ordered include/exclude/overlay path-translation rules

pub mod config;
pub mod view;
