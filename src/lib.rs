//! Bidirectional gateway between Git clients and a centralized depot
//!
//! Git pushes are translated commit-by-commit into numbered depot
//! changelists, atomically at push granularity: a failure anywhere rolls
//! back every changelist the push created. Fetches reconstruct the commit
//! sequence from the depot records.
//!
//! - [`areas`]: depot engine, object store, repository locks, orchestration
//! - [`artifacts`]: bundles, mapping, translation, submission, triggers
//! - [`errors`]: the gateway error type shared across both

pub mod areas;
pub mod artifacts;
pub mod errors;
