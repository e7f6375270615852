//! Gateway error taxonomy
//!
//! Errors fall into four buckets that drive very different handling:
//!
//! - configuration errors: fatal, reported before any depot I/O begins
//! - transient store errors: retried with bounded backoff, one submission
//!   at a time
//! - non-transient submission errors: roll back the whole push
//! - lock conflicts: acquisition blocks, file-level locks follow the
//!   unlock-and-proceed policy
//!
//! `GatewayError::is_transient` is the single classification point the
//! coordinator consults when deciding between retry and rollback.

use thiserror::Error;

/// Result type for gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("git branch '{0}' has no mapping entry and branch creation is disabled")]
    UnmappedBranch(String),

    #[error(
        "conflicting branch mappings: sections '{left}' and '{right}' both target '{target}' \
         for intersecting git paths"
    )]
    ConflictingMapping {
        left: String,
        right: String,
        target: String,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("merge commit {0} rejected: enable-git-merge-commits is set to 'no'")]
    MergeCommitsDisabled(String),

    #[error("depot unavailable: {0}")]
    StoreUnavailable(String),

    #[error("depot path '{path}' is exclusively locked by session '{holder}'")]
    StoreWriteConflict { path: String, holder: String },

    #[error("cannot express rename '{from}' -> '{to}' with depot move semantics: {reason}")]
    UnresolvedRename {
        from: String,
        to: String,
        reason: String,
    },

    #[error("trigger protocol mismatch: gateway speaks version {ours}, depot trigger speaks {theirs}")]
    TriggerVersionMismatch { ours: u32, theirs: u32 },

    #[error("commit {commit} rejected by depot trigger: {reason}")]
    TriggerRejected { commit: String, reason: String },

    #[error("commit {commit} rejected by preflight hook: {reason}")]
    PreflightRejected { commit: String, reason: String },

    #[error("user '{user}' lacks write permission for '{path}'")]
    PermissionDenied { user: String, path: String },

    #[error("illegal depot filename '{path}': {reason}")]
    InvalidFilename { path: String, reason: String },

    #[error("push cancelled: client disconnected")]
    ClientDisconnected,

    #[error("malformed change record {0}")]
    CorruptChangeRecord(u64),

    /// Terminal push failure: the originating commit, the reason, and every
    /// changelist that was reverted to restore pre-push state.
    #[error("push failed at commit {commit}: {source}{}", reverted_suffix(.reverted))]
    PushFailed {
        commit: String,
        reverted: Vec<u64>,
        #[source]
        source: Box<GatewayError>,
    },
}

fn reverted_suffix(reverted: &[u64]) -> String {
    if reverted.is_empty() {
        String::new()
    } else {
        let ids = reverted
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(" (reverted changelists: {})", ids)
    }
}

impl GatewayError {
    /// Only connectivity-style store failures are worth retrying; everything
    /// else either poisons the push or the configuration.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::StoreUnavailable(_))
    }

    /// Configuration errors must surface before any depot I/O begins.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            GatewayError::UnmappedBranch(_)
                | GatewayError::ConflictingMapping { .. }
                | GatewayError::Config(_)
                | GatewayError::MergeCommitsDisabled(_)
        )
    }
}
