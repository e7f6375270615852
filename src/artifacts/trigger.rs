//! Submit triggers and the trigger protocol bridge
//!
//! The depot runs an installed trigger synchronously at every submit
//! boundary. The gateway ships its own trigger, the [`TriggerBridge`],
//! which enforces the invariants the translation relies on: the staged
//! description must not have been tampered with between open and submit,
//! and no foreign session may hold an exclusive lock on a path the
//! changelist touches.
//!
//! Bridge and gateway must speak the same protocol version; version skew
//! after a partial upgrade is detected before any changelist is opened
//! and fails the whole push up front.
//!
//! Separately from the depot-side trigger, a repository may configure a
//! per-commit preflight hook ([`PreflightPolicy`]) that the gateway runs
//! on its own side before translation begins.

use crate::artifacts::commit::{Commit, ContentHash};
use crate::areas::depot::{Depot, PendingChange};
use crate::errors::{GatewayError, GatewayResult};
use std::process::Command;

/// Version of the submit-trigger wire contract. Bumped whenever the
/// trigger's view of the staged data changes shape.
pub const TRIGGER_PROTOCOL_VERSION: u32 = 2;

/// Outcome of a trigger check.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TriggerVerdict {
    Accept,
    Reject(String),
}

/// Runs at the submit boundary, before a pending change becomes durable.
pub trait SubmitTrigger {
    fn pre_submit_check(&self, depot: &Depot, pending: &PendingChange) -> TriggerVerdict;
}

/// Trigger that accepts every submission. Used for administrative
/// operations that bypass gateway checks, and in tests.
pub struct AcceptAll;

impl SubmitTrigger for AcceptAll {
    fn pre_submit_check(&self, _depot: &Depot, _pending: &PendingChange) -> TriggerVerdict {
        TriggerVerdict::Accept
    }
}

/// The gateway's installed trigger.
///
/// Owned by one push: it knows the pushing session and when the push
/// started, so it can tell locks that predate the push from locks the
/// push itself created.
pub struct TriggerBridge {
    session: String,
    push_started_at: chrono::DateTime<chrono::FixedOffset>,
}

impl TriggerBridge {
    pub fn new(session: String, push_started_at: chrono::DateTime<chrono::FixedOffset>) -> Self {
        TriggerBridge {
            session,
            push_started_at,
        }
    }

    /// Compare the depot's installed trigger version with ours. Any
    /// mismatch is fatal for the push; running with skewed halves could
    /// let an unchecked changelist through.
    pub fn negotiate(&self, depot: &Depot) -> GatewayResult<()> {
        let theirs = depot.trigger_version()?;
        if theirs != TRIGGER_PROTOCOL_VERSION {
            return Err(GatewayError::TriggerVersionMismatch {
                ours: TRIGGER_PROTOCOL_VERSION,
                theirs,
            });
        }
        tracing::debug!(version = theirs, "trigger protocol negotiated");
        Ok(())
    }
}

impl SubmitTrigger for TriggerBridge {
    fn pre_submit_check(&self, depot: &Depot, pending: &PendingChange) -> TriggerVerdict {
        // the description seen at submit must be the one staged at open
        let digest = ContentHash::of(pending.description.as_bytes()).to_string();
        if digest != pending.staged_digest {
            return TriggerVerdict::Reject(format!(
                "staged description for change {} was modified after open",
                pending.id
            ));
        }

        // a foreign exclusive lock taken before this push started means
        // another writer got there first
        for op in &pending.ops {
            for path in op.paths() {
                let lock = match depot.file_lock(path) {
                    Ok(lock) => lock,
                    Err(e) => return TriggerVerdict::Reject(format!("lock lookup failed: {e}")),
                };
                if let Some(lock) = lock
                    && lock.holder != self.session
                    && lock.acquired_at <= self.push_started_at
                {
                    return TriggerVerdict::Reject(format!(
                        "{} is exclusively locked by {}",
                        path, lock.holder
                    ));
                }
            }
        }

        TriggerVerdict::Accept
    }
}

/// Per-commit preflight hook configured with `preflight-commit`.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PreflightPolicy {
    /// No preflight configured.
    #[default]
    None,
    /// Accept every commit, logging the given note.
    Pass(String),
    /// Reject every commit with the given reason. Useful to freeze a repo.
    Fail(String),
    /// Run an external command; a non-zero exit rejects the commit.
    Cmd(Vec<String>),
}

impl PreflightPolicy {
    pub fn parse(value: &str) -> GatewayResult<Self> {
        let value = value.trim();
        if value.is_empty() || value == "none" {
            return Ok(PreflightPolicy::None);
        }
        if let Some(note) = Self::keyword_rest(value, "pass") {
            return Ok(PreflightPolicy::Pass(note.to_string()));
        }
        if let Some(reason) = Self::keyword_rest(value, "fail") {
            return Ok(PreflightPolicy::Fail(reason.to_string()));
        }
        if let Some(cmdline) = Self::keyword_rest(value, "cmd") {
            let argv: Vec<String> = cmdline.split_whitespace().map(str::to_string).collect();
            if argv.is_empty() {
                return Err(GatewayError::Config(
                    "preflight-commit cmd needs a command line".to_string(),
                ));
            }
            return Ok(PreflightPolicy::Cmd(argv));
        }
        Err(GatewayError::Config(format!(
            "preflight-commit must be none, pass, fail or cmd, got '{}'",
            value
        )))
    }

    fn keyword_rest<'a>(value: &'a str, keyword: &str) -> Option<&'a str> {
        if value == keyword {
            return Some("");
        }
        value
            .strip_prefix(keyword)
            .filter(|rest| rest.starts_with(' '))
            .map(str::trim)
    }

    /// Check one commit before translation. External commands see the
    /// commit id, branch and pusher in the environment.
    pub fn check(&self, commit: &Commit, branch: &str, pusher: &str) -> GatewayResult<()> {
        match self {
            PreflightPolicy::None => Ok(()),
            PreflightPolicy::Pass(note) => {
                if !note.is_empty() {
                    tracing::info!(commit = %commit.id(), note, "preflight pass");
                }
                Ok(())
            }
            PreflightPolicy::Fail(reason) => Err(GatewayError::PreflightRejected {
                commit: commit.id().to_string(),
                reason: if reason.is_empty() {
                    "rejected by preflight policy".to_string()
                } else {
                    reason.clone()
                },
            }),
            PreflightPolicy::Cmd(argv) => {
                let output = Command::new(&argv[0])
                    .args(&argv[1..])
                    .env("GITDEPOT_COMMIT", commit.id().to_string())
                    .env("GITDEPOT_BRANCH", branch)
                    .env("GITDEPOT_PUSHER", pusher)
                    .output()
                    .map_err(|e| GatewayError::PreflightRejected {
                        commit: commit.id().to_string(),
                        reason: format!("preflight command '{}' failed to run: {e}", argv[0]),
                    })?;
                if output.status.success() {
                    return Ok(());
                }
                let stderr = String::from_utf8_lossy(&output.stderr);
                let reason = match stderr.trim() {
                    "" => format!("preflight command exited with {}", output.status),
                    detail => detail.to_string(),
                };
                Err(GatewayError::PreflightRejected {
                    commit: commit.id().to_string(),
                    reason,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::commit::Author;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn temp_depot() -> (assert_fs::TempDir, Depot) {
        let dir = assert_fs::TempDir::new().unwrap();
        let depot = Depot::new(dir.path().to_path_buf().into_boxed_path());
        depot.init(TRIGGER_PROTOCOL_VERSION).unwrap();
        (dir, depot)
    }

    fn pending(depot: &Depot, session: &str) -> PendingChange {
        depot
            .open_change(
                "d".repeat(40),
                "a change".to_string(),
                session.to_string(),
                chrono::Local::now().fixed_offset(),
                vec![crate::areas::depot::DepotOp::Delete {
                    path: "//depot/main/a.txt".into(),
                }],
            )
            .unwrap()
    }

    fn sample_commit() -> Commit {
        let author = Author::new("Alice".into(), "alice@example.com".into());
        Commit::new(
            ContentHash::of(b"commit"),
            vec![],
            author.clone(),
            author,
            "message".into(),
            vec![],
        )
    }

    #[test]
    fn negotiate_accepts_matching_version() {
        let (_dir, depot) = temp_depot();
        let bridge = TriggerBridge::new("s".into(), chrono::Local::now().fixed_offset());
        bridge.negotiate(&depot).unwrap();
    }

    #[test]
    fn negotiate_rejects_version_skew() {
        let (_dir, depot) = temp_depot();
        depot.write_trigger_version(TRIGGER_PROTOCOL_VERSION + 1).unwrap();
        let bridge = TriggerBridge::new("s".into(), chrono::Local::now().fixed_offset());
        let err = bridge.negotiate(&depot).unwrap_err();
        assert!(matches!(
            err,
            GatewayError::TriggerVersionMismatch { ours, theirs }
                if ours == TRIGGER_PROTOCOL_VERSION && theirs == TRIGGER_PROTOCOL_VERSION + 1
        ));
    }

    #[test]
    fn bridge_rejects_tampered_description() {
        let (_dir, depot) = temp_depot();
        let bridge = TriggerBridge::new("sess".into(), chrono::Local::now().fixed_offset());
        let mut change = pending(&depot, "sess");
        change.description.push_str(" (edited)");
        assert!(matches!(
            bridge.pre_submit_check(&depot, &change),
            TriggerVerdict::Reject(_)
        ));
    }

    #[test]
    fn bridge_rejects_preexisting_foreign_lock() {
        let (_dir, depot) = temp_depot();
        depot.lock_file("//depot/main/a.txt", "other-session").unwrap();

        // push starts after the foreign lock was taken
        let started = chrono::Local::now().fixed_offset() + chrono::Duration::seconds(5);
        let bridge = TriggerBridge::new("sess".into(), started);
        let change = pending(&depot, "sess");
        let verdict = bridge.pre_submit_check(&depot, &change);
        assert!(
            matches!(verdict, TriggerVerdict::Reject(ref reason) if reason.contains("other-session"))
        );
    }

    #[test]
    fn bridge_ignores_own_locks() {
        let (_dir, depot) = temp_depot();
        depot.lock_file("//depot/main/a.txt", "sess").unwrap();
        let started = chrono::Local::now().fixed_offset() + chrono::Duration::seconds(5);
        let bridge = TriggerBridge::new("sess".into(), started);
        let change = pending(&depot, "sess");
        assert_eq!(bridge.pre_submit_check(&depot, &change), TriggerVerdict::Accept);
    }

    #[rstest]
    #[case("none", PreflightPolicy::None)]
    #[case("", PreflightPolicy::None)]
    #[case("pass", PreflightPolicy::Pass(String::new()))]
    #[case("pass looks fine", PreflightPolicy::Pass("looks fine".to_string()))]
    #[case("fail repo is frozen", PreflightPolicy::Fail("repo is frozen".to_string()))]
    fn preflight_values_parse(#[case] raw: &str, #[case] expected: PreflightPolicy) {
        assert_eq!(PreflightPolicy::parse(raw).unwrap(), expected);
    }

    #[test]
    fn preflight_command_value_keeps_arguments() {
        let policy = PreflightPolicy::parse("cmd /usr/bin/check --strict").unwrap();
        assert_eq!(
            policy,
            PreflightPolicy::Cmd(vec!["/usr/bin/check".into(), "--strict".into()])
        );
        assert!(PreflightPolicy::parse("sometimes").is_err());
        assert!(PreflightPolicy::parse("cmd").is_err());
    }

    #[test]
    fn fail_policy_rejects_with_reason() {
        let policy = PreflightPolicy::parse("fail frozen for release").unwrap();
        let err = policy.check(&sample_commit(), "main", "alice").unwrap_err();
        assert!(matches!(
            err,
            GatewayError::PreflightRejected { reason, .. } if reason == "frozen for release"
        ));
    }

    #[test]
    fn command_policy_runs_external_check() {
        let policy = PreflightPolicy::Cmd(vec!["true".into()]);
        policy.check(&sample_commit(), "main", "alice").unwrap();

        let policy = PreflightPolicy::Cmd(vec!["false".into()]);
        assert!(policy.check(&sample_commit(), "main", "alice").is_err());
    }
}
