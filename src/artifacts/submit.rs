//! Atomic commit coordination
//!
//! The depot only offers per-changelist atomicity, so push-level
//! atomicity is built here: staged changes are submitted strictly in
//! order, and the first non-transient failure triggers a compensating
//! revert of everything this push already landed, newest first. A push
//! either lands completely or leaves the depot as it was.
//!
//! Transient store failures are retried with bounded exponential backoff
//! at single-submission granularity; exhausting the retry budget promotes
//! the failure to non-transient.

use crate::artifacts::commit::{BlobSet, Commit};
use crate::artifacts::translate::StagedChange;
use crate::artifacts::trigger::{PreflightPolicy, SubmitTrigger};
use crate::areas::depot::{ChangeId, Depot, PendingChange};
use crate::areas::object_store::ObjectStore;
use crate::errors::{GatewayError, GatewayResult};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Lifecycle of one push through the coordinator.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PushState {
    Pending,
    Submitting,
    Submitted,
    RollingBack,
    RolledBack,
    Failed,
}

impl PushState {
    pub fn may_become(self, next: PushState) -> bool {
        use PushState::*;
        matches!(
            (self, next),
            (Pending, Submitting)
                | (Submitting, Submitted)
                | (Submitting, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, Failed)
        )
    }
}

/// Record of one push attempt: its state and what it has landed so far.
#[derive(Debug)]
pub struct PushAttempt {
    state: PushState,
    submitted: Vec<ChangeId>,
}

impl PushAttempt {
    fn new() -> Self {
        PushAttempt {
            state: PushState::Pending,
            submitted: Vec::new(),
        }
    }

    pub fn state(&self) -> PushState {
        self.state
    }

    pub fn submitted(&self) -> &[ChangeId] {
        &self.submitted
    }

    fn advance(&mut self, next: PushState) {
        debug_assert!(
            self.state.may_become(next),
            "push state {:?} cannot become {:?}",
            self.state,
            next
        );
        tracing::debug!(from = ?self.state, to = ?next, "push state transition");
        self.state = next;
    }
}

/// Retry schedule for transient store failures. Delay doubles per attempt.
#[derive(Debug, Clone, Copy)]
pub struct BackoffParams {
    pub initial: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffParams {
    fn default() -> Self {
        BackoffParams {
            initial: Duration::from_millis(250),
            max_attempts: 5,
        }
    }
}

pub struct AtomicCommitCoordinator<'a> {
    depot: &'a Depot,
    store: &'a ObjectStore,
    session: String,
    pusher: String,
    ignore_author_permissions: bool,
    push_started_at: chrono::DateTime<chrono::FixedOffset>,
    cancelled: Arc<AtomicBool>,
    backoff: BackoffParams,
}

impl<'a> AtomicCommitCoordinator<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        depot: &'a Depot,
        store: &'a ObjectStore,
        session: String,
        pusher: String,
        ignore_author_permissions: bool,
        push_started_at: chrono::DateTime<chrono::FixedOffset>,
        cancelled: Arc<AtomicBool>,
        backoff: BackoffParams,
    ) -> Self {
        AtomicCommitCoordinator {
            depot,
            store,
            session,
            pusher,
            ignore_author_permissions,
            push_started_at,
            cancelled,
            backoff,
        }
    }

    /// Run the repository's preflight policy over every commit. Happens
    /// before any store I/O; a rejection costs nothing to undo.
    pub fn preflight(
        &self,
        policy: &PreflightPolicy,
        commits: &[Commit],
        branch: &str,
    ) -> GatewayResult<()> {
        for commit in commits {
            policy.check(commit, branch, &self.pusher)?;
        }
        Ok(())
    }

    /// Submit every staged change in order, or leave the depot untouched.
    pub fn push(
        &self,
        staged: &[StagedChange],
        blobs: &BlobSet,
        trigger: &dyn SubmitTrigger,
    ) -> GatewayResult<PushAttempt> {
        let mut attempt = PushAttempt::new();
        attempt.advance(PushState::Submitting);

        for change in staged {
            match self.submit_one(change, blobs, trigger) {
                Ok(id) => {
                    attempt.submitted.push(id);
                    tracing::info!(
                        commit = %change.commit_id.to_short(),
                        change = id,
                        "commit landed"
                    );
                }
                Err(source) => return Err(self.roll_back(attempt, change, source)),
            }
        }

        attempt.advance(PushState::Submitted);
        Ok(attempt)
    }

    fn submit_one(
        &self,
        change: &StagedChange,
        blobs: &BlobSet,
        trigger: &dyn SubmitTrigger,
    ) -> GatewayResult<ChangeId> {
        if self.cancelled.load(Ordering::SeqCst) {
            return Err(GatewayError::ClientDisconnected);
        }

        self.check_permissions(change)?;
        self.release_young_foreign_locks(change)?;

        let mut delay = self.backoff.initial;
        let mut attempt_no = 1u32;
        loop {
            match self.attempt_submit(change, blobs, trigger) {
                Ok(id) => return Ok(id),
                Err(e) if e.is_transient() && attempt_no < self.backoff.max_attempts => {
                    tracing::warn!(
                        commit = %change.commit_id.to_short(),
                        attempt = attempt_no,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient store failure, backing off"
                    );
                    std::thread::sleep(delay);
                    delay *= 2;
                    attempt_no += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// One full submission attempt. Blob writes are deduplicating, so
    /// re-running this after a transient failure is safe; a burned
    /// changelist number is acceptable (numbers are never reused).
    fn attempt_submit(
        &self,
        change: &StagedChange,
        blobs: &BlobSet,
        trigger: &dyn SubmitTrigger,
    ) -> GatewayResult<ChangeId> {
        self.depot.ensure_available()?;

        for op in &change.ops {
            if let Some(blob) = op.blob() {
                let content = blobs
                    .get(blob.hash())
                    .map_err(|e| GatewayError::Config(format!("{e:#}")))?;
                self.store.write(blob.hash(), content, blob.flag())?;
            }
        }

        let pending: PendingChange = self.depot.open_change(
            change.commit_id.to_string(),
            change.description.clone(),
            self.session.clone(),
            change.recorded_at,
            change.ops.clone(),
        )?;
        self.depot.submit(&pending, trigger)
    }

    /// Pusher permissions always apply; author permissions apply unless
    /// the repository opts out.
    fn check_permissions(&self, change: &StagedChange) -> GatewayResult<()> {
        for op in &change.ops {
            for path in op.paths() {
                if !self.depot.user_may_write(&self.pusher, path)? {
                    return Err(GatewayError::PermissionDenied {
                        user: self.pusher.clone(),
                        path: path.to_string(),
                    });
                }
                if !self.ignore_author_permissions
                    && change.owner != self.pusher
                    && !self.depot.user_may_write(&change.owner, path)?
                {
                    return Err(GatewayError::PermissionDenied {
                        user: change.owner.clone(),
                        path: path.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// A foreign exclusive lock taken *after* this push began belongs to
    /// someone who raced us; release it and proceed with a warning. Older
    /// locks are left in place for the trigger to reject.
    fn release_young_foreign_locks(&self, change: &StagedChange) -> GatewayResult<()> {
        for op in &change.ops {
            for path in op.paths() {
                if let Some(lock) = self.depot.file_lock(path)?
                    && lock.holder != self.session
                    && lock.acquired_at > self.push_started_at
                {
                    tracing::warn!(
                        path,
                        holder = %lock.holder,
                        "releasing exclusive lock taken mid-push"
                    );
                    self.depot.unlock_file(path)?;
                }
            }
        }
        Ok(())
    }

    /// Compensating revert, newest first. A revert that itself fails
    /// leaves the attempt in `Failed`; everything that was undone is
    /// still reported.
    fn roll_back(
        &self,
        mut attempt: PushAttempt,
        failed: &StagedChange,
        source: GatewayError,
    ) -> GatewayError {
        attempt.advance(PushState::RollingBack);
        tracing::warn!(
            commit = %failed.commit_id.to_short(),
            landed = attempt.submitted.len(),
            error = %source,
            "push failed, rolling back"
        );

        let mut reverted = Vec::new();
        let mut revert_failed = false;
        for id in attempt.submitted.iter().rev() {
            match self.depot.revert(*id) {
                Ok(()) => reverted.push(*id),
                Err(e) => {
                    tracing::error!(change = id, error = %e, "revert failed");
                    revert_failed = true;
                }
            }
        }
        attempt.advance(if revert_failed {
            PushState::Failed
        } else {
            PushState::RolledBack
        });

        GatewayError::PushFailed {
            commit: failed.commit_id.to_string(),
            reverted,
            source: Box::new(source),
        }
    }
}
