//! Gateway orchestration
//!
//! One `Gateway` binds a repository id to a depot root and drives the
//! whole flow for each operation: load the mapping snapshot, resolve the
//! branch view, negotiate the trigger protocol, take the repository lock,
//! translate, coordinate, release. The repository lock guard releases on
//! every exit path, including panics further down.

use crate::artifacts::bundle::{BundleWriter, PushBundle};
use crate::artifacts::commit::Commit;
use crate::artifacts::fetch::FetchReconstructor;
use crate::artifacts::mapping::config::{BranchMapping, default_config};
use crate::artifacts::submit::{AtomicCommitCoordinator, BackoffParams};
use crate::artifacts::translate::PushTranslator;
use crate::artifacts::trigger::{TRIGGER_PROTOCOL_VERSION, TriggerBridge};
use crate::areas::depot::{ChangeId, Depot};
use crate::areas::locks::{LockParams, RepoLock, reap_abandoned};
use crate::areas::object_store::ObjectStore;
use anyhow::Context;
use bytes::Bytes;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Outcome of a completed push, for reporting to the client.
#[derive(Debug)]
pub struct PushReport {
    pub branch: String,
    pub commits: usize,
    pub changes: Vec<ChangeId>,
    pub lock_stolen: bool,
}

pub struct Gateway {
    depot: Arc<Depot>,
    store: ObjectStore,
    repo_id: String,
    lock_params: LockParams,
    backoff: BackoffParams,
    cancelled: Arc<AtomicBool>,
}

impl Gateway {
    pub fn new(depot_root: PathBuf, repo_id: &str) -> Self {
        let depot = Arc::new(Depot::new(depot_root.into_boxed_path()));
        let store = ObjectStore::new(depot.objects_path().into_boxed_path());
        Gateway {
            depot,
            store,
            repo_id: repo_id.to_string(),
            lock_params: LockParams::default(),
            backoff: BackoffParams::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_lock_params(mut self, params: LockParams) -> Self {
        self.lock_params = params;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffParams) -> Self {
        self.backoff = backoff;
        self
    }

    /// Flag polled between submissions; setting it aborts the push as a
    /// client disconnect.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancelled.clone()
    }

    pub fn depot(&self) -> &Arc<Depot> {
        &self.depot
    }

    fn config_path(&self) -> PathBuf {
        self.depot
            .root()
            .join("repos")
            .join(&self.repo_id)
            .join("config")
    }

    /// Create the depot layout and a default repository config. Existing
    /// config files are left alone, so re-running init is safe.
    pub fn init(&self, description: &str) -> anyhow::Result<()> {
        self.depot.init(TRIGGER_PROTOCOL_VERSION)?;
        let config_path = self.config_path();
        if config_path.exists() {
            tracing::info!(repo = %self.repo_id, "config already present, keeping it");
            return Ok(());
        }
        let config_dir = config_path
            .parent()
            .context("repository config path has no parent")?;
        std::fs::create_dir_all(config_dir).context("unable to create repository directory")?;
        std::fs::write(&config_path, default_config(description))
            .context("unable to write default config")?;
        tracing::info!(repo = %self.repo_id, "initialized repository");
        Ok(())
    }

    /// Parse and cross-validate the repository config.
    pub fn validate_config(&self) -> anyhow::Result<BranchMapping> {
        let mapping = BranchMapping::load(&self.config_path())?;
        tracing::info!(
            repo = %self.repo_id,
            branches = mapping.entries().len(),
            "config is valid"
        );
        Ok(mapping)
    }

    /// Translate and land a push bundle on `branch` as `pusher`.
    pub fn push(&self, branch: &str, bundle: &[u8], pusher: &str) -> anyhow::Result<PushReport> {
        let push_started_at = chrono::Local::now().fixed_offset();
        let session = format!("git-{}-push-{}", self.repo_id, std::process::id());

        // config errors and version skew fail before any store write
        let mapping = BranchMapping::load(&self.config_path())?;
        let view = mapping.view_for(branch)?;
        let bundle = PushBundle::parse(bundle).context("unable to parse push bundle")?;

        let bridge = TriggerBridge::new(session.clone(), push_started_at);
        bridge.negotiate(&self.depot)?;

        let mut lock = RepoLock::acquire(
            self.depot.clone(),
            &self.repo_id,
            pusher,
            self.lock_params,
        )?;
        let lock_stolen = lock.was_stolen();

        let options = mapping.options();
        let coordinator = AtomicCommitCoordinator::new(
            &self.depot,
            &self.store,
            session,
            pusher.to_string(),
            options.ignore_author_permissions,
            push_started_at,
            self.cancelled.clone(),
            self.backoff,
        );
        coordinator.preflight(&options.preflight, bundle.commits(), branch)?;

        let staged = PushTranslator::new(&view, options, branch, pusher, push_started_at)
            .translate(bundle.commits(), bundle.blobs())?;
        let attempt = coordinator.push(&staged, bundle.blobs(), &bridge)?;

        lock.release()?;
        Ok(PushReport {
            branch: branch.to_string(),
            commits: bundle.commits().len(),
            changes: attempt.submitted().to_vec(),
            lock_stolen,
        })
    }

    /// Reconstruct `branch` from the depot and render it as a bundle
    /// stream.
    pub fn fetch(&self, branch: &str) -> anyhow::Result<Bytes> {
        let mapping = BranchMapping::load(&self.config_path())?;
        let view = mapping.view_for(branch)?;

        let mut lock = RepoLock::acquire(
            self.depot.clone(),
            &self.repo_id,
            "fetch",
            self.lock_params,
        )?;

        let (commits, blobs) =
            FetchReconstructor::new(&self.depot, &self.store, &view, branch).reconstruct()?;
        lock.release()?;

        Ok(render_bundle(&commits, &blobs)?)
    }

    /// Clear the repository lock if its holder is dead. Returns whether a
    /// lock was reaped.
    pub fn reap(&self) -> anyhow::Result<bool> {
        Ok(reap_abandoned(&self.depot, &self.repo_id, self.lock_params)?)
    }
}

/// Serialize commits plus their content as a bundle stream, each blob
/// once, in first-reference order.
fn render_bundle(
    commits: &[Commit],
    blobs: &crate::artifacts::commit::BlobSet,
) -> anyhow::Result<Bytes> {
    let mut writer = BundleWriter::default();
    let mut emitted = HashSet::new();
    for commit in commits {
        for change in commit.changes() {
            if let Some(hash) = change.content_hash()
                && emitted.insert(hash.clone())
            {
                writer.blob(blobs.get(hash)?);
            }
        }
    }
    for commit in commits {
        writer.commit(commit);
    }
    Ok(writer.finish())
}
