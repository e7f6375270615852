//! Fetch reconstruction: depot changelists back to Git commits
//!
//! The inverse of push translation, at interface level: walk submitted
//! changelists oldest first, keep those carrying a preserved-metadata
//! block for the requested branch, inverse-map every depot path through
//! the view and rebuild the commit with its original author, committer,
//! message, id and parents. Content comes back out of the object store.
//!
//! Changes submitted outside the gateway (no metadata block) and changes
//! for other branches are skipped, not errors.

use crate::artifacts::commit::{Author, BlobSet, Commit, ContentHash, FileChange};
use crate::artifacts::mapping::view::ViewMap;
use crate::artifacts::translate::DescInfo;
use crate::areas::depot::{Depot, DepotOp};
use crate::areas::object_store::ObjectStore;
use crate::errors::{GatewayError, GatewayResult};
use std::collections::HashSet;

pub struct FetchReconstructor<'a> {
    depot: &'a Depot,
    store: &'a ObjectStore,
    view: &'a ViewMap,
    branch: &'a str,
}

impl<'a> FetchReconstructor<'a> {
    pub fn new(
        depot: &'a Depot,
        store: &'a ObjectStore,
        view: &'a ViewMap,
        branch: &'a str,
    ) -> Self {
        FetchReconstructor {
            depot,
            store,
            view,
            branch,
        }
    }

    /// Rebuild the branch's commit sequence, oldest first, together with
    /// the content the commits reference.
    pub fn reconstruct(&self) -> GatewayResult<(Vec<Commit>, BlobSet)> {
        self.depot.ensure_available()?;

        let mut commits = Vec::new();
        let mut blobs = BlobSet::default();

        for id in self.depot.list_change_ids()? {
            let record = self.depot.read_change(id)?;
            let Some((message, info)) = DescInfo::extract(&record.description) else {
                tracing::debug!(change = id, "no gateway metadata, skipping");
                continue;
            };
            if info.branch != self.branch {
                continue;
            }

            let changes = self.rebuild_changes(id, &record.ops, &mut blobs)?;
            if changes.is_empty() {
                continue;
            }

            let corrupt = || GatewayError::CorruptChangeRecord(id);
            let commit_id =
                ContentHash::try_parse(info.commit_id.clone()).map_err(|_| corrupt())?;
            let parents = info
                .parents
                .iter()
                .map(|p| ContentHash::try_parse(p.clone()).map_err(|_| corrupt()))
                .collect::<GatewayResult<Vec<_>>>()?;
            let author = Author::try_from(info.author.as_str()).map_err(|_| corrupt())?;
            let committer = Author::try_from(info.committer.as_str()).map_err(|_| corrupt())?;

            commits.push(Commit::new(
                commit_id, parents, author, committer, message, changes,
            ));
        }

        tracing::info!(
            branch = self.branch,
            commits = commits.len(),
            "reconstructed branch history"
        );
        Ok((commits, blobs))
    }

    /// Depot ops back to file changes. Overlay views land one git path at
    /// several depot paths; the inverse keeps the first and drops the
    /// echoes.
    fn rebuild_changes(
        &self,
        change: crate::areas::depot::ChangeId,
        ops: &[DepotOp],
        blobs: &mut BlobSet,
    ) -> GatewayResult<Vec<FileChange>> {
        let mut changes = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();

        for op in ops {
            match op {
                DepotOp::Add { path, blob } => {
                    let Some(git_path) = self.view.invert(path) else {
                        continue;
                    };
                    if !seen.insert(git_path.clone()) {
                        continue;
                    }
                    let hash = self.load_blob(blob, blobs)?;
                    changes.push(FileChange::Add {
                        path: git_path,
                        hash,
                    });
                }
                DepotOp::Edit { path, blob } => {
                    let Some(git_path) = self.view.invert(path) else {
                        continue;
                    };
                    if !seen.insert(git_path.clone()) {
                        continue;
                    }
                    let hash = self.load_blob(blob, blobs)?;
                    changes.push(FileChange::Modify {
                        path: git_path,
                        hash,
                    });
                }
                DepotOp::Delete { path } => {
                    let Some(git_path) = self.view.invert(path) else {
                        continue;
                    };
                    if !seen.insert(git_path.clone()) {
                        continue;
                    }
                    changes.push(FileChange::Delete { path: git_path });
                }
                DepotOp::Move { from, to, blob } => {
                    let from_git = self.view.invert(from);
                    let Some(to_git) = self.view.invert(to) else {
                        continue;
                    };
                    if !seen.insert(to_git.clone()) {
                        continue;
                    }
                    let hash = self.load_blob(blob, blobs)?;
                    match from_git {
                        Some(from_git) => changes.push(FileChange::Rename {
                            from: from_git,
                            to: to_git,
                            hash,
                        }),
                        // source fell outside the view; all we can say is
                        // that the destination appeared
                        None => changes.push(FileChange::Add {
                            path: to_git,
                            hash,
                        }),
                    }
                }
            }
        }

        if changes.is_empty() && !ops.is_empty() {
            tracing::debug!(change, "change lies outside the branch view");
        }
        Ok(changes)
    }

    fn load_blob(
        &self,
        blob: &crate::areas::object_store::BlobRef,
        blobs: &mut BlobSet,
    ) -> GatewayResult<ContentHash> {
        let content = self.store.read(blob)?;
        let hash = blobs.insert(content);
        debug_assert_eq!(&hash, blob.hash());
        Ok(hash)
    }
}
