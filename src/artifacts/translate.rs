//! Push translation: Git commits to staged depot changelists
//!
//! The translator is pure with respect to the store: it consumes an
//! oldest-first commit sequence plus the branch's view and emits one
//! `StagedChange` per landing commit, without touching the depot. The
//! coordinator later turns each staged change into a real changelist.
//!
//! Git metadata survives the translation inside a structured block
//! appended to the change description; the depot record's date is the
//! *push* time, so depot chronology follows submit order rather than
//! however old the commits happen to be.

use crate::artifacts::commit::{BlobSet, Commit, ContentHash, FileChange};
use crate::artifacts::mapping::config::{ChangeOwner, RepoOptions};
use crate::artifacts::mapping::view::ViewMap;
use crate::areas::depot::DepotOp;
use crate::areas::object_store::{BlobRef, StorageFlag};
use crate::errors::{GatewayError, GatewayResult};

/// One commit translated into depot terms, not yet submitted.
#[derive(Debug, Clone)]
pub struct StagedChange {
    pub commit_id: ContentHash,
    pub description: String,
    pub owner: String,
    pub recorded_at: chrono::DateTime<chrono::FixedOffset>,
    pub ops: Vec<DepotOp>,
}

/// Git metadata preserved inside a change description.
///
/// Appended as an indented block after the original commit message so the
/// fetch side can reconstruct author, committer, commit id and parents.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DescInfo {
    pub author: String,
    pub committer: String,
    pub commit_id: String,
    pub parents: Vec<String>,
    pub branch: String,
    pub owner: String,
}

const DESC_INFO_MARKER: &str = "Imported from Git";

impl DescInfo {
    pub fn append_to(&self, message: &str) -> String {
        let mut out = String::from(message);
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
        out.push_str(DESC_INFO_MARKER);
        out.push('\n');
        out.push_str(&format!(" Author: {}\n", self.author));
        out.push_str(&format!(" Committer: {}\n", self.committer));
        out.push_str(&format!(" sha1: {}\n", self.commit_id));
        if !self.parents.is_empty() {
            out.push_str(&format!(" parents: {}\n", self.parents.join(" ")));
        }
        out.push_str(&format!(" branch: {}\n", self.branch));
        out.push_str(&format!(" owner: {}\n", self.owner));
        out
    }

    /// Split a change description back into the original message and the
    /// preserved metadata. `None` when the description carries no block,
    /// which marks a change that did not come through the gateway.
    pub fn extract(description: &str) -> Option<(String, DescInfo)> {
        let marker = format!("\n{}\n", DESC_INFO_MARKER);
        let start = description.rfind(&marker)?;
        let message = description[..start]
            .trim_end_matches('\n')
            .to_string();

        let mut author = None;
        let mut committer = None;
        let mut commit_id = None;
        let mut parents = Vec::new();
        let mut branch = None;
        let mut owner = None;
        for line in description[start + marker.len()..].lines() {
            let line = line.trim_start();
            if let Some(v) = line.strip_prefix("Author: ") {
                author = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("Committer: ") {
                committer = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("sha1: ") {
                commit_id = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("parents: ") {
                parents = v.split(' ').map(str::to_string).collect();
            } else if let Some(v) = line.strip_prefix("branch: ") {
                branch = Some(v.to_string());
            } else if let Some(v) = line.strip_prefix("owner: ") {
                owner = Some(v.to_string());
            }
        }

        Some((
            message,
            DescInfo {
                author: author?,
                committer: committer?,
                commit_id: commit_id?,
                parents,
                branch: branch?,
                owner: owner?,
            },
        ))
    }
}

pub struct PushTranslator<'a> {
    view: &'a ViewMap,
    options: &'a RepoOptions,
    branch: &'a str,
    pusher: &'a str,
    push_started_at: chrono::DateTime<chrono::FixedOffset>,
}

impl<'a> PushTranslator<'a> {
    pub fn new(
        view: &'a ViewMap,
        options: &'a RepoOptions,
        branch: &'a str,
        pusher: &'a str,
        push_started_at: chrono::DateTime<chrono::FixedOffset>,
    ) -> Self {
        PushTranslator {
            view,
            options,
            branch,
            pusher,
            push_started_at,
        }
    }

    /// Translate the whole commit sequence. Fails on the first commit that
    /// cannot be expressed; nothing has touched the store at that point.
    pub fn translate(
        &self,
        commits: &[Commit],
        blobs: &BlobSet,
    ) -> GatewayResult<Vec<StagedChange>> {
        let mut staged = Vec::with_capacity(commits.len());
        for commit in commits {
            if let Some(change) = self.translate_commit(commit, blobs)? {
                staged.push(change);
            }
        }
        Ok(staged)
    }

    fn translate_commit(
        &self,
        commit: &Commit,
        blobs: &BlobSet,
    ) -> GatewayResult<Option<StagedChange>> {
        if commit.is_merge() && !self.options.enable_merge_commits {
            return Err(GatewayError::MergeCommitsDisabled(commit.id().to_string()));
        }

        let mut ops = Vec::new();
        for change in commit.changes() {
            self.validate_filename(change.path())?;
            match change {
                FileChange::Add { path, hash } => {
                    let blob = self.blob_ref(hash, blobs)?;
                    for target in self.view.translate(path) {
                        ops.push(DepotOp::Add {
                            path: target,
                            blob: blob.clone(),
                        });
                    }
                }
                FileChange::Modify { path, hash } => {
                    let blob = self.blob_ref(hash, blobs)?;
                    for target in self.view.translate(path) {
                        ops.push(DepotOp::Edit {
                            path: target,
                            blob: blob.clone(),
                        });
                    }
                }
                FileChange::Delete { path } => {
                    for target in self.view.translate(path) {
                        ops.push(DepotOp::Delete { path: target });
                    }
                }
                FileChange::Rename { from, to, hash } => {
                    self.validate_filename(from)?;
                    let blob = self.blob_ref(hash, blobs)?;
                    ops.extend(self.translate_rename(from, to, &blob)?);
                }
            }
        }

        if ops.is_empty() {
            tracing::info!(
                commit = %commit.id().to_short(),
                "commit touches only excluded paths, skipping"
            );
            return Ok(None);
        }

        let owner = match self.options.change_owner {
            ChangeOwner::Author => identity_of(commit.author().email()),
            ChangeOwner::Pusher => self.pusher.to_string(),
        };
        let info = DescInfo {
            author: commit.author().display(),
            committer: commit.committer().display(),
            commit_id: commit.id().to_string(),
            parents: commit.parents().iter().map(|p| p.to_string()).collect(),
            branch: self.branch.to_string(),
            owner: owner.clone(),
        };

        Ok(Some(StagedChange {
            commit_id: commit.id().clone(),
            description: info.append_to(commit.message()),
            owner,
            recorded_at: self.push_started_at,
            ops,
        }))
    }

    /// A rename maps to a depot-native move only when both sides project
    /// to exactly one target. One-sided exclusions degrade to the
    /// surviving half; overlays on one side degrade to add+delete; a
    /// rename whose both sides are multi-target cannot be paired.
    fn translate_rename(
        &self,
        from: &str,
        to: &str,
        blob: &BlobRef,
    ) -> GatewayResult<Vec<DepotOp>> {
        let from_targets = self.view.translate(from);
        let to_targets = self.view.translate(to);

        match (from_targets.len(), to_targets.len()) {
            (0, 0) => Ok(Vec::new()),
            (_, 0) => Ok(from_targets
                .into_iter()
                .map(|path| DepotOp::Delete { path })
                .collect()),
            (0, _) => Ok(to_targets
                .into_iter()
                .map(|path| DepotOp::Add {
                    path,
                    blob: blob.clone(),
                })
                .collect()),
            (1, 1) => Ok(vec![DepotOp::Move {
                from: from_targets.into_iter().next().unwrap_or_default(),
                to: to_targets.into_iter().next().unwrap_or_default(),
                blob: blob.clone(),
            }]),
            (f, t) if f > 1 && t > 1 => Err(GatewayError::UnresolvedRename {
                from: from.to_string(),
                to: to.to_string(),
                reason: "source and destination each map to multiple depot paths".to_string(),
            }),
            _ => {
                tracing::warn!(from, to, "rename spans overlay targets, using add+delete");
                let mut ops: Vec<DepotOp> = to_targets
                    .into_iter()
                    .map(|path| DepotOp::Add {
                        path,
                        blob: blob.clone(),
                    })
                    .collect();
                ops.extend(from_targets.into_iter().map(|path| DepotOp::Delete { path }));
                Ok(ops)
            }
        }
    }

    fn blob_ref(&self, hash: &ContentHash, blobs: &BlobSet) -> GatewayResult<BlobRef> {
        let content = blobs
            .get(hash)
            .map_err(|e| GatewayError::Config(format!("{e:#}")))?;
        Ok(BlobRef::new(hash.clone(), storage_flag_for(content)))
    }

    /// Depot filenames must be printable and free of revision-specifier
    /// characters; `...` collides with wildcard syntax.
    fn validate_filename(&self, path: &str) -> GatewayResult<()> {
        let invalid = |reason: &str| {
            Err(GatewayError::InvalidFilename {
                path: path.to_string(),
                reason: reason.to_string(),
            })
        };
        if path.is_empty() {
            return invalid("empty path");
        }
        if path.contains("...") {
            return invalid("contains wildcard sequence '...'");
        }
        if let Some(c) = path.chars().find(|c| ['@', '#', '%', '*'].contains(c)) {
            return invalid(&format!("contains reserved character '{}'", c));
        }
        if path.chars().any(char::is_control) {
            return invalid("contains non-printable characters");
        }
        Ok(())
    }
}

/// Binary content is stored raw; everything else is deflated. A NUL byte
/// early in the content is the discriminator.
fn storage_flag_for(content: &[u8]) -> StorageFlag {
    let probe = &content[..content.len().min(8000)];
    if probe.contains(&0) {
        StorageFlag::Binary
    } else {
        StorageFlag::Text
    }
}

/// Depot-side user identity for an email address: the local part.
fn identity_of(email: &str) -> String {
    email.split('@').next().unwrap_or(email).to_string()
}
