//! Centralized depot engine
//!
//! The backing store the gateway translates into. It deliberately offers
//! only the primitives a centralized version-control server offers:
//!
//! - numbered changelists, each submitted atomically (temp file + rename),
//!   with no multi-changelist transaction
//! - administrative revert of a submitted changelist
//! - named counters with atomic read-modify-write, shared by every gateway
//!   instance pointing at the same depot root
//! - session-owned exclusive file locks on depot paths
//!
//! Push-level atomicity is *not* provided here; that is the coordinator's
//! job, layered on top of these primitives.
//!
//! ## On-disk layout
//!
//! ```text
//! <root>/changes/<number>     submitted change records
//! <root>/counters/<name>      named counter values
//! <root>/counters.lock        exclusive-lock anchor for counter updates
//! <root>/locks/<hash>         exclusive file locks (path, holder, time)
//! <root>/objects/...          content-addressed blob area (object store)
//! <root>/trigger-version      protocol version of the installed trigger
//! <root>/maintenance          presence makes the depot report unavailable
//! <root>/permissions          optional write-permission table
//! ```

use crate::artifacts::commit::ContentHash;
use crate::artifacts::trigger::{SubmitTrigger, TriggerVerdict};
use crate::areas::object_store::BlobRef;
use crate::errors::{GatewayError, GatewayResult};
use anyhow::Context;
use bytes::Bytes;
use fake::rand;
use file_guard::Lock;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Changelist number. Monotonic per depot, never reused.
pub type ChangeId = u64;

/// Counter holding the next changelist number.
const CHANGE_COUNTER: &str = "change";

/// One file operation inside a change record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum DepotOp {
    Add { path: String, blob: BlobRef },
    Edit { path: String, blob: BlobRef },
    Delete { path: String },
    Move {
        from: String,
        to: String,
        blob: BlobRef,
    },
}

impl DepotOp {
    /// Every depot path this operation touches.
    pub fn paths(&self) -> Vec<&str> {
        match self {
            DepotOp::Add { path, .. }
            | DepotOp::Edit { path, .. }
            | DepotOp::Delete { path } => vec![path],
            DepotOp::Move { from, to, .. } => vec![from, to],
        }
    }

    pub fn blob(&self) -> Option<&BlobRef> {
        match self {
            DepotOp::Add { blob, .. }
            | DepotOp::Edit { blob, .. }
            | DepotOp::Move { blob, .. } => Some(blob),
            DepotOp::Delete { .. } => None,
        }
    }

    fn serialize(&self) -> String {
        match self {
            DepotOp::Add { path, blob } => {
                format!("op add {} {}\t{}", blob.flag().as_str(), blob.hash(), path)
            }
            DepotOp::Edit { path, blob } => {
                format!("op edit {} {}\t{}", blob.flag().as_str(), blob.hash(), path)
            }
            DepotOp::Delete { path } => format!("op delete - -\t{}", path),
            DepotOp::Move { from, to, blob } => format!(
                "op move {} {}\t{}\t{}",
                blob.flag().as_str(),
                blob.hash(),
                from,
                to
            ),
        }
    }

    fn deserialize(line: &str, change: ChangeId) -> GatewayResult<Self> {
        let corrupt = || GatewayError::CorruptChangeRecord(change);

        let rest = line.strip_prefix("op ").ok_or_else(corrupt)?;
        let (head, paths) = rest.split_once('\t').ok_or_else(corrupt)?;
        let mut head_parts = head.split(' ');
        let kind = head_parts.next().ok_or_else(corrupt)?;
        let flag = head_parts.next().ok_or_else(corrupt)?;
        let hash = head_parts.next().ok_or_else(corrupt)?;

        let blob = || -> GatewayResult<BlobRef> {
            let hash = ContentHash::try_parse(hash.to_string()).map_err(|_| corrupt())?;
            let flag = crate::areas::object_store::StorageFlag::try_parse(flag)
                .ok_or_else(corrupt)?;
            Ok(BlobRef::new(hash, flag))
        };

        match kind {
            "add" => Ok(DepotOp::Add {
                path: paths.to_string(),
                blob: blob()?,
            }),
            "edit" => Ok(DepotOp::Edit {
                path: paths.to_string(),
                blob: blob()?,
            }),
            "delete" => Ok(DepotOp::Delete {
                path: paths.to_string(),
            }),
            "move" => {
                let (from, to) = paths.split_once('\t').ok_or_else(corrupt)?;
                Ok(DepotOp::Move {
                    from: from.to_string(),
                    to: to.to_string(),
                    blob: blob()?,
                })
            }
            _ => Err(corrupt()),
        }
    }
}

/// A changelist opened but not yet durable.
///
/// Created by the depot on `open_change`, consumed by `submit` or dropped
/// on rollback (an unsubmitted pending change leaves no trace).
#[derive(Debug, Clone)]
pub struct PendingChange {
    pub id: ChangeId,
    pub commit_id: String,
    pub description: String,
    /// SHA-1 of the description as staged; the trigger compares against it.
    pub staged_digest: String,
    pub session: String,
    pub recorded_at: chrono::DateTime<chrono::FixedOffset>,
    pub ops: Vec<DepotOp>,
}

/// A submitted, durable change record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub recorded_at: chrono::DateTime<chrono::FixedOffset>,
    pub description: String,
    pub ops: Vec<DepotOp>,
}

/// An exclusive file lock held by some session.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FileLock {
    pub path: String,
    pub holder: String,
    pub acquired_at: chrono::DateTime<chrono::FixedOffset>,
}

#[derive(Debug)]
pub struct Depot {
    root: Box<Path>,
}

impl Depot {
    pub fn new(root: Box<Path>) -> Self {
        Depot { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the depot directory layout. Idempotent.
    pub fn init(&self, trigger_version: u32) -> anyhow::Result<()> {
        for dir in ["changes", "counters", "locks", "objects"] {
            std::fs::create_dir_all(self.root.join(dir))
                .with_context(|| format!("unable to create depot directory {}", dir))?;
        }
        std::fs::write(
            self.root.join("trigger-version"),
            format!("{}\n", trigger_version),
        )
        .context("unable to record trigger version")?;
        Ok(())
    }

    pub fn objects_path(&self) -> PathBuf {
        self.root.join("objects")
    }

    /// Fail when the depot root is gone or an administrator put the depot
    /// into maintenance. Both are transient from the pusher's view.
    pub fn ensure_available(&self) -> GatewayResult<()> {
        if !self.root.join("changes").is_dir() {
            return Err(GatewayError::StoreUnavailable(format!(
                "depot root {} is not reachable",
                self.root.display()
            )));
        }
        if self.root.join("maintenance").exists() {
            return Err(GatewayError::StoreUnavailable(
                "depot is in maintenance mode".to_string(),
            ));
        }
        Ok(())
    }

    pub fn enter_maintenance(&self) -> anyhow::Result<()> {
        std::fs::write(self.root.join("maintenance"), b"maintenance\n")?;
        Ok(())
    }

    pub fn leave_maintenance(&self) -> anyhow::Result<()> {
        let marker = self.root.join("maintenance");
        if marker.exists() {
            std::fs::remove_file(marker)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Changelists
    // ------------------------------------------------------------------

    /// Allocate the next changelist number and return an open pending
    /// change. Nothing is durable until `submit`.
    pub fn open_change(
        &self,
        commit_id: String,
        description: String,
        session: String,
        recorded_at: chrono::DateTime<chrono::FixedOffset>,
        ops: Vec<DepotOp>,
    ) -> GatewayResult<PendingChange> {
        self.ensure_available()?;
        let id = self.counter_increment(CHANGE_COUNTER)? as ChangeId;
        let staged_digest = ContentHash::of(description.as_bytes()).to_string();
        tracing::debug!(change = id, commit = %commit_id, "opened pending change");
        Ok(PendingChange {
            id,
            commit_id,
            description,
            staged_digest,
            session,
            recorded_at,
            ops,
        })
    }

    /// Submit a pending change atomically.
    ///
    /// The installed trigger runs synchronously at this boundary, before the
    /// record becomes durable; a reject leaves the depot untouched.
    pub fn submit(
        &self,
        pending: &PendingChange,
        trigger: &dyn SubmitTrigger,
    ) -> GatewayResult<ChangeId> {
        self.ensure_available()?;

        match trigger.pre_submit_check(self, pending) {
            TriggerVerdict::Accept => {}
            TriggerVerdict::Reject(reason) => {
                tracing::warn!(change = pending.id, %reason, "trigger rejected submission");
                return Err(GatewayError::TriggerRejected {
                    commit: pending.commit_id.clone(),
                    reason,
                });
            }
        }

        let record = ChangeRecord {
            id: pending.id,
            recorded_at: pending.recorded_at,
            description: pending.description.clone(),
            ops: pending.ops.clone(),
        };
        self.write_change_record(&record)?;
        tracing::info!(change = record.id, commit = %pending.commit_id, "submitted changelist");
        Ok(record.id)
    }

    /// Administrative revert of a submitted changelist. Used by the
    /// coordinator's compensating rollback, never during normal submission.
    pub fn revert(&self, id: ChangeId) -> GatewayResult<()> {
        let path = self.change_path(id);
        std::fs::remove_file(&path)
            .map_err(|e| GatewayError::StoreUnavailable(format!("revert of change {id}: {e}")))?;
        tracing::info!(change = id, "reverted changelist");
        Ok(())
    }

    pub fn read_change(&self, id: ChangeId) -> GatewayResult<ChangeRecord> {
        let content = std::fs::read(self.change_path(id))
            .map_err(|e| GatewayError::StoreUnavailable(format!("read of change {id}: {e}")))?;
        Self::deserialize_change(id, &content)
    }

    /// All submitted changelist numbers, ascending.
    pub fn list_change_ids(&self) -> GatewayResult<Vec<ChangeId>> {
        let mut ids = walkdir::WalkDir::new(self.root.join("changes"))
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_file())
            .filter_map(|entry| entry.file_name().to_string_lossy().parse::<ChangeId>().ok())
            .collect::<Vec<_>>();
        ids.sort_unstable();
        Ok(ids)
    }

    fn change_path(&self, id: ChangeId) -> PathBuf {
        self.root.join("changes").join(format!("{:06}", id))
    }

    fn write_change_record(&self, record: &ChangeRecord) -> GatewayResult<()> {
        let content = Self::serialize_change(record);
        let change_path = self.change_path(record.id);
        let temp_path = self
            .root
            .join("changes")
            .join(format!("tmp-change-{}", rand::random::<u32>()));

        let write = || -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(&content)?;
            file.sync_all()?;
            // rename makes the submission atomic
            std::fs::rename(&temp_path, &change_path)
        };
        write().map_err(|e| {
            GatewayError::StoreUnavailable(format!("submit of change {}: {e}", record.id))
        })
    }

    fn serialize_change(record: &ChangeRecord) -> Bytes {
        let mut out = Vec::new();
        out.extend_from_slice(format!("change {}\n", record.id).as_bytes());
        out.extend_from_slice(
            format!(
                "date {} {}\n",
                record.recorded_at.timestamp(),
                record.recorded_at.format("%z")
            )
            .as_bytes(),
        );
        out.extend_from_slice(format!("desc {}\n", record.description.len()).as_bytes());
        out.extend_from_slice(record.description.as_bytes());
        out.push(b'\n');
        for op in &record.ops {
            out.extend_from_slice(op.serialize().as_bytes());
            out.push(b'\n');
        }
        Bytes::from(out)
    }

    fn deserialize_change(id: ChangeId, content: &[u8]) -> GatewayResult<ChangeRecord> {
        let corrupt = || GatewayError::CorruptChangeRecord(id);

        let text_end = content.len();
        let mut pos = 0usize;
        let next_line = |pos: &mut usize| -> GatewayResult<String> {
            let start = *pos;
            while *pos < text_end && content[*pos] != b'\n' {
                *pos += 1;
            }
            let line = String::from_utf8(content[start..*pos].to_vec()).map_err(|_| corrupt())?;
            *pos += 1; // swallow newline
            Ok(line)
        };

        let change_line = next_line(&mut pos)?;
        let parsed_id = change_line
            .strip_prefix("change ")
            .and_then(|v| v.parse::<ChangeId>().ok())
            .ok_or_else(corrupt)?;
        if parsed_id != id {
            return Err(corrupt());
        }

        let date_line = next_line(&mut pos)?;
        let date_rest = date_line.strip_prefix("date ").ok_or_else(corrupt)?;
        let (ts, tz) = date_rest.split_once(' ').ok_or_else(corrupt)?;
        let ts = ts.parse::<i64>().map_err(|_| corrupt())?;
        let base = chrono::DateTime::from_timestamp(ts, 0).ok_or_else(corrupt)?;
        let recorded_at = chrono::DateTime::parse_from_str(
            &format!("{} {}", base.format("%Y-%m-%d %H:%M:%S"), tz),
            "%Y-%m-%d %H:%M:%S %z",
        )
        .map_err(|_| corrupt())?;

        let desc_line = next_line(&mut pos)?;
        let desc_len = desc_line
            .strip_prefix("desc ")
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(corrupt)?;
        if pos + desc_len > text_end {
            return Err(corrupt());
        }
        let description =
            String::from_utf8(content[pos..pos + desc_len].to_vec()).map_err(|_| corrupt())?;
        pos += desc_len + 1; // swallow trailing newline

        let mut ops = Vec::new();
        while pos < text_end {
            let line = next_line(&mut pos)?;
            if line.is_empty() {
                continue;
            }
            ops.push(DepotOp::deserialize(&line, id)?);
        }

        Ok(ChangeRecord {
            id,
            recorded_at,
            description,
            ops,
        })
    }

    // ------------------------------------------------------------------
    // Counters
    //
    // The depot's compare-and-set primitive. Every update takes an
    // exclusive lock on the counters.lock anchor file, so the
    // read-modify-write is atomic across gateway instances sharing
    // this depot root.
    // ------------------------------------------------------------------

    /// Atomically increment a counter, creating it at 1 when absent.
    /// Returns the post-increment value.
    pub fn counter_increment(&self, name: &str) -> GatewayResult<i64> {
        self.with_counter_lock(|| {
            let path = self.counter_path(name);
            let value = match std::fs::read_to_string(&path) {
                Ok(raw) => raw.trim().parse::<i64>().unwrap_or(0) + 1,
                Err(_) => 1,
            };
            std::fs::write(&path, format!("{}\n", value))?;
            Ok(value)
        })
    }

    pub fn counter_get(&self, name: &str) -> GatewayResult<Option<String>> {
        self.with_counter_lock(|| match std::fs::read_to_string(self.counter_path(name)) {
            Ok(raw) => Ok(Some(raw.trim_end_matches('\n').to_string())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
    }

    pub fn counter_set(&self, name: &str, value: &str) -> GatewayResult<()> {
        self.with_counter_lock(|| std::fs::write(self.counter_path(name), format!("{}\n", value)))
    }

    /// Atomically clear a lock/heartbeat counter pair, but only while the
    /// heartbeat still holds `expected` and the lock counter is present.
    /// Returns whether the pair was cleared.
    ///
    /// Two waiters can both observe the same dead holder; whichever clear
    /// runs second sees either a fresh heartbeat or no lock and backs off,
    /// so a new holder is never unseated.
    pub fn counter_clear_pair_if(
        &self,
        lock_name: &str,
        hb_name: &str,
        expected: Option<&str>,
    ) -> GatewayResult<bool> {
        let lock_path = self.counter_path(lock_name);
        let hb_path = self.counter_path(hb_name);
        self.with_counter_lock(|| {
            let current = match std::fs::read_to_string(&hb_path) {
                Ok(raw) => Some(raw.trim_end_matches('\n').to_string()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => return Err(e),
            };
            if current.as_deref() != expected || !lock_path.exists() {
                return Ok(false);
            }
            if current.is_some() {
                std::fs::remove_file(&hb_path)?;
            }
            std::fs::remove_file(&lock_path)?;
            Ok(true)
        })
    }

    pub fn counter_delete(&self, name: &str) -> GatewayResult<()> {
        self.with_counter_lock(|| match std::fs::remove_file(self.counter_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        })
    }

    fn counter_path(&self, name: &str) -> PathBuf {
        // counter names are flat identifiers; keep them filesystem-safe
        let safe = name.replace(['/', '\\'], "_");
        self.root.join("counters").join(safe)
    }

    fn with_counter_lock<T>(
        &self,
        body: impl FnOnce() -> std::io::Result<T>,
    ) -> GatewayResult<T> {
        let run = || -> std::io::Result<T> {
            let mut anchor = std::fs::OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.root.join("counters.lock"))?;
            let _lock = file_guard::lock(&mut anchor, Lock::Exclusive, 0, 1)?;
            body()
        };
        run().map_err(|e| GatewayError::StoreUnavailable(format!("counter access: {e}")))
    }

    // ------------------------------------------------------------------
    // Exclusive file locks
    // ------------------------------------------------------------------

    /// Take an exclusive lock on a depot path for a session.
    pub fn lock_file(&self, path: &str, session: &str) -> GatewayResult<()> {
        if let Some(existing) = self.file_lock(path)?
            && existing.holder != session
        {
            return Err(GatewayError::StoreWriteConflict {
                path: path.to_string(),
                holder: existing.holder,
            });
        }
        let lock = FileLock {
            path: path.to_string(),
            holder: session.to_string(),
            acquired_at: chrono::Local::now().fixed_offset(),
        };
        let content = format!("{}\n{}\n{}\n", lock.path, lock.holder, lock.acquired_at.timestamp());
        std::fs::write(self.file_lock_path(path), content)
            .map_err(|e| GatewayError::StoreUnavailable(format!("file lock: {e}")))?;
        Ok(())
    }

    pub fn file_lock(&self, path: &str) -> GatewayResult<Option<FileLock>> {
        match std::fs::read_to_string(self.file_lock_path(path)) {
            Ok(raw) => {
                let mut lines = raw.lines();
                let lock_path = lines.next().unwrap_or_default().to_string();
                let holder = lines.next().unwrap_or_default().to_string();
                let ts = lines
                    .next()
                    .and_then(|v| v.parse::<i64>().ok())
                    .unwrap_or_default();
                let acquired_at = chrono::DateTime::from_timestamp(ts, 0)
                    .unwrap_or_default()
                    .fixed_offset();
                Ok(Some(FileLock {
                    path: lock_path,
                    holder,
                    acquired_at,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(GatewayError::StoreUnavailable(format!("file lock read: {e}"))),
        }
    }

    pub fn unlock_file(&self, path: &str) -> GatewayResult<()> {
        match std::fs::remove_file(self.file_lock_path(path)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(GatewayError::StoreUnavailable(format!("file unlock: {e}"))),
        }
    }

    fn file_lock_path(&self, path: &str) -> PathBuf {
        self.root
            .join("locks")
            .join(ContentHash::of(path.as_bytes()).to_string())
    }

    // ------------------------------------------------------------------
    // Trigger version and permissions
    // ------------------------------------------------------------------

    pub fn trigger_version(&self) -> GatewayResult<u32> {
        let raw = std::fs::read_to_string(self.root.join("trigger-version"))
            .map_err(|e| GatewayError::StoreUnavailable(format!("trigger version: {e}")))?;
        raw.trim()
            .parse::<u32>()
            .map_err(|_| GatewayError::StoreUnavailable("unreadable trigger version".into()))
    }

    pub fn write_trigger_version(&self, version: u32) -> anyhow::Result<()> {
        std::fs::write(self.root.join("trigger-version"), format!("{}\n", version))?;
        Ok(())
    }

    /// Write-permission check against the optional permissions table.
    ///
    /// Each line is `<user-or-*> <depot-path-prefix>`. A missing or empty
    /// table grants everything, matching an open depot.
    pub fn user_may_write(&self, user: &str, path: &str) -> GatewayResult<bool> {
        let raw = match std::fs::read_to_string(self.root.join("permissions")) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(true),
            Err(e) => {
                return Err(GatewayError::StoreUnavailable(format!("permissions: {e}")));
            }
        };
        if raw.trim().is_empty() {
            return Ok(true);
        }
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((who, prefix)) = line.split_once(' ')
                && (who == "*" || who == user)
                && path.starts_with(prefix.trim())
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn set_permissions(&self, table: &str) -> anyhow::Result<()> {
        std::fs::write(self.root.join("permissions"), table)?;
        Ok(())
    }
}
