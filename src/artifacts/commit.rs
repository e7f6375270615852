//! Git-side commit model
//!
//! Commits arrive from Git clients inside a push bundle and are consumed
//! read-only by the push translator. Each commit carries:
//! - 0..N parent ids (more than one marks a merge)
//! - Author and committer identity with timestamp and timezone
//! - Commit message
//! - An ordered set of file changes (add/modify/delete/rename), each
//!   referring to new content by SHA-1 hash
//!
//! The gateway never recomputes trees; the file-change list is the unit of
//! translation toward depot changelists.

use anyhow::Context;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use std::path::PathBuf;

/// Length of a SHA-1 hex digest.
pub const CONTENT_HASH_LENGTH: usize = 40;

/// Content-addressed identifier for file content (SHA-1 hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct ContentHash(String);

impl ContentHash {
    /// Parse and validate a content hash from a string.
    pub fn try_parse(hash: String) -> anyhow::Result<Self> {
        if hash.len() != CONTENT_HASH_LENGTH {
            return Err(anyhow::anyhow!("Invalid content hash length: {}", hash.len()));
        }
        if !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(anyhow::anyhow!("Invalid content hash characters: {}", hash));
        }
        Ok(Self(hash))
    }

    /// Hash raw content.
    pub fn of(content: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(content);
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Convert to a fan-out file system path: `XX/YYYY...`.
    pub fn to_path(&self) -> PathBuf {
        let (dir, file) = self.0.split_at(2);
        PathBuf::from(dir).join(file)
    }

    /// First 7 characters, for user-facing output.
    pub fn to_short(&self) -> String {
        self.0.split_at(7).0.to_string()
    }
}

impl AsRef<str> for ContentHash {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Author or committer information.
///
/// Contains name, email, and timestamp with timezone information.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Author {
    name: String,
    email: String,
    timestamp: chrono::DateTime<chrono::FixedOffset>,
}

impl Author {
    pub fn new(name: String, email: String) -> Self {
        Author {
            name,
            email,
            timestamp: chrono::Local::now().fixed_offset(),
        }
    }

    pub fn new_with_timestamp(
        name: String,
        email: String,
        timestamp: chrono::DateTime<chrono::FixedOffset>,
    ) -> Self {
        Author {
            name,
            email,
            timestamp,
        }
    }

    /// Format as "Name <email@example.com>".
    pub fn display_name(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }

    /// Format as "Name <email> timestamp timezone", the bundle wire form.
    pub fn display(&self) -> String {
        format!(
            "{} <{}> {} {}",
            self.name,
            self.email,
            self.timestamp.timestamp(),
            self.timestamp.format("%z")
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn timestamp(&self) -> chrono::DateTime<chrono::FixedOffset> {
        self.timestamp
    }
}

impl TryFrom<&str> for Author {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        // Format: "name <email> timestamp timezone"
        // Split from right to get timezone and timestamp first
        let parts: Vec<&str> = value.rsplitn(3, ' ').collect();
        if parts.len() < 3 {
            return Err(anyhow::anyhow!("Invalid author format"));
        }

        let timezone = parts[0];
        let timestamp = parts[1]
            .parse::<i64>()
            .map_err(|_| anyhow::anyhow!("Invalid timestamp"))?;
        let name_email_part = parts[2]; // "name <email>"

        let email_start = name_email_part
            .find('<')
            .ok_or_else(|| anyhow::anyhow!("Invalid author format: missing '<'"))?;
        let email_end = name_email_part
            .find('>')
            .ok_or_else(|| anyhow::anyhow!("Invalid author format: missing '>'"))?;

        let name = name_email_part[..email_start].trim().to_string();
        let email = name_email_part[email_start + 1..email_end].to_string();

        let datetime = chrono::DateTime::from_timestamp(timestamp, 0)
            .ok_or_else(|| anyhow::anyhow!("Invalid timestamp"))?;
        let datetime = chrono::DateTime::parse_from_str(
            &format!("{} {}", datetime.format("%Y-%m-%d %H:%M:%S"), timezone),
            "%Y-%m-%d %H:%M:%S %z",
        )
        .map_err(|_| anyhow::anyhow!("Invalid timezone"))?;

        Ok(Author {
            name,
            email,
            timestamp: datetime,
        })
    }
}

/// One path-level change carried by a commit.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FileChange {
    Add { path: String, hash: ContentHash },
    Modify { path: String, hash: ContentHash },
    Delete { path: String },
    Rename {
        from: String,
        to: String,
        hash: ContentHash,
    },
}

impl FileChange {
    /// The git path this change primarily lives at (rename: destination).
    pub fn path(&self) -> &str {
        match self {
            FileChange::Add { path, .. }
            | FileChange::Modify { path, .. }
            | FileChange::Delete { path } => path,
            FileChange::Rename { to, .. } => to,
        }
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        match self {
            FileChange::Add { hash, .. }
            | FileChange::Modify { hash, .. }
            | FileChange::Rename { hash, .. } => Some(hash),
            FileChange::Delete { .. } => None,
        }
    }
}

/// An immutable commit as produced by a Git client.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Commit {
    id: ContentHash,
    parents: Vec<ContentHash>,
    author: Author,
    committer: Author,
    message: String,
    changes: Vec<FileChange>,
}

impl Commit {
    pub fn new(
        id: ContentHash,
        parents: Vec<ContentHash>,
        author: Author,
        committer: Author,
        message: String,
        changes: Vec<FileChange>,
    ) -> Self {
        Commit {
            id,
            parents,
            author,
            committer,
            message,
            changes,
        }
    }

    pub fn id(&self) -> &ContentHash {
        &self.id
    }

    pub fn parents(&self) -> &[ContentHash] {
        &self.parents
    }

    /// More than one parent marks a merge commit.
    pub fn is_merge(&self) -> bool {
        self.parents.len() > 1
    }

    pub fn author(&self) -> &Author {
        &self.author
    }

    pub fn committer(&self) -> &Author {
        &self.committer
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// First line of the message, for short-form reporting.
    pub fn short_message(&self) -> String {
        self.message.lines().next().unwrap_or("").to_string()
    }

    pub fn changes(&self) -> &[FileChange] {
        &self.changes
    }
}

/// Content carried alongside a commit sequence: hash -> raw bytes.
///
/// Blobs are deduplicated at this level already; two commits touching the
/// same content share one entry.
#[derive(Debug, Clone, Default)]
pub struct BlobSet {
    blobs: std::collections::HashMap<ContentHash, Bytes>,
}

impl BlobSet {
    pub fn insert(&mut self, content: Bytes) -> ContentHash {
        let hash = ContentHash::of(&content);
        self.blobs.insert(hash.clone(), content);
        hash
    }

    pub fn get(&self, hash: &ContentHash) -> anyhow::Result<&Bytes> {
        self.blobs
            .get(hash)
            .with_context(|| format!("push bundle is missing blob {}", hash))
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}
