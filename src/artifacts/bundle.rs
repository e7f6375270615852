//! Push bundles: the gateway's ingest format for Git commits
//!
//! A bundle is a fast-export-style byte stream carrying blobs followed by
//! commits in parent-before-child order:
//!
//! ```text
//! blob
//! data <byte-count>
//! <raw content>
//!
//! commit <40-hex-id>
//! parent <40-hex-id>
//! author Jane <jane@example.com> 1700000000 +0200
//! committer Jane <jane@example.com> 1700000000 +0200
//! data <byte-count>
//! <message>
//! M <hash>\t<path>
//! D <path>
//! R <hash>\t<from>\t<to>
//! ```
//!
//! Paths may contain spaces, so file records are tab-separated. Blob
//! content is identified by hash on the receiving side; a commit record
//! may only reference content an earlier blob record carried.
//!
//! An `M` record for a path the stream has not yet introduced is an add;
//! for a known path it is a modification. Deletes forget the path again.

use crate::artifacts::commit::{Author, BlobSet, Commit, ContentHash, FileChange};
use anyhow::{Context, bail};
use bytes::Bytes;
use std::collections::HashSet;

/// Parsed bundle: ordered commits plus the content they reference.
#[derive(Debug, Clone, Default)]
pub struct PushBundle {
    commits: Vec<Commit>,
    blobs: BlobSet,
}

impl PushBundle {
    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn blobs(&self) -> &BlobSet {
        &self.blobs
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn parse(input: &[u8]) -> anyhow::Result<Self> {
        let mut reader = BundleReader::new(input);
        let mut bundle = PushBundle::default();
        let mut known_paths: HashSet<String> = HashSet::new();

        while let Some(line) = reader.next_line()? {
            if line.is_empty() {
                continue;
            }
            if line == "blob" {
                let content = reader.data_block()?;
                bundle.blobs.insert(content);
            } else if let Some(id) = line.strip_prefix("commit ") {
                let commit = Self::parse_commit(id, &mut reader, &bundle.blobs, &mut known_paths)?;
                bundle.commits.push(commit);
            } else {
                bail!("unrecognized bundle record: '{}'", line);
            }
        }
        Ok(bundle)
    }

    fn parse_commit(
        id: &str,
        reader: &mut BundleReader<'_>,
        blobs: &BlobSet,
        known_paths: &mut HashSet<String>,
    ) -> anyhow::Result<Commit> {
        let id = ContentHash::try_parse(id.to_string()).context("commit record id")?;

        let mut parents = Vec::new();
        let mut author = None;
        let mut committer = None;
        let mut message = None;
        let mut changes = Vec::new();

        while let Some(line) = reader.peek_line()? {
            if line.is_empty() {
                reader.next_line()?;
                break;
            }
            if line.starts_with("commit ") || line == "blob" {
                break;
            }
            let Some(line) = reader.next_line()? else {
                break;
            };

            if let Some(parent) = line.strip_prefix("parent ") {
                parents.push(
                    ContentHash::try_parse(parent.to_string()).context("parent record id")?,
                );
            } else if let Some(value) = line.strip_prefix("author ") {
                author = Some(Author::try_from(value).context("author record")?);
            } else if let Some(value) = line.strip_prefix("committer ") {
                committer = Some(Author::try_from(value).context("committer record")?);
            } else if line.starts_with("data ") {
                reader.push_back(&line);
                let raw = reader.data_block()?;
                message =
                    Some(String::from_utf8(raw.to_vec()).context("commit message is not utf-8")?);
            } else if let Some(rest) = line.strip_prefix("M ") {
                let (hash, path) = rest
                    .split_once('\t')
                    .with_context(|| format!("file record needs a tab: '{}'", line))?;
                let hash = ContentHash::try_parse(hash.to_string()).context("file record hash")?;
                blobs.get(&hash)?;
                let change = if known_paths.insert(path.to_string()) {
                    FileChange::Add {
                        path: path.to_string(),
                        hash,
                    }
                } else {
                    FileChange::Modify {
                        path: path.to_string(),
                        hash,
                    }
                };
                changes.push(change);
            } else if let Some(path) = line.strip_prefix("D ") {
                known_paths.remove(path);
                changes.push(FileChange::Delete {
                    path: path.to_string(),
                });
            } else if let Some(rest) = line.strip_prefix("R ") {
                let mut parts = rest.splitn(3, '\t');
                let (hash, from, to) = match (parts.next(), parts.next(), parts.next()) {
                    (Some(hash), Some(from), Some(to)) => (hash, from, to),
                    _ => bail!("rename record needs hash, source and destination: '{}'", line),
                };
                let hash = ContentHash::try_parse(hash.to_string()).context("rename hash")?;
                blobs.get(&hash)?;
                known_paths.remove(from);
                known_paths.insert(to.to_string());
                changes.push(FileChange::Rename {
                    from: from.to_string(),
                    to: to.to_string(),
                    hash,
                });
            } else {
                bail!("unrecognized commit record: '{}'", line);
            }
        }

        Ok(Commit::new(
            id.clone(),
            parents,
            author.with_context(|| format!("commit {} has no author", id))?,
            committer.with_context(|| format!("commit {} has no committer", id))?,
            message.with_context(|| format!("commit {} has no message", id))?,
            changes,
        ))
    }
}

/// Line reader with byte-exact `data` blocks and single-line push-back.
struct BundleReader<'a> {
    input: &'a [u8],
    pos: usize,
    pushed_back: Option<String>,
}

impl<'a> BundleReader<'a> {
    fn new(input: &'a [u8]) -> Self {
        BundleReader {
            input,
            pos: 0,
            pushed_back: None,
        }
    }

    fn next_line(&mut self) -> anyhow::Result<Option<String>> {
        if let Some(line) = self.pushed_back.take() {
            return Ok(Some(line));
        }
        if self.pos >= self.input.len() {
            return Ok(None);
        }
        let start = self.pos;
        while self.pos < self.input.len() && self.input[self.pos] != b'\n' {
            self.pos += 1;
        }
        let line = String::from_utf8(self.input[start..self.pos].to_vec())
            .context("bundle line is not utf-8")?;
        self.pos += 1;
        Ok(Some(line))
    }

    fn peek_line(&mut self) -> anyhow::Result<Option<String>> {
        let line = self.next_line()?;
        if let Some(line) = &line {
            self.pushed_back = Some(line.clone());
        }
        Ok(line)
    }

    fn push_back(&mut self, line: &str) {
        self.pushed_back = Some(line.to_string());
    }

    /// Read a `data <len>` header and exactly `len` following bytes.
    fn data_block(&mut self) -> anyhow::Result<Bytes> {
        let header = self
            .next_line()?
            .context("bundle ends where a data block was expected")?;
        let len = header
            .strip_prefix("data ")
            .and_then(|v| v.parse::<usize>().ok())
            .with_context(|| format!("malformed data header: '{}'", header))?;
        if self.pos + len > self.input.len() {
            bail!("data block is truncated: wanted {} bytes", len);
        }
        let content = Bytes::copy_from_slice(&self.input[self.pos..self.pos + len]);
        self.pos += len;
        // swallow the newline terminating the block
        if self.pos < self.input.len() && self.input[self.pos] == b'\n' {
            self.pos += 1;
        }
        Ok(content)
    }
}

/// Incrementally write a bundle stream. The inverse of [`PushBundle::parse`].
#[derive(Debug, Default)]
pub struct BundleWriter {
    out: Vec<u8>,
}

impl BundleWriter {
    pub fn blob(&mut self, content: &[u8]) -> ContentHash {
        self.out.extend_from_slice(b"blob\n");
        self.out
            .extend_from_slice(format!("data {}\n", content.len()).as_bytes());
        self.out.extend_from_slice(content);
        self.out.push(b'\n');
        ContentHash::of(content)
    }

    pub fn commit(&mut self, commit: &Commit) {
        self.out
            .extend_from_slice(format!("commit {}\n", commit.id()).as_bytes());
        for parent in commit.parents() {
            self.out
                .extend_from_slice(format!("parent {}\n", parent).as_bytes());
        }
        self.out
            .extend_from_slice(format!("author {}\n", commit.author().display()).as_bytes());
        self.out
            .extend_from_slice(format!("committer {}\n", commit.committer().display()).as_bytes());
        self.out
            .extend_from_slice(format!("data {}\n", commit.message().len()).as_bytes());
        self.out.extend_from_slice(commit.message().as_bytes());
        self.out.push(b'\n');
        for change in commit.changes() {
            let line = match change {
                FileChange::Add { path, hash } | FileChange::Modify { path, hash } => {
                    format!("M {}\t{}", hash, path)
                }
                FileChange::Delete { path } => format!("D {}", path),
                FileChange::Rename { from, to, hash } => {
                    format!("R {}\t{}\t{}", hash, from, to)
                }
            };
            self.out.extend_from_slice(line.as_bytes());
            self.out.push(b'\n');
        }
        self.out.push(b'\n');
    }

    pub fn finish(self) -> Bytes {
        Bytes::from(self.out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn author_line() -> &'static str {
        "author Jane <jane@example.com> 1700000000 +0200\n"
    }

    fn committer_line() -> &'static str {
        "committer Jane <jane@example.com> 1700000000 +0200\n"
    }

    fn one_commit_bundle() -> Vec<u8> {
        let content = b"fn main() {}\n";
        let hash = ContentHash::of(content);
        let mut raw = Vec::new();
        raw.extend_from_slice(format!("blob\ndata {}\n", content.len()).as_bytes());
        raw.extend_from_slice(content);
        raw.push(b'\n');
        raw.extend_from_slice(format!("commit {}\n", "a".repeat(40)).as_bytes());
        raw.extend_from_slice(author_line().as_bytes());
        raw.extend_from_slice(committer_line().as_bytes());
        raw.extend_from_slice(b"data 12\nfirst commit\n");
        raw.extend_from_slice(format!("M {}\tsrc/main.rs\n", hash).as_bytes());
        raw
    }

    #[test]
    fn parses_blob_and_commit_records() {
        let bundle = PushBundle::parse(&one_commit_bundle()).unwrap();
        assert_eq!(bundle.commits().len(), 1);
        assert_eq!(bundle.blobs().len(), 1);

        let commit = &bundle.commits()[0];
        assert_eq!(commit.id().as_ref(), "a".repeat(40));
        assert_eq!(commit.message(), "first commit");
        assert_eq!(commit.author().name(), "Jane");
        assert!(matches!(
            commit.changes()[0],
            FileChange::Add { ref path, .. } if path == "src/main.rs"
        ));
    }

    #[test]
    fn second_touch_of_a_path_is_a_modification() {
        let content = b"v2\n";
        let hash = ContentHash::of(content);
        let mut raw = one_commit_bundle();
        raw.extend_from_slice(format!("\nblob\ndata {}\n", content.len()).as_bytes());
        raw.extend_from_slice(content);
        raw.push(b'\n');
        raw.extend_from_slice(format!("commit {}\n", "b".repeat(40)).as_bytes());
        raw.extend_from_slice(format!("parent {}\n", "a".repeat(40)).as_bytes());
        raw.extend_from_slice(author_line().as_bytes());
        raw.extend_from_slice(committer_line().as_bytes());
        raw.extend_from_slice(b"data 6\nsecond\n");
        raw.extend_from_slice(format!("M {}\tsrc/main.rs\n", hash).as_bytes());

        let bundle = PushBundle::parse(&raw).unwrap();
        let second = &bundle.commits()[1];
        assert_eq!(second.parents().len(), 1);
        assert!(matches!(second.changes()[0], FileChange::Modify { .. }));
    }

    #[test]
    fn message_length_is_byte_exact() {
        let mut raw = Vec::new();
        raw.extend_from_slice(format!("commit {}\n", "c".repeat(40)).as_bytes());
        raw.extend_from_slice(author_line().as_bytes());
        raw.extend_from_slice(committer_line().as_bytes());
        // message contains a line that looks like a file record
        let message = "tricky\nM deadbeef\tnot/a/file\n";
        raw.extend_from_slice(format!("data {}\n{}", message.len(), message).as_bytes());
        raw.push(b'\n');

        let bundle = PushBundle::parse(&raw).unwrap();
        assert_eq!(bundle.commits()[0].message(), message);
        assert!(bundle.commits()[0].changes().is_empty());
    }

    #[test]
    fn referencing_a_missing_blob_fails() {
        let mut raw = Vec::new();
        raw.extend_from_slice(format!("commit {}\n", "d".repeat(40)).as_bytes());
        raw.extend_from_slice(author_line().as_bytes());
        raw.extend_from_slice(committer_line().as_bytes());
        raw.extend_from_slice(b"data 3\nmsg\n");
        raw.extend_from_slice(format!("M {}\ta.txt\n", "e".repeat(40)).as_bytes());
        assert!(PushBundle::parse(&raw).is_err());
    }

    #[test]
    fn writer_output_parses_back_identically() {
        let mut writer = BundleWriter::default();
        let hash = writer.blob(b"hello\n");
        let author = Author::try_from("Jane <jane@example.com> 1700000000 +0200").unwrap();
        let commit = Commit::new(
            ContentHash::of(b"x"),
            vec![],
            author.clone(),
            author,
            "add hello with spaces in path".to_string(),
            vec![FileChange::Add {
                path: "docs/read me.txt".to_string(),
                hash,
            }],
        );
        writer.commit(&commit);

        let bundle = PushBundle::parse(&writer.finish()).unwrap();
        assert_eq!(bundle.commits(), &[commit]);
    }

    #[test]
    fn truncated_data_block_fails() {
        let raw = b"blob\ndata 100\nshort";
        assert!(PushBundle::parse(raw).is_err());
    }
}
