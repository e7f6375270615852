//! Content-addressed object store adapter
//!
//! Blobs live in the depot's `objects/` area under a two-level SHA-1
//! fan-out, zlib-deflated. The area is append-only: a write for a hash
//! that is already present is a no-op returning the existing reference,
//! which is what makes the store safe to share across concurrent pushes.
//!
//! Content that is already compressed upstream (the binary storage flag)
//! is stored raw rather than deflated a second time; the flag travels in
//! the `BlobRef` so readers know how to open it.

use crate::artifacts::commit::ContentHash;
use crate::errors::{GatewayError, GatewayResult};
use bytes::Bytes;
use derive_new::new;
use fake::rand;
use std::io::{Read, Write};
use std::path::Path;

/// How a blob is stored on the depot side.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum StorageFlag {
    /// Deflated with zlib before storage.
    Text,
    /// Already compressed upstream; stored as-is, marked binary.
    Binary,
}

impl StorageFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageFlag::Text => "text",
            StorageFlag::Binary => "binary",
        }
    }

    pub fn try_parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(StorageFlag::Text),
            "binary" => Some(StorageFlag::Binary),
            _ => None,
        }
    }
}

/// Reference to a stored blob: content hash plus storage flag.
#[derive(Debug, Clone, Eq, PartialEq, new)]
pub struct BlobRef {
    hash: ContentHash,
    flag: StorageFlag,
}

impl BlobRef {
    pub fn hash(&self) -> &ContentHash {
        &self.hash
    }

    pub fn flag(&self) -> StorageFlag {
        self.flag
    }
}

#[derive(Debug)]
pub struct ObjectStore {
    path: Box<Path>,
}

impl ObjectStore {
    pub fn new(path: Box<Path>) -> Self {
        ObjectStore { path }
    }

    /// Store content under its hash. Deduplicates: writing an
    /// already-present hash returns the existing reference untouched.
    pub fn write(
        &self,
        hash: &ContentHash,
        content: &Bytes,
        flag: StorageFlag,
    ) -> GatewayResult<BlobRef> {
        let blob_path = self.path.join(hash.to_path());
        if blob_path.exists() {
            return Ok(BlobRef::new(hash.clone(), flag));
        }

        let stored = match flag {
            StorageFlag::Text => Self::compress(content)?,
            StorageFlag::Binary => content.clone(),
        };
        self.write_blob(&blob_path, &stored)?;
        tracing::debug!(blob = %hash, flag = flag.as_str(), "stored object blob");
        Ok(BlobRef::new(hash.clone(), flag))
    }

    pub fn read(&self, blob: &BlobRef) -> GatewayResult<Bytes> {
        let blob_path = self.path.join(blob.hash().to_path());
        let stored = std::fs::read(&blob_path).map_err(|e| {
            GatewayError::StoreUnavailable(format!(
                "unable to read blob {}: {e}",
                blob_path.display()
            ))
        })?;

        match blob.flag() {
            StorageFlag::Text => Self::decompress(&stored),
            StorageFlag::Binary => Ok(Bytes::from(stored)),
        }
    }

    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.path.join(hash.to_path()).exists()
    }

    fn write_blob(&self, blob_path: &Path, content: &Bytes) -> GatewayResult<()> {
        let write = || -> std::io::Result<()> {
            let blob_dir = blob_path.parent().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "blob path has no parent")
            })?;
            std::fs::create_dir_all(blob_dir)?;

            let temp_path = blob_dir.join(format!("tmp-obj-{}", rand::random::<u32>()));
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&temp_path)?;
            file.write_all(content)?;

            // rename the temp file to make the write atomic
            std::fs::rename(&temp_path, blob_path)
        };
        write().map_err(|e| {
            GatewayError::StoreUnavailable(format!(
                "unable to write blob {}: {e}",
                blob_path.display()
            ))
        })
    }

    fn compress(data: &Bytes) -> GatewayResult<Bytes> {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(data)
            .and_then(|_| encoder.finish())
            .map(Bytes::from)
            .map_err(|e| GatewayError::StoreUnavailable(format!("blob compression: {e}")))
    }

    fn decompress(data: &[u8]) -> GatewayResult<Bytes> {
        let mut decoder = flate2::read::ZlibDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map(|_| Bytes::from(decompressed))
            .map_err(|e| GatewayError::StoreUnavailable(format!("blob decompression: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn temp_store() -> (assert_fs::TempDir, ObjectStore) {
        let dir = assert_fs::TempDir::new().unwrap();
        let store = ObjectStore::new(dir.path().join("objects").into_boxed_path());
        (dir, store)
    }

    #[rstest]
    #[case(StorageFlag::Text)]
    #[case(StorageFlag::Binary)]
    fn write_then_read_returns_identical_content(#[case] flag: StorageFlag) {
        let (_dir, store) = temp_store();
        let content = Bytes::from_static(b"the quick brown fox");
        let hash = ContentHash::of(&content);

        let blob = store.write(&hash, &content, flag).unwrap();
        assert_eq!(store.read(&blob).unwrap(), content);
    }

    #[test]
    fn text_blobs_are_deflated_on_disk() {
        let (dir, store) = temp_store();
        let content = Bytes::from(vec![b'a'; 4096]);
        let hash = ContentHash::of(&content);
        store.write(&hash, &content, StorageFlag::Text).unwrap();

        let on_disk = std::fs::read(dir.path().join("objects").join(hash.to_path())).unwrap();
        assert!(on_disk.len() < content.len());
    }

    #[test]
    fn binary_blobs_are_never_double_compressed() {
        let (dir, store) = temp_store();
        // pretend this is pre-compressed upstream content
        let content = Bytes::from_static(&[0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad, 0xbe, 0xef]);
        let hash = ContentHash::of(&content);
        store.write(&hash, &content, StorageFlag::Binary).unwrap();

        let on_disk = std::fs::read(dir.path().join("objects").join(hash.to_path())).unwrap();
        assert_eq!(Bytes::from(on_disk), content);
    }

    #[test]
    fn duplicate_write_is_a_noop() {
        let (dir, store) = temp_store();
        let content = Bytes::from_static(b"dedup me");
        let hash = ContentHash::of(&content);

        store.write(&hash, &content, StorageFlag::Text).unwrap();
        let blob_path = dir.path().join("objects").join(hash.to_path());
        let first_mtime = std::fs::metadata(&blob_path).unwrap().modified().unwrap();

        let blob = store.write(&hash, &content, StorageFlag::Text).unwrap();
        assert_eq!(blob.hash(), &hash);
        let second_mtime = std::fs::metadata(&blob_path).unwrap().modified().unwrap();
        assert_eq!(first_mtime, second_mtime);
    }
}
