//! The chunked document store the adapter persists into.
//!
//! A bucket is a pair of collections: one files record per blob, and the
//! chunk records referencing it by `files_id`. The [`Bucket`] trait is the
//! surface the adapter needs from a store client; [`mem_impl`] and
//! [`fjall_impl`] bind it to an in-process map and to a `fjall` keyspace.

use std::io::Read;

use thiserror::Error;
use tracing::warn;

use crate::chunker::{chunk_reader, ChunkingStrategy};
use crate::error::Error;
use crate::id::NativeKey;
use crate::record::{now_millis, Checksum, FileRecord, HashAlgorithm, Hasher, Metadata};

pub mod fjall_impl;
pub mod mem_impl;

pub use fjall_impl::FjallBucket;
pub use mem_impl::MemBucket;

/// Faults raised by a store client.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("keyspace error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error("write transaction conflicted with a concurrent writer")]
    Conflict,

    #[error("files record encoding error: {0}")]
    Encoding(#[from] postcard::Error),

    #[error("metadata encoding error: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("chunk {n} of {files_id} is missing")]
    MissingChunk { files_id: NativeKey, n: u32 },

    #[error("indexes of bucket `{0}` have not been ensured")]
    IndexMissing(String),

    #[error("bucket `{prefix}` uses key layout {found}, expected {expected}")]
    LayoutMismatch {
        prefix: String,
        found: u32,
        expected: u32,
    },

    #[error("invalid bucket prefix {0:?}")]
    InvalidPrefix(String),
}

/// Bucket prefixes end up in collection names.
pub fn is_valid_prefix(prefix: &str) -> bool {
    !prefix.is_empty()
        && prefix
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Key of chunk `n` of `files_id`: the key bytes, then `n` big-endian.
///
/// All chunks of a blob share a prefix and sort by `n`.
pub fn chunk_key(files_id: NativeKey, n: u32) -> [u8; 20] {
    let mut key = [0; 20];
    key[..16].copy_from_slice(files_id.as_bytes());
    key[16..].copy_from_slice(&n.to_be_bytes());
    key
}

pub trait Bucket: Send + Sync {
    /// A download cursor yielding one chunk per step.
    ///
    /// Dropping the cursor releases whatever it holds in the store.
    type Cursor: Iterator<Item = Result<Vec<u8>, StoreError>> + Send + 'static;

    fn prefix(&self) -> &str;

    /// Creates or verifies the chunk-reference index. Query paths fail until this ran.
    fn ensure_indexes(&self) -> Result<(), StoreError>;

    fn insert_chunk(&self, files_id: NativeKey, n: u32, data: &[u8]) -> Result<(), StoreError>;

    fn insert_file(&self, file: &FileRecord) -> Result<(), StoreError>;

    fn find_file(&self, id: NativeKey) -> Result<Option<FileRecord>, StoreError>;

    fn open_download_stream(&self, file: &FileRecord) -> Result<Self::Cursor, StoreError>;

    /// Removes the files records whose id is in `ids`, returning how many existed.
    fn delete_files(&self, ids: &[NativeKey]) -> Result<u64, StoreError>;

    /// Removes the chunk records whose `files_id` is in `ids`.
    fn delete_chunks(&self, ids: &[NativeKey]) -> Result<u64, StoreError>;

    fn delete_all_files(&self) -> Result<u64, StoreError>;

    fn delete_all_chunks(&self) -> Result<u64, StoreError>;

    /// Stores `source` as a new blob: chunk records first, then the files record.
    ///
    /// If reading the source or writing fails midway, chunks written so far
    /// are removed again before the error is returned.
    fn insert_blob<R: Read>(
        &self,
        source: R,
        filename: Option<String>,
        metadata: Metadata,
        chunking: &ChunkingStrategy,
        checksum: Option<HashAlgorithm>,
    ) -> Result<FileRecord, Error>
    where
        Self: Sized,
    {
        let id = NativeKey::generate();

        let written = write_chunks(self, id, source, chunking, checksum).and_then(
            |(length, chunk_count, checksum)| {
                let file = FileRecord {
                    id,
                    length,
                    chunk_size: chunking.nominal_size(),
                    chunk_count,
                    upload_date: now_millis(),
                    filename,
                    metadata,
                    checksum,
                };
                self.insert_file(&file)?;
                Ok(file)
            },
        );

        if written.is_err() {
            if let Err(err) = self.delete_chunks(&[id]) {
                warn!(%id, error = %err, "Failed to remove chunks of aborted upload");
            }
        }
        written
    }

    /// Reads a whole blob in one go.
    fn read_blob(&self, id: NativeKey) -> Result<Option<(FileRecord, Vec<u8>)>, StoreError> {
        let Some(file) = self.find_file(id)? else {
            return Ok(None);
        };
        let mut contents = Vec::with_capacity(file.length as usize);
        for chunk in self.open_download_stream(&file)? {
            contents.extend_from_slice(&chunk?);
        }
        Ok(Some((file, contents)))
    }

    /// Removes one blob, files record first. Returns whether it existed.
    fn delete(&self, id: NativeKey) -> Result<bool, StoreError> {
        let removed = self.delete_files(&[id])?;
        self.delete_chunks(&[id])?;
        Ok(removed > 0)
    }
}

fn write_chunks<B: Bucket, R: Read>(
    bucket: &B,
    id: NativeKey,
    source: R,
    chunking: &ChunkingStrategy,
    checksum: Option<HashAlgorithm>,
) -> Result<(u64, u32, Option<Checksum>), Error> {
    let mut hasher = checksum.map(Hasher::new);
    let mut length = 0;
    let mut n: u32 = 0;

    for chunk in chunk_reader(chunking, source) {
        let chunk = chunk?;
        if let Some(hasher) = &mut hasher {
            hasher.update(&chunk);
        }
        bucket.insert_chunk(id, n, &chunk)?;

        length += chunk.len() as u64;
        n = n
            .checked_add(1)
            .ok_or_else(|| Error::Config("blob exceeds the maximum chunk count".into()))?;
    }

    Ok((length, n, hasher.map(Hasher::finalize)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes() {
        assert!(is_valid_prefix("fs"));
        assert!(is_valid_prefix("user-uploads_2"));
        assert!(!is_valid_prefix(""));
        assert!(!is_valid_prefix("fs.files"));
        assert!(!is_valid_prefix("with space"));
    }

    #[test]
    fn chunk_keys_sort_by_index() {
        let id = NativeKey::generate();
        let keys: Vec<_> = [0, 1, 255, 256, 70_000].map(|n| chunk_key(id, n)).to_vec();
        assert!(keys.windows(2).all(|pair| pair[0] < pair[1]));
        assert!(keys.iter().all(|key| key.starts_with(id.as_bytes())));
    }
}
