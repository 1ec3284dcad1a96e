//! The blob storage adapter.

use std::io::{Read, Seek, Write};

use fjall::TransactionalKeyspace;
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument, warn};

use crate::bucket::{is_valid_prefix, Bucket, FjallBucket, MemBucket};
use crate::chunker::ChunkingStrategy;
use crate::error::{Error, Result};
use crate::id::{self, NativeKey};
use crate::record::{Checksum, FileRecord, HashAlgorithm, Metadata};
use crate::stream::ChunkedDownloadStream;

/// Bucket prefix used when none is configured.
pub const DEFAULT_PREFIX: &str = "fs";

#[derive(Debug, Clone)]
pub struct Config {
    /// Name prefix of the bucket's collections.
    pub prefix: String,
    pub chunking: ChunkingStrategy,
    /// Checksum recorded on upload and verified by [`GridStorage::read`].
    pub checksum: Option<HashAlgorithm>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.into(),
            chunking: ChunkingStrategy::default(),
            checksum: Some(HashAlgorithm::Blake3),
        }
    }
}

impl Config {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_chunking(mut self, chunking: ChunkingStrategy) -> Self {
        self.chunking = chunking;
        self
    }

    pub fn with_checksum(mut self, checksum: Option<HashAlgorithm>) -> Self {
        self.checksum = checksum;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !is_valid_prefix(&self.prefix) {
            return Err(Error::Config(format!(
                "bucket prefix {:?} must be non-empty ascii alphanumerics, `_` or `-`",
                self.prefix
            )));
        }
        self.chunking.validate().map_err(Error::Config)
    }
}

/// Stores attachment blobs in a [`Bucket`].
///
/// Identifiers handed out by [`upload`](Self::upload) are `<native key><ext>`;
/// see [`crate::id`]. The adapter keeps no mutable state of its own, so a
/// single instance can serve concurrent callers.
pub struct GridStorage<B> {
    bucket: B,
    config: Config,
}

impl GridStorage<MemBucket> {
    pub fn in_memory(config: Config) -> Result<Self> {
        config.validate()?;
        let bucket = MemBucket::new(&config.prefix)?;
        Self::with_validated(bucket, config)
    }
}

impl GridStorage<FjallBucket> {
    /// Opens the bucket named by `config.prefix` inside `keyspace`.
    pub fn with_keyspace(keyspace: &TransactionalKeyspace, config: Config) -> Result<Self> {
        config.validate()?;
        let bucket = FjallBucket::open(keyspace, &config.prefix)?;
        Self::with_validated(bucket, config)
    }
}

impl<B: Bucket> GridStorage<B> {
    /// Wraps `bucket`, making sure its indexes exist first.
    pub fn new(bucket: B, config: Config) -> Result<Self> {
        config.validate()?;
        Self::with_validated(bucket, config)
    }

    fn with_validated(bucket: B, config: Config) -> Result<Self> {
        if bucket.prefix() != config.prefix {
            return Err(Error::Config(format!(
                "bucket prefix {:?} does not match configured prefix {:?}",
                bucket.prefix(),
                config.prefix
            )));
        }
        bucket.ensure_indexes()?;
        info!(prefix = %config.prefix, chunking = ?config.chunking, "Blob storage initialized");

        Ok(Self { bucket, config })
    }

    pub fn bucket(&self) -> &B {
        &self.bucket
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Stores `content` as a new blob and returns its identifier.
    ///
    /// The stored filename is `metadata["filename"]` if that is a string, else
    /// `proposed_id`. The returned identifier is freshly assigned and only
    /// borrows the extension of `proposed_id`.
    #[instrument(skip(self, content, metadata), fields(bucket = %self.config.prefix))]
    pub fn upload<R: Read>(&self, content: R, proposed_id: &str, metadata: Metadata) -> Result<String> {
        let filename = metadata
            .get("filename")
            .and_then(|filename| filename.as_str())
            .unwrap_or(proposed_id)
            .to_owned();

        let file = self.bucket.insert_blob(
            content,
            Some(filename),
            metadata,
            &self.config.chunking,
            self.config.checksum,
        )?;
        let external_id = id::encode(file.id, proposed_id);

        debug!(
            id = %external_id,
            length = file.length,
            chunks = file.chunk_count,
            "Stored blob"
        );
        Ok(external_id)
    }

    /// Opens a lazy download stream; no chunk is read until asked for.
    #[instrument(skip(self))]
    pub fn open(&self, external_id: &str) -> Result<ChunkedDownloadStream> {
        let file = self.find(external_id)?;
        let cursor = self.bucket.open_download_stream(&file)?;

        let released_id = external_id.to_owned();
        Ok(ChunkedDownloadStream::new(
            external_id,
            file.length,
            cursor.map(|chunk| chunk.map_err(Error::from)),
            move || debug!(id = %released_id, "Released download cursor"),
        ))
    }

    /// Reads a whole blob into memory, verifying its length and checksum.
    #[instrument(skip(self))]
    pub fn read(&self, external_id: &str) -> Result<Vec<u8>> {
        let key = id::decode(external_id)?;
        let (file, contents) = self
            .bucket
            .read_blob(key)?
            .ok_or_else(|| Error::not_found(external_id))?;

        if contents.len() as u64 != file.length {
            return Err(Error::corrupt(
                external_id,
                format!("read {} bytes, record says {}", contents.len(), file.length),
            ));
        }
        if let Some(expected) = &file.checksum {
            if Checksum::of(expected.algorithm, &contents) != *expected {
                return Err(Error::corrupt(external_id, "checksum mismatch"));
            }
        }
        Ok(contents)
    }

    /// Drains the blob into a fresh temporary file, rewound to the start.
    #[instrument(skip(self))]
    pub fn download(&self, external_id: &str) -> Result<NamedTempFile> {
        let mut stream = self.open(external_id)?;
        let mut tempfile = tempfile::Builder::new()
            .prefix("gridstore-")
            .suffix(id::extension(external_id).unwrap_or_default())
            .tempfile()?;

        for chunk in &mut stream {
            tempfile.write_all(&chunk?)?;
        }
        tempfile.flush()?;
        tempfile.rewind()?;
        Ok(tempfile)
    }

    /// The files record of a blob.
    pub fn info(&self, external_id: &str) -> Result<FileRecord> {
        self.find(external_id)
    }

    /// Whether the blob exists. A missing blob is `Ok(false)`, never an error.
    pub fn exists(&self, external_id: &str) -> Result<bool> {
        let key = id::decode(external_id)?;
        Ok(self.bucket.find_file(key)?.is_some())
    }

    /// Deletes one blob. Deleting a missing blob succeeds.
    #[instrument(skip(self))]
    pub fn delete(&self, external_id: &str) -> Result<()> {
        let key = id::decode(external_id)?;
        let existed = self.bucket.delete(key)?;
        debug!(existed, "Deleted blob");
        Ok(())
    }

    /// Deletes many blobs with one query per collection.
    ///
    /// All identifiers are decoded before anything is removed. The files and
    /// chunks deletes are separate steps; a fault in between leaves orphaned
    /// chunks behind.
    #[instrument(skip_all)]
    pub fn multi_delete<I, S>(&self, external_ids: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = external_ids
            .into_iter()
            .map(|external_id| id::decode(external_id.as_ref()))
            .collect::<Result<Vec<NativeKey>>>()?;
        if keys.is_empty() {
            return Ok(());
        }

        let files = self.bucket.delete_files(&keys)?;
        let chunks = self.bucket.delete_chunks(&keys)?;
        debug!(requested = keys.len(), files, chunks, "Deleted blobs");
        Ok(())
    }

    /// Removes every blob in the bucket.
    #[instrument(skip(self), fields(bucket = %self.config.prefix))]
    pub fn clear(&self) -> Result<()> {
        let files = self.bucket.delete_all_files()?;
        let chunks = self.bucket.delete_all_chunks()?;
        info!(files, chunks, "Cleared bucket");
        Ok(())
    }

    /// Blobs in a bucket are not web-addressable, so there is never a URL.
    pub fn url(&self, _external_id: &str) -> Option<String> {
        None
    }

    /// Calls `on_chunk(chunk, total_length)` for every chunk of the blob.
    #[deprecated(note = "iterate the chunks of the stream returned by `open` instead")]
    pub fn stream<F>(&self, external_id: &str, mut on_chunk: F) -> Result<()>
    where
        F: FnMut(&[u8], u64),
    {
        warn!(
            id = %external_id,
            "GridStorage::stream is deprecated, iterate the chunks returned by GridStorage::open"
        );
        let mut stream = self.open(external_id)?;
        let size = stream.size();
        for chunk in &mut stream {
            on_chunk(&chunk?, size);
        }
        Ok(())
    }

    fn find(&self, external_id: &str) -> Result<FileRecord> {
        let key = id::decode(external_id)?;
        self.bucket
            .find_file(key)?
            .ok_or_else(|| Error::not_found(external_id))
    }
}
