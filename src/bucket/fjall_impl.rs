use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use fjall::{ReadTransaction, TransactionalKeyspace, TransactionalPartitionHandle};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::*;

/// Version of the chunk key layout, see [`chunk_key`].
const KEY_LAYOUT: u32 = 1;
const LAYOUT_KEY: &[u8] = b"key_layout";

/// A bucket stored as partitions of a transactional `fjall` keyspace.
///
/// Several buckets may share one keyspace as long as their prefixes differ.
pub struct FjallBucket {
    prefix: String,
    keyspace: TransactionalKeyspace,
    files: TransactionalPartitionHandle,
    chunks: TransactionalPartitionHandle,
    meta: TransactionalPartitionHandle,
    indexed: AtomicBool,
}

/// The files record as persisted; metadata is kept as JSON text since
/// `postcard` cannot carry self-describing values.
#[derive(Serialize, Deserialize)]
struct FileDocument {
    id: [u8; 16],
    length: u64,
    chunk_size: u32,
    chunk_count: u32,
    upload_date: u64,
    filename: Option<String>,
    metadata: String,
    checksum: Option<Checksum>,
}

impl FileDocument {
    fn encode(file: &FileRecord) -> Result<Vec<u8>, StoreError> {
        let document = FileDocument {
            id: *file.id.as_bytes(),
            length: file.length,
            chunk_size: file.chunk_size,
            chunk_count: file.chunk_count,
            upload_date: file.upload_date,
            filename: file.filename.clone(),
            metadata: serde_json::to_string(&file.metadata)?,
            checksum: file.checksum.clone(),
        };
        Ok(postcard::to_stdvec(&document)?)
    }

    fn decode(bytes: &[u8]) -> Result<FileRecord, StoreError> {
        let document: FileDocument = postcard::from_bytes(bytes)?;
        Ok(FileRecord {
            id: NativeKey::from_bytes(document.id),
            length: document.length,
            chunk_size: document.chunk_size,
            chunk_count: document.chunk_count,
            upload_date: document.upload_date,
            filename: document.filename,
            metadata: serde_json::from_str(&document.metadata)?,
            checksum: document.checksum,
        })
    }
}

impl FjallBucket {
    pub fn open(keyspace: &TransactionalKeyspace, prefix: &str) -> Result<Self, StoreError> {
        if !is_valid_prefix(prefix) {
            return Err(StoreError::InvalidPrefix(prefix.into()));
        }
        let files = keyspace.open_partition(&format!("{prefix}_files"), Default::default())?;
        let chunks = keyspace.open_partition(&format!("{prefix}_chunks"), Default::default())?;
        let meta = keyspace.open_partition(&format!("{prefix}_meta"), Default::default())?;

        Ok(Self {
            prefix: prefix.into(),
            keyspace: keyspace.clone(),
            files,
            chunks,
            meta,
            indexed: AtomicBool::new(false),
        })
    }

    /// Opens (or creates) a keyspace at `path` holding just this bucket.
    pub fn open_path(path: impl AsRef<Path>, prefix: &str) -> Result<Self, StoreError> {
        let keyspace = fjall::Config::new(path).open_transactional()?;
        Self::open(&keyspace, prefix)
    }

    pub fn keyspace(&self) -> &TransactionalKeyspace {
        &self.keyspace
    }

    fn check_indexed(&self) -> Result<(), StoreError> {
        if self.indexed.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::IndexMissing(self.prefix.clone()))
        }
    }

    fn commit_removals(
        &self,
        partition: &TransactionalPartitionHandle,
        keys: Vec<fjall::Slice>,
    ) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = keys.len() as u64;
        let mut write_tx = self.keyspace.write_tx()?;
        for key in keys {
            write_tx.remove(partition, key);
        }
        write_tx.commit()?.map_err(|_| StoreError::Conflict)?;
        Ok(removed)
    }

    fn all_keys(
        &self,
        partition: &TransactionalPartitionHandle,
    ) -> Result<Vec<fjall::Slice>, StoreError> {
        let read_tx = self.keyspace.read_tx();
        let mut keys = vec![];
        for kv in read_tx.iter(partition) {
            let (key, _value) = kv?;
            keys.push(key);
        }
        Ok(keys)
    }
}

impl Bucket for FjallBucket {
    type Cursor = FjallCursor;

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn ensure_indexes(&self) -> Result<(), StoreError> {
        // chunk keys start with their `files_id`, so the chunks partition is
        // its own index as long as every writer agrees on the layout
        match self.meta.get(LAYOUT_KEY)? {
            None => {
                self.meta
                    .insert(LAYOUT_KEY, KEY_LAYOUT.to_be_bytes().to_vec())?;
                debug!(prefix = %self.prefix, layout = KEY_LAYOUT, "Recorded chunk key layout");
            }
            Some(stored) => {
                let found = <[u8; 4]>::try_from(stored.as_ref())
                    .map(u32::from_be_bytes)
                    .unwrap_or(0);
                if found != KEY_LAYOUT {
                    return Err(StoreError::LayoutMismatch {
                        prefix: self.prefix.clone(),
                        found,
                        expected: KEY_LAYOUT,
                    });
                }
            }
        }
        self.indexed.store(true, Ordering::Release);
        Ok(())
    }

    fn insert_chunk(&self, files_id: NativeKey, n: u32, data: &[u8]) -> Result<(), StoreError> {
        self.chunks.insert(&chunk_key(files_id, n)[..], data)?;
        Ok(())
    }

    fn insert_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        let document = FileDocument::encode(file)?;
        self.files.insert(&file.id.as_bytes()[..], document)?;
        Ok(())
    }

    fn find_file(&self, id: NativeKey) -> Result<Option<FileRecord>, StoreError> {
        self.check_indexed()?;
        self.files
            .get(id.as_bytes())?
            .map(|document| FileDocument::decode(&document))
            .transpose()
    }

    fn open_download_stream(&self, file: &FileRecord) -> Result<FjallCursor, StoreError> {
        self.check_indexed()?;
        Ok(FjallCursor {
            snapshot: Some(self.keyspace.read_tx()),
            chunks: self.chunks.clone(),
            files_id: file.id,
            n: 0,
            chunk_count: file.chunk_count,
        })
    }

    fn delete_files(&self, ids: &[NativeKey]) -> Result<u64, StoreError> {
        self.check_indexed()?;
        let read_tx = self.keyspace.read_tx();
        let mut keys = vec![];
        for id in ids {
            if read_tx.contains_key(&self.files, id.as_bytes())? {
                keys.push(fjall::Slice::from(&id.as_bytes()[..]));
            }
        }
        self.commit_removals(&self.files, keys)
    }

    fn delete_chunks(&self, ids: &[NativeKey]) -> Result<u64, StoreError> {
        self.check_indexed()?;
        let read_tx = self.keyspace.read_tx();
        let mut keys = vec![];
        for id in ids {
            for kv in read_tx.prefix(&self.chunks, id.as_bytes()) {
                let (key, _data) = kv?;
                keys.push(key);
            }
        }
        self.commit_removals(&self.chunks, keys)
    }

    fn delete_all_files(&self) -> Result<u64, StoreError> {
        self.check_indexed()?;
        let keys = self.all_keys(&self.files)?;
        self.commit_removals(&self.files, keys)
    }

    fn delete_all_chunks(&self) -> Result<u64, StoreError> {
        self.check_indexed()?;
        let keys = self.all_keys(&self.chunks)?;
        self.commit_removals(&self.chunks, keys)
    }
}

/// Reads chunks by point lookups against the snapshot taken when the
/// cursor was opened. The snapshot is released once the last chunk was
/// read, or when the cursor is dropped.
pub struct FjallCursor {
    snapshot: Option<ReadTransaction>,
    chunks: TransactionalPartitionHandle,
    files_id: NativeKey,
    n: u32,
    chunk_count: u32,
}

impl Iterator for FjallCursor {
    type Item = Result<Vec<u8>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.n >= self.chunk_count {
            self.snapshot = None;
            return None;
        }
        let snapshot = self.snapshot.as_ref()?;
        let n = self.n;
        self.n += 1;

        let chunk = match snapshot.get(&self.chunks, chunk_key(self.files_id, n)) {
            Ok(Some(data)) => Ok(data.to_vec()),
            Ok(None) => Err(StoreError::MissingChunk {
                files_id: self.files_id,
                n,
            }),
            Err(err) => Err(err.into()),
        };
        Some(chunk)
    }
}
