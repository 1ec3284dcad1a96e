use core::fmt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::*;

#[derive(Default)]
struct Collections {
    files: HashMap<NativeKey, FileRecord>,
    chunks: BTreeMap<(NativeKey, u32), Vec<u8>>,
    indexed: bool,
}

impl fmt::Debug for Collections {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collections")
            .field("files", &self.files.len())
            .field("chunks", &self.chunks.len())
            .field("indexed", &self.indexed)
            .finish()
    }
}

/// A bucket held in process memory.
///
/// Clones share the same collections.
#[derive(Debug, Clone)]
pub struct MemBucket {
    prefix: String,
    collections: Arc<RwLock<Collections>>,
    open_cursors: Arc<AtomicUsize>,
}

impl MemBucket {
    pub fn new(prefix: &str) -> Result<Self, StoreError> {
        if !is_valid_prefix(prefix) {
            return Err(StoreError::InvalidPrefix(prefix.into()));
        }
        Ok(Self {
            prefix: prefix.into(),
            collections: Default::default(),
            open_cursors: Default::default(),
        })
    }

    /// Download cursors that have been opened and not yet dropped.
    pub fn open_cursors(&self) -> usize {
        self.open_cursors.load(Ordering::SeqCst)
    }

    pub fn file_count(&self) -> usize {
        self.read().files.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.read().chunks.len()
    }

    fn read(&self) -> RwLockReadGuard<'_, Collections> {
        self.collections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Collections> {
        self.collections
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn indexed_read(&self) -> Result<RwLockReadGuard<'_, Collections>, StoreError> {
        let collections = self.read();
        if !collections.indexed {
            return Err(StoreError::IndexMissing(self.prefix.clone()));
        }
        Ok(collections)
    }

    fn indexed_write(&self) -> Result<RwLockWriteGuard<'_, Collections>, StoreError> {
        let collections = self.write();
        if !collections.indexed {
            return Err(StoreError::IndexMissing(self.prefix.clone()));
        }
        Ok(collections)
    }
}

impl Bucket for MemBucket {
    type Cursor = MemCursor;

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn ensure_indexes(&self) -> Result<(), StoreError> {
        // the chunk map is ordered by `(files_id, n)`, which is the index
        self.write().indexed = true;
        Ok(())
    }

    fn insert_chunk(&self, files_id: NativeKey, n: u32, data: &[u8]) -> Result<(), StoreError> {
        self.write().chunks.insert((files_id, n), data.to_vec());
        Ok(())
    }

    fn insert_file(&self, file: &FileRecord) -> Result<(), StoreError> {
        self.write().files.insert(file.id, file.clone());
        Ok(())
    }

    fn find_file(&self, id: NativeKey) -> Result<Option<FileRecord>, StoreError> {
        Ok(self.indexed_read()?.files.get(&id).cloned())
    }

    fn open_download_stream(&self, file: &FileRecord) -> Result<MemCursor, StoreError> {
        drop(self.indexed_read()?);
        self.open_cursors.fetch_add(1, Ordering::SeqCst);
        Ok(MemCursor {
            collections: Arc::clone(&self.collections),
            open_cursors: Arc::clone(&self.open_cursors),
            files_id: file.id,
            n: 0,
            chunk_count: file.chunk_count,
        })
    }

    fn delete_files(&self, ids: &[NativeKey]) -> Result<u64, StoreError> {
        let mut collections = self.indexed_write()?;
        let mut removed = 0;
        for id in ids {
            if collections.files.remove(id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn delete_chunks(&self, ids: &[NativeKey]) -> Result<u64, StoreError> {
        let ids: HashSet<_> = ids.iter().collect();
        let mut collections = self.indexed_write()?;
        let before = collections.chunks.len();
        collections
            .chunks
            .retain(|(files_id, _n), _data| !ids.contains(files_id));
        Ok((before - collections.chunks.len()) as u64)
    }

    fn delete_all_files(&self) -> Result<u64, StoreError> {
        let mut collections = self.indexed_write()?;
        let removed = collections.files.len();
        collections.files.clear();
        Ok(removed as u64)
    }

    fn delete_all_chunks(&self) -> Result<u64, StoreError> {
        let mut collections = self.indexed_write()?;
        let removed = collections.chunks.len();
        collections.chunks.clear();
        Ok(removed as u64)
    }
}

/// Reads chunks one lookup at a time; chunks deleted mid-read surface as
/// [`StoreError::MissingChunk`].
pub struct MemCursor {
    collections: Arc<RwLock<Collections>>,
    open_cursors: Arc<AtomicUsize>,
    files_id: NativeKey,
    n: u32,
    chunk_count: u32,
}

impl Iterator for MemCursor {
    type Item = Result<Vec<u8>, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.n >= self.chunk_count {
            return None;
        }
        let n = self.n;
        self.n += 1;

        let collections = self
            .collections
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let chunk = collections
            .chunks
            .get(&(self.files_id, n))
            .cloned()
            .ok_or(StoreError::MissingChunk {
                files_id: self.files_id,
                n,
            });
        Some(chunk)
    }
}

impl Drop for MemCursor {
    fn drop(&mut self) {
        self.open_cursors.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket() -> MemBucket {
        let bucket = MemBucket::new("fs").unwrap();
        bucket.ensure_indexes().unwrap();
        bucket
    }

    fn insert(bucket: &MemBucket, contents: &[u8]) -> FileRecord {
        bucket
            .insert_blob(
                contents,
                Some("blob.bin".into()),
                Metadata::new(),
                &ChunkingStrategy::Fixed(4),
                Some(HashAlgorithm::Blake3),
            )
            .unwrap()
    }

    #[test]
    fn queries_need_indexes() {
        let bucket = MemBucket::new("fs").unwrap();
        let err = bucket.find_file(NativeKey::generate()).unwrap_err();
        assert!(matches!(err, StoreError::IndexMissing(ref prefix) if prefix == "fs"));

        bucket.ensure_indexes().unwrap();
        assert!(bucket.find_file(NativeKey::generate()).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_prefix() {
        assert!(matches!(
            MemBucket::new("fs.files"),
            Err(StoreError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn insert_and_read_blob() {
        let bucket = bucket();
        let file = insert(&bucket, b"chunked contents");

        assert_eq!(file.length, 16);
        assert_eq!(file.chunk_count, 4);
        assert_eq!(bucket.chunk_count(), 4);
        assert_eq!(file.checksum, Some(Checksum::of(HashAlgorithm::Blake3, b"chunked contents")));

        let (found, contents) = bucket.read_blob(file.id).unwrap().unwrap();
        assert_eq!(found, file);
        assert_eq!(contents, b"chunked contents");
        assert_eq!(bucket.open_cursors(), 0);
    }

    #[test]
    fn cursor_releases_on_drop() {
        let bucket = bucket();
        let file = insert(&bucket, b"some bytes here");

        let mut cursor = bucket.open_download_stream(&file).unwrap();
        assert_eq!(bucket.open_cursors(), 1);
        assert_eq!(cursor.next().unwrap().unwrap(), b"some");
        drop(cursor);
        assert_eq!(bucket.open_cursors(), 0);
    }

    #[test]
    fn delete_removes_both_collections() {
        let bucket = bucket();
        let keep = insert(&bucket, b"keep me");
        let gone = insert(&bucket, b"delete me");

        assert!(bucket.delete(gone.id).unwrap());
        assert!(!bucket.delete(gone.id).unwrap());

        assert_eq!(bucket.file_count(), 1);
        assert_eq!(bucket.chunk_count(), keep.chunk_count as usize);
        assert!(bucket.read_blob(keep.id).unwrap().is_some());
    }

    #[test]
    fn missing_chunk_is_reported() {
        let bucket = bucket();
        let file = insert(&bucket, b"abcdefgh");
        bucket.write().chunks.remove(&(file.id, 1));

        let err = bucket.read_blob(file.id).unwrap_err();
        assert!(matches!(err, StoreError::MissingChunk { n: 1, .. }));
    }

    #[test]
    fn failed_upload_leaves_no_chunks() {
        struct FailAfter(usize);
        impl Read for FailAfter {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                if self.0 == 0 {
                    return Err(std::io::Error::other("connection reset"));
                }
                let len = buf.len().min(self.0);
                buf[..len].fill(b'x');
                self.0 -= len;
                Ok(len)
            }
        }

        let bucket = bucket();
        let err = bucket
            .insert_blob(
                FailAfter(10),
                None,
                Metadata::new(),
                &ChunkingStrategy::Fixed(4),
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(bucket.chunk_count(), 0);
        assert_eq!(bucket.file_count(), 0);
    }
}
