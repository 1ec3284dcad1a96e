//! Attachment storage on top of a chunked document store.
//!
//! Blobs live in a bucket made of a files collection and a chunks
//! collection. [`GridStorage`] is the adapter the attachment layer talks to:
//!
//! ```rust,no_run
//! use gridstore::{Config, GridStorage, Metadata};
//!
//! let storage = GridStorage::in_memory(Config::default())?;
//!
//! let mut metadata = Metadata::new();
//! metadata.insert("filename".into(), "note.txt".into());
//! let id = storage.upload(&b"abcde"[..], "note.txt", metadata)?;
//!
//! assert!(id.ends_with(".txt"));
//! assert_eq!(storage.read(&id)?, b"abcde");
//!
//! let stream = storage.open(&id)?;
//! assert_eq!(stream.size(), 5);
//! # Ok::<(), gridstore::Error>(())
//! ```

pub mod bucket;
pub mod chunker;
pub mod error;
pub mod gridfs;
pub mod id;
pub mod record;
pub mod storage;
pub mod stream;

pub use bucket::{Bucket, FjallBucket, MemBucket, StoreError};
pub use chunker::ChunkingStrategy;
pub use error::{Error, Result};
pub use gridfs::{Config, GridStorage, DEFAULT_PREFIX};
pub use id::NativeKey;
pub use record::{Checksum, FileRecord, HashAlgorithm, Metadata};
pub use storage::Storage;
pub use stream::ChunkedDownloadStream;
