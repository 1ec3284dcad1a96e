use std::io::Read;

use tempfile::NamedTempFile;

use crate::bucket::Bucket;
use crate::gridfs::GridStorage;
use crate::record::Metadata;
use crate::stream::ChunkedDownloadStream;

/// What a file-attachment layer needs from a storage backend.
pub trait Storage {
    type Error: std::error::Error + Send + Sync + 'static;
    type Stream: Read;

    /// Stores `content`, returning the identifier to use from now on.
    fn upload(
        &self,
        content: &mut dyn Read,
        proposed_id: &str,
        metadata: Metadata,
    ) -> Result<String, Self::Error>;

    fn download(&self, id: &str) -> Result<NamedTempFile, Self::Error>;

    fn open(&self, id: &str) -> Result<Self::Stream, Self::Error>;

    fn read(&self, id: &str) -> Result<Vec<u8>, Self::Error>;

    fn exists(&self, id: &str) -> Result<bool, Self::Error>;

    fn delete(&self, id: &str) -> Result<(), Self::Error>;

    fn multi_delete(&self, ids: &[String]) -> Result<(), Self::Error>;

    fn clear(&self) -> Result<(), Self::Error>;

    fn url(&self, id: &str) -> Option<String>;
}

impl<B: Bucket> Storage for GridStorage<B> {
    type Error = crate::Error;
    type Stream = ChunkedDownloadStream;

    fn upload(
        &self,
        content: &mut dyn Read,
        proposed_id: &str,
        metadata: Metadata,
    ) -> Result<String, Self::Error> {
        GridStorage::upload(self, content, proposed_id, metadata)
    }

    fn download(&self, id: &str) -> Result<NamedTempFile, Self::Error> {
        GridStorage::download(self, id)
    }

    fn open(&self, id: &str) -> Result<ChunkedDownloadStream, Self::Error> {
        GridStorage::open(self, id)
    }

    fn read(&self, id: &str) -> Result<Vec<u8>, Self::Error> {
        GridStorage::read(self, id)
    }

    fn exists(&self, id: &str) -> Result<bool, Self::Error> {
        GridStorage::exists(self, id)
    }

    fn delete(&self, id: &str) -> Result<(), Self::Error> {
        GridStorage::delete(self, id)
    }

    fn multi_delete(&self, ids: &[String]) -> Result<(), Self::Error> {
        GridStorage::multi_delete(self, ids)
    }

    fn clear(&self) -> Result<(), Self::Error> {
        GridStorage::clear(self)
    }

    fn url(&self, id: &str) -> Option<String> {
        GridStorage::url(self, id)
    }
}
