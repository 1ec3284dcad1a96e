//! Lazy, size-known download streams.

use core::fmt;
use std::io::{self, Read};

use crate::error::{Error, Result};

type ChunkIter = Box<dyn Iterator<Item = Result<Vec<u8>>> + Send>;
type OnClose = Box<dyn FnOnce() + Send>;

/// A blob's contents as a forward-only sequence of chunks.
///
/// The total [`size`](Self::size) is known before any chunk is read. The
/// underlying chunk source is released exactly once: on [`close`](Self::close),
/// when the sequence is exhausted, after the first error, or on drop,
/// whichever comes first. The stream cannot be restarted.
pub struct ChunkedDownloadStream {
    /// External identifier of the blob, for error reporting.
    id: String,
    size: u64,
    chunks: Option<ChunkIter>,
    on_close: Option<OnClose>,
    /// Bytes handed out as chunks so far.
    yielded: u64,
    /// The chunk currently being drained through [`Read`].
    pending: Vec<u8>,
    pending_pos: usize,
}

impl ChunkedDownloadStream {
    pub fn new<I, F>(id: impl Into<String>, size: u64, chunks: I, on_close: F) -> Self
    where
        I: Iterator<Item = Result<Vec<u8>>> + Send + 'static,
        F: FnOnce() + Send + 'static,
    {
        Self {
            id: id.into(),
            size,
            chunks: Some(Box::new(chunks)),
            on_close: Some(Box::new(on_close)),
            yielded: 0,
            pending: vec![],
            pending_pos: 0,
        }
    }

    /// Total byte length of the blob.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Bytes yielded as chunks so far.
    pub fn position(&self) -> u64 {
        self.yielded
    }

    pub fn is_closed(&self) -> bool {
        self.chunks.is_none()
    }

    /// Fetches the next chunk, or `None` once the stream is exhausted or closed.
    pub fn next_chunk(&mut self) -> Option<Result<Vec<u8>>> {
        let chunks = self.chunks.as_mut()?;
        match chunks.next() {
            Some(Ok(chunk)) => {
                self.yielded += chunk.len() as u64;
                if self.yielded > self.size {
                    self.close();
                    return Some(Err(self.length_mismatch()));
                }
                Some(Ok(chunk))
            }
            Some(Err(err)) => {
                self.close();
                Some(Err(err))
            }
            None => {
                self.close();
                if self.yielded < self.size {
                    return Some(Err(self.length_mismatch()));
                }
                None
            }
        }
    }

    fn length_mismatch(&self) -> Error {
        Error::corrupt(
            &self.id,
            format!("chunks hold {} bytes, record says {}", self.yielded, self.size),
        )
    }

    /// Releases the chunk source and runs the close callback. Idempotent.
    pub fn close(&mut self) {
        // drop the source before the callback observes the release
        drop(self.chunks.take());
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.pending = vec![];
        self.pending_pos = 0;
    }
}

impl Iterator for ChunkedDownloadStream {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk()
    }
}

impl Read for ChunkedDownloadStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pending_pos >= self.pending.len() {
            match self.next_chunk() {
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pending_pos = 0;
                }
                Some(Err(err)) => return Err(io::Error::other(err)),
                None => return Ok(0),
            }
        }

        let available = &self.pending[self.pending_pos..];
        let len = available.len().min(buf.len());
        buf[..len].copy_from_slice(&available[..len]);
        self.pending_pos += len;
        Ok(len)
    }
}

impl Drop for ChunkedDownloadStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ChunkedDownloadStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkedDownloadStream")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("position", &self.yielded)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn stream(chunks: Vec<Result<Vec<u8>>>) -> (ChunkedDownloadStream, Arc<AtomicUsize>) {
        let size = chunks
            .iter()
            .map(|chunk| chunk.as_ref().map_or(0, |c| c.len() as u64))
            .sum();
        stream_with_size(size, chunks)
    }

    fn stream_with_size(
        size: u64,
        chunks: Vec<Result<Vec<u8>>>,
    ) -> (ChunkedDownloadStream, Arc<AtomicUsize>) {
        let closed = Arc::new(AtomicUsize::new(0));
        let on_close = {
            let closed = Arc::clone(&closed);
            move || {
                closed.fetch_add(1, Ordering::SeqCst);
            }
        };
        (
            ChunkedDownloadStream::new("blob.txt", size, chunks.into_iter(), on_close),
            closed,
        )
    }

    #[test]
    fn size_is_known_up_front() {
        let (stream, closed) = stream(vec![Ok(b"abc".to_vec()), Ok(b"de".to_vec())]);
        assert_eq!(stream.size(), 5);
        assert_eq!(stream.position(), 0);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn exhaustion_closes_once() {
        let (mut stream, closed) = stream(vec![Ok(b"abc".to_vec()), Ok(b"de".to_vec())]);
        let chunks: Vec<_> = (&mut stream).collect::<Result<_>>().unwrap();
        assert_eq!(chunks.concat(), b"abcde");
        assert!(stream.is_closed());
        assert!(stream.next_chunk().is_none());

        stream.close();
        drop(stream);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn early_close_releases() {
        let (mut stream, closed) = stream(vec![Ok(b"abc".to_vec()), Ok(b"de".to_vec())]);
        assert_eq!(stream.next_chunk().unwrap().unwrap(), b"abc");
        stream.close();
        assert!(stream.next_chunk().is_none());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_releases() {
        let (stream, closed) = stream(vec![Ok(b"abc".to_vec())]);
        drop(stream);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn error_midway_releases() {
        let (mut stream, closed) = stream(vec![
            Ok(b"abc".to_vec()),
            Err(Error::Config("boom".into())),
            Ok(b"never".to_vec()),
        ]);
        assert!(stream.next_chunk().unwrap().is_ok());
        assert!(stream.next_chunk().unwrap().is_err());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(stream.next_chunk().is_none());
    }

    #[test]
    fn short_sequence_is_an_error() {
        let (mut stream, closed) = stream_with_size(10, vec![Ok(b"abc".to_vec())]);
        assert!(stream.next_chunk().unwrap().is_ok());
        let err = stream.next_chunk().unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Corrupt { ref id, ref reason } if id == "blob.txt" && reason.contains("3 bytes")
        ));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn overlong_sequence_is_an_error() {
        let (mut stream, closed) = stream_with_size(2, vec![Ok(b"abc".to_vec())]);
        let err = stream.next_chunk().unwrap().unwrap_err();
        assert!(matches!(err, Error::Corrupt { ref id, .. } if id == "blob.txt"));
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn reads_across_chunk_boundaries() {
        let (mut stream, closed) = stream(vec![
            Ok(b"hel".to_vec()),
            Ok(vec![]),
            Ok(b"lo wor".to_vec()),
            Ok(b"ld".to_vec()),
        ]);
        let mut small = [0; 4];
        assert_eq!(stream.read(&mut small).unwrap(), 3);
        assert_eq!(&small[..3], b"hel");

        let mut rest = String::new();
        stream.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "lo world");
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn read_surfaces_chunk_errors() {
        let (mut stream, _closed) = stream(vec![
            Ok(b"abc".to_vec()),
            Err(Error::NotFound("gone".into())),
        ]);
        let mut buf = vec![];
        let err = stream.read_to_end(&mut buf).unwrap_err();
        assert_eq!(buf, b"abc");
        assert!(err.to_string().contains("gone"));
    }
}
