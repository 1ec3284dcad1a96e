use std::io::{self, Read};

use fastcdc::v2020::{
    StreamCDC, AVERAGE_MAX, AVERAGE_MIN, MAXIMUM_MAX, MAXIMUM_MIN, MINIMUM_MAX, MINIMUM_MIN,
};

/// How an upload source is split into chunk records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkingStrategy {
    /// The whole blob becomes a single chunk.
    None,
    /// Chunks of exactly this many bytes, the last one possibly shorter.
    Fixed(u32),
    /// Content-defined chunking with `(min, avg, max)` sizes.
    Cdc(u32, u32, u32),
}

/// The customary GridFS chunk size, chosen so a chunk document stays below 256 KiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 255 * 1024;

const ONE_MEG: u32 = 1024 * 1024;
/// Chunk documents have to fit a 16 MiB document limit.
pub const MAX_FIXED_CHUNK_SIZE: u32 = 16 * ONE_MEG - 1024;
#[allow(clippy::identity_op)]
const MIN_CHUNK: u32 = 1 * ONE_MEG;
const AVG_CHUNK: u32 = 2 * ONE_MEG;
const MAX_CHUNK: u32 = 4 * ONE_MEG;

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Fixed(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkingStrategy {
    /// Content-defined chunking with 1/2/4 MiB bounds.
    pub fn content_defined() -> Self {
        Self::Cdc(MIN_CHUNK, AVG_CHUNK, MAX_CHUNK)
    }

    /// The chunk size recorded on files records; `0` when chunks are not uniform.
    pub fn nominal_size(&self) -> u32 {
        match *self {
            Self::None => 0,
            Self::Fixed(size) => size,
            Self::Cdc(_, avg, _) => avg,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match *self {
            Self::None => Ok(()),
            Self::Fixed(0) => Err("fixed chunk size must be non-zero".into()),
            Self::Fixed(size) if size > MAX_FIXED_CHUNK_SIZE => Err(format!(
                "fixed chunk size {size} exceeds {MAX_FIXED_CHUNK_SIZE}"
            )),
            Self::Fixed(_) => Ok(()),
            Self::Cdc(min, avg, max) => {
                if !(MINIMUM_MIN..=MINIMUM_MAX).contains(&min) {
                    return Err(format!("cdc minimum {min} out of range"));
                }
                if !(AVERAGE_MIN..=AVERAGE_MAX).contains(&avg) {
                    return Err(format!("cdc average {avg} out of range"));
                }
                if !(MAXIMUM_MIN..=MAXIMUM_MAX).contains(&max) {
                    return Err(format!("cdc maximum {max} out of range"));
                }
                if !(min <= avg && avg <= max) {
                    return Err(format!("cdc sizes must be ordered, got {min}/{avg}/{max}"));
                }
                Ok(())
            }
        }
    }
}

/// Splits `source` into chunks according to `strategy`.
///
/// The strategy is expected to have passed [`ChunkingStrategy::validate`];
/// invalid cdc bounds make `fastcdc` panic.
pub fn chunk_reader<R: Read>(strategy: &ChunkingStrategy, source: R) -> Chunks<R> {
    let inner = match *strategy {
        ChunkingStrategy::None => ChunksInner::Whole(Some(source)),
        ChunkingStrategy::Fixed(chunk_size) => ChunksInner::Fixed {
            source,
            chunk_size,
            done: false,
        },
        ChunkingStrategy::Cdc(min_size, avg_size, max_size) => {
            ChunksInner::Cdc(StreamCDC::new(source, min_size, avg_size, max_size))
        }
    };
    Chunks { inner }
}

pub struct Chunks<R: Read> {
    inner: ChunksInner<R>,
}

enum ChunksInner<R: Read> {
    Whole(Option<R>),
    Fixed {
        source: R,
        chunk_size: u32,
        done: bool,
    },
    Cdc(StreamCDC<R>),
}

impl<R: Read> Iterator for Chunks<R> {
    type Item = io::Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.inner {
            ChunksInner::Whole(source) => {
                let mut source = source.take()?;
                let mut data = vec![];
                match source.read_to_end(&mut data) {
                    Ok(0) => None,
                    Ok(_) => Some(Ok(data)),
                    Err(err) => Some(Err(err)),
                }
            }
            ChunksInner::Fixed {
                source,
                chunk_size,
                done,
            } => {
                if *done {
                    return None;
                }
                let mut data = vec![];
                let read = source.by_ref().take(*chunk_size as u64).read_to_end(&mut data);
                match read {
                    Ok(len) => {
                        if len < *chunk_size as usize {
                            *done = true;
                        }
                        (len > 0).then_some(Ok(data))
                    }
                    Err(err) => {
                        *done = true;
                        Some(Err(err))
                    }
                }
            }
            ChunksInner::Cdc(chunks) => {
                let chunk = chunks.next()?;
                Some(chunk.map(|chunk| chunk.data).map_err(io::Error::from))
            }
        }
    }
}
