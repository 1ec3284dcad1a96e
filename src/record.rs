use core::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha1::Digest as _;

use crate::id::NativeKey;

/// Free-form metadata attached to a blob by the attachment layer.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HashAlgorithm {
    Sha1 = 0,
    Blake3 = 1,
}

/// A digest over the full blob contents, stored on the files record.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Checksum {
    pub algorithm: HashAlgorithm,
    pub digest: Vec<u8>,
}

impl Checksum {
    pub fn of(algorithm: HashAlgorithm, data: &[u8]) -> Self {
        let mut hasher = Hasher::new(algorithm);
        hasher.update(data);
        hasher.finalize()
    }
}

/// Incremental checksum computation over uploaded chunks.
pub enum Hasher {
    Sha1(sha1::Sha1),
    Blake3(Box<blake3::Hasher>),
}

impl Hasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha1 => Self::Sha1(sha1::Sha1::new()),
            HashAlgorithm::Blake3 => Self::Blake3(Box::default()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha1(hasher) => hasher.update(data),
            Self::Blake3(hasher) => {
                hasher.update(data);
            }
        }
    }

    pub fn finalize(self) -> Checksum {
        match self {
            Self::Sha1(hasher) => Checksum {
                algorithm: HashAlgorithm::Sha1,
                digest: hasher.finalize().to_vec(),
            },
            Self::Blake3(hasher) => Checksum {
                algorithm: HashAlgorithm::Blake3,
                digest: hasher.finalize().as_bytes().to_vec(),
            },
        }
    }
}

/// One record of the files collection.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub id: NativeKey,
    /// Total byte length, the sum of all chunk lengths.
    pub length: u64,
    /// Nominal chunk size used at upload time.
    pub chunk_size: u32,
    pub chunk_count: u32,
    /// Milliseconds since the unix epoch.
    pub upload_date: u64,
    pub filename: Option<String>,
    pub metadata: Metadata,
    pub checksum: Option<Checksum>,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

impl fmt::Debug for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.algorithm {
            HashAlgorithm::Sha1 => {
                write!(f, "Checksum(SHA1:{:x})", base16ct::HexDisplay(&self.digest))
            }
            HashAlgorithm::Blake3 => {
                write!(f, "Checksum(BLAKE3:{:x})", base16ct::HexDisplay(&self.digest))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_one_shot() {
        for algorithm in [HashAlgorithm::Sha1, HashAlgorithm::Blake3] {
            let mut hasher = Hasher::new(algorithm);
            hasher.update(b"hello ");
            hasher.update(b"world");
            assert_eq!(hasher.finalize(), Checksum::of(algorithm, b"hello world"));
        }
    }

    #[test]
    fn debug_is_hex() {
        let checksum = Checksum::of(HashAlgorithm::Sha1, b"abc");
        assert_eq!(
            format!("{checksum:?}"),
            "Checksum(SHA1:a9993e364706816aba3e25717850c26c9cd0d89d)"
        );
        assert_eq!(Checksum::of(HashAlgorithm::Blake3, b"abc").digest.len(), 32);
    }
}
