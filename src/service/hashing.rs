//! Content hashing of staged uploads

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read, Seek};

/// Hex-encoded SHA-256 digest of a file's full content
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ContentHash(String);

impl ContentHash {
    /// Accept a 64 character hex digest, normalised to lowercase.
    pub fn parse(hex_digest: &str) -> Option<Self> {
        if hex_digest.len() == 64 && hex_digest.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(hex_digest.to_ascii_lowercase()))
        } else {
            None
        }
    }

    pub fn of_bytes(data: &[u8]) -> Self {
        Self(hex::encode(Sha256::digest(data)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hash the whole of `source` and hand it back rewound to position zero,
/// so the same bytes can be written to storage afterwards.
///
/// The source is read through a bounded buffer; it is never held in memory.
pub fn hash_stream<R: Read + Seek>(mut source: R) -> io::Result<(ContentHash, R)> {
    source.rewind()?;
    let mut hasher = Sha256::new();
    io::copy(&mut source, &mut hasher)?;
    source.rewind()?;
    Ok((ContentHash(hex::encode(hasher.finalize())), source))
}
