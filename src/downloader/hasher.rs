use std::fmt;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Blake3,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HashAlgorithm::Sha256 => write!(f, "SHA256"),
            HashAlgorithm::Blake3 => write!(f, "BLAKE3"),
        }
    }
}

/// Incremental hasher owned by exactly one execution.
pub enum IncrementalHasher {
    Sha256(Sha256),
    Blake3(Box<blake3::Hasher>),
}

impl IncrementalHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Sha256 => IncrementalHasher::Sha256(Sha256::new()),
            HashAlgorithm::Blake3 => IncrementalHasher::Blake3(Box::new(blake3::Hasher::new())),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            IncrementalHasher::Sha256(h) => h.update(data),
            IncrementalHasher::Blake3(h) => {
                h.update(data);
            }
        }
    }

    /// Lowercase hex digest of everything absorbed so far.
    pub fn finalize_hex(self) -> String {
        match self {
            IncrementalHasher::Sha256(h) => hex::encode(h.finalize()),
            IncrementalHasher::Blake3(h) => h.finalize().to_hex().to_string(),
        }
    }

    /// Feed the current contents of `path` into the hasher. Used when resuming
    /// so the final digest covers the bytes written by earlier attempts.
    pub async fn absorb_file(&mut self, path: &Path) -> io::Result<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.update(&buf[..n]);
            total += n as u64;
        }
        Ok(total)
    }
}

pub fn digests_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}
