//! SHA-256 helpers. File hashing runs on the blocking pool.

use std::io::Read;
use std::path::{Path, PathBuf};

use capsule_shared::{CapsuleError, CapsuleResult};
use sha2::{Digest, Sha256};

use crate::runtime::constants::snapshots::CHECKSUM_CHUNK_BYTES;

/// Lowercase hex SHA-256 of an in-memory buffer.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Lowercase hex SHA-256 of a file, streamed in fixed-size chunks.
pub async fn sha256_file(path: &Path) -> CapsuleResult<String> {
    let path: PathBuf = path.to_path_buf();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path))
        .await
        .map_err(|e| CapsuleError::Internal(format!("checksum task failed: {}", e)))?
}

fn hash_file_blocking(path: &Path) -> CapsuleResult<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; CHECKSUM_CHUNK_BYTES];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Case-insensitive comparison of two hex digests.
pub fn digests_match(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
