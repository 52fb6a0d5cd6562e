//! Content hashing in the store's addressing scheme (`sha256:<hex>`).

use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::resolver::version::SHA256_PREFIX;

/// Incremental hasher producing `sha256:<hex>` identifiers.
#[derive(Default)]
pub struct ContentHasher(Sha256);

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.0.update(bytes);
    }

    pub fn finalize(self) -> String {
        format!("{SHA256_PREFIX}{}", hex::encode(self.0.finalize()))
    }
}

/// Hash a byte slice.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = ContentHasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Whether `hash` can be recomputed locally.
pub fn is_verifiable(hash: &str) -> bool {
    hash.strip_prefix(SHA256_PREFIX)
        .map(|hex_part| hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false)
}

/// Stream a file through the hasher.
pub async fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hasher.finalize())
}

/// True if `path` exists, is non-empty and hashes to `hash`.
pub async fn verify(hash: &str, path: &Path) -> bool {
    if !is_verifiable(hash) {
        return false;
    }
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() && meta.len() > 0 => {}
        _ => return false,
    }
    match hash_file(path).await {
        Ok(actual) => actual.eq_ignore_ascii_case(hash),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_known_digest() {
        assert_eq!(
            content_hash(b"hello"),
            "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_is_verifiable() {
        assert!(is_verifiable(&content_hash(b"x")));
        assert!(!is_verifiable("/ipfs/QmSomething"));
        assert!(!is_verifiable("sha256:short"));
    }

    #[tokio::test]
    async fn test_verify_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("blob");
        std::fs::write(&path, b"payload").unwrap();

        assert!(verify(&content_hash(b"payload"), &path).await);
        assert!(!verify(&content_hash(b"other"), &path).await);
        assert!(!verify(&content_hash(b"payload"), &temp.path().join("missing")).await);
    }

    #[tokio::test]
    async fn test_verify_rejects_empty_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("empty");
        std::fs::write(&path, b"").unwrap();

        assert!(!verify(&content_hash(b""), &path).await);
    }
}
