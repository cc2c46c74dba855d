//! Digest utilities for artifact integrity checks.

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Name recorded next to every digest produced by this module.
pub const SHA256_ALGORITHM: &str = "sha256";

/// Length of a hex-encoded SHA-256 digest.
pub const SHA256_HEX_LEN: usize = 64;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Computes SHA-256 hash of the input and returns it as a hex string.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Computes SHA-256 over everything readable from `reader`.
///
/// Returns the lowercase hex digest and the number of bytes consumed.
pub fn sha256_hex_reader<R: Read>(reader: &mut R) -> io::Result<(String, u64)> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let read = reader.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }

    Ok((hex::encode(hasher.finalize()), total))
}

/// Computes SHA-256 over a file on disk.
pub fn sha256_hex_file(path: impl AsRef<Path>) -> io::Result<(String, u64)> {
    let mut file = File::open(path)?;
    sha256_hex_reader(&mut file)
}

/// Returns true when `value` looks like a lowercase hex SHA-256 digest.
pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LEN
        && value
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_sha256_hex() {
        let hash = sha256_hex("test");
        assert_eq!(hash.len(), 64);
        assert_eq!(
            hash,
            "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08"
        );
    }

    #[test]
    fn test_sha256_hex_empty_string() {
        let hash = sha256_hex("");
        assert_eq!(
            hash,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_reader_matches_string_digest() {
        let mut cursor = Cursor::new(b"hello world".to_vec());
        let (digest, bytes) = sha256_hex_reader(&mut cursor).unwrap();
        assert_eq!(bytes, 11);
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(digest, sha256_hex("hello world"));
    }

    #[test]
    fn test_reader_spans_multiple_buffers() {
        let data = "x".repeat(READ_BUFFER_SIZE * 3 + 17);
        let mut cursor = Cursor::new(data.clone().into_bytes());
        let (digest, bytes) = sha256_hex_reader(&mut cursor).unwrap();
        assert_eq!(bytes as usize, data.len());
        assert_eq!(digest, sha256_hex(&data));
    }

    #[test]
    fn test_file_digest_is_deterministic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"archive bytes").unwrap();

        let first = sha256_hex_file(file.path()).unwrap();
        let second = sha256_hex_file(file.path()).unwrap();
        assert_eq!(first, second);
        assert!(is_sha256_hex(&first.0));
    }

    #[test]
    fn test_file_digest_missing_file() {
        let err = sha256_hex_file("/definitely/not/here.tar.gz").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_is_sha256_hex() {
        assert!(is_sha256_hex(&sha256_hex("abc")));
        assert!(!is_sha256_hex("ABC"));
        assert!(!is_sha256_hex(&sha256_hex("abc").to_uppercase()));
        assert!(!is_sha256_hex(&"g".repeat(64)));
    }
}
