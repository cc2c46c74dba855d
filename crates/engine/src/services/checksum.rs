//! SHA-256 digests over package archives.

use shared::crypto::{sha256_hex_file, SHA256_ALGORITHM};
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::ExportError;

/// Digest of an archive as it sits on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDigest {
    pub checksum: String,
    pub algorithm: &'static str,
    pub size_bytes: u64,
}

/// Outcome of re-hashing a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Intact,
    Mismatch { actual: String },
    Missing,
}

/// Hash `path` on the blocking pool.
pub async fn compute(path: &Path) -> Result<PackageDigest, ExportError> {
    let path = path.to_path_buf();
    let (checksum, size_bytes) = tokio::task::spawn_blocking(move || sha256_hex_file(&path))
        .await
        .map_err(|e| ExportError::TransientIo(format!("checksum task failed: {}", e)))??;

    Ok(PackageDigest {
        checksum,
        algorithm: SHA256_ALGORITHM,
        size_bytes,
    })
}

/// Recompute the digest of `path` and compare with `expected`.
pub async fn verify(path: &Path, expected: &str) -> Result<Verification, ExportError> {
    let owned: PathBuf = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || sha256_hex_file(&owned))
        .await
        .map_err(|e| ExportError::TransientIo(format!("checksum task failed: {}", e)))?;

    match result {
        Ok((actual, _)) if actual.eq_ignore_ascii_case(expected) => Ok(Verification::Intact),
        Ok((actual, _)) => Ok(Verification::Mismatch { actual }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Verification::Missing),
        Err(e) => Err(e.into()),
    }
}

/// Turn a failed verification into the error delivered to callers.
pub fn corruption_error(job_id: Uuid, verification: &Verification) -> Option<ExportError> {
    let detail = match verification {
        Verification::Intact => return None,
        Verification::Mismatch { actual } => format!("checksum mismatch (found {})", actual),
        Verification::Missing => "package file is missing".to_string(),
    };
    Some(ExportError::CorruptedArtifact { job_id, detail })
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::crypto::is_sha256_hex;
    use std::io::Write;

    fn write_temp(contents: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        file
    }

    #[tokio::test]
    async fn test_compute_is_deterministic() {
        let file = write_temp(b"package bytes");
        let first = compute(file.path()).await.unwrap();
        let second = compute(file.path()).await.unwrap();

        assert_eq!(first, second);
        assert!(is_sha256_hex(&first.checksum));
        assert_eq!(first.algorithm, "sha256");
        assert_eq!(first.size_bytes, 13);
    }

    #[tokio::test]
    async fn test_verify_intact_and_mismatch() {
        let file = write_temp(b"original");
        let digest = compute(file.path()).await.unwrap();
        assert_eq!(
            verify(file.path(), &digest.checksum).await.unwrap(),
            Verification::Intact
        );

        std::fs::write(file.path(), b"tampered").unwrap();
        let outcome = verify(file.path(), &digest.checksum).await.unwrap();
        assert!(matches!(outcome, Verification::Mismatch { .. }));
        assert!(corruption_error(Uuid::new_v4(), &outcome).is_some());
    }

    #[tokio::test]
    async fn test_verify_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = verify(&dir.path().join("gone.tar.gz"), "abc").await.unwrap();
        assert_eq!(outcome, Verification::Missing);
        assert!(matches!(
            corruption_error(Uuid::new_v4(), &outcome),
            Some(ExportError::CorruptedArtifact { .. })
        ));
    }
}
