//! Archive writer for export packages.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/.staging/<jobId>/<attemptId>.tar.gz   written by bundle-archive
//! <root>/<jobId>/<slug>-export.tar.gz          promoted by persist-record
//! ```
//!
//! Staging and final paths share a filesystem, so promotion is a rename.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::ExportError;

const STAGING_DIR: &str = ".staging";
const ARCHIVE_FILE_MODE: u32 = 0o644;

/// Everything written into one archive.
#[derive(Debug, Clone)]
pub struct ArchiveContents {
    pub manifest: serde_json::Value,
    pub config: serde_json::Value,
    /// Only present for workflows.
    pub dependencies: Option<serde_json::Value>,
    pub assets: Vec<ArchiveAsset>,
}

/// A file copied into `assets/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveAsset {
    pub name: String,
    pub source_path: PathBuf,
    pub size_bytes: u64,
}

/// A written archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuiltPackage {
    pub path: PathBuf,
    pub size_bytes: u64,
}

/// Carried inside an `io::Error` when the size limit is crossed.
#[derive(Debug)]
struct QuotaExceeded {
    limit_bytes: u64,
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "package exceeds {} bytes", self.limit_bytes)
    }
}

impl std::error::Error for QuotaExceeded {}

/// Counts bytes and refuses to write past `limit_bytes`.
struct QuotaWriter<W> {
    inner: W,
    written: u64,
    limit_bytes: u64,
}

impl<W: Write> Write for QuotaWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > self.limit_bytes {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                QuotaExceeded {
                    limit_bytes: self.limit_bytes,
                },
            ));
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Writes, promotes and removes package files under one storage root.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    root: PathBuf,
    max_package_bytes: u64,
}

impl PackageBuilder {
    pub fn new(root: impl Into<PathBuf>, max_package_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_package_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_package_bytes(&self) -> u64 {
        self.max_package_bytes
    }

    pub fn staging_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(STAGING_DIR).join(job_id.to_string())
    }

    /// Attempt-scoped path, so a re-run never overwrites an earlier attempt.
    pub fn staging_path(&self, job_id: Uuid, attempt_id: Uuid) -> PathBuf {
        self.staging_dir(job_id).join(format!("{}.tar.gz", attempt_id))
    }

    pub fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    pub fn final_path(&self, job_id: Uuid, slug: &str) -> PathBuf {
        self.job_dir(job_id).join(format!("{}-export.tar.gz", slug))
    }

    /// Write `contents` as a gzip'd tarball at `staging_path`.
    ///
    /// Any failure removes the partial file before returning.
    pub async fn build(
        &self,
        contents: ArchiveContents,
        staging_path: PathBuf,
    ) -> Result<BuiltPackage, ExportError> {
        let limit_bytes = self.max_package_bytes;
        let path = staging_path.clone();

        let result = tokio::task::spawn_blocking(move || {
            let written = write_archive(&contents, &path, limit_bytes);
            if written.is_err() {
                if let Err(e) = remove_file_if_exists(&path) {
                    warn!(path = %path.display(), error = %e, "Failed to remove partial archive");
                }
            }
            written
        })
        .await
        .map_err(|e| ExportError::TransientIo(format!("archive task failed: {}", e)))?;

        match result {
            Ok(size_bytes) => {
                debug!(path = %staging_path.display(), size_bytes, "Archive written");
                Ok(BuiltPackage {
                    path: staging_path,
                    size_bytes,
                })
            }
            Err(e) => Err(map_write_error(e)),
        }
    }

    /// Rename a staged archive to its final location.
    pub async fn promote(&self, staged: &Path, final_path: &Path) -> Result<(), ExportError> {
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(staged, final_path).await?;
        Ok(())
    }

    /// Delete a file; a file that is already gone is not an error.
    pub async fn remove_file(&self, path: &Path) -> Result<bool, ExportError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove `dir` if it exists and is empty. Never removes the root.
    pub async fn remove_dir_if_empty(&self, dir: &Path) -> Result<(), ExportError> {
        if dir == self.root {
            return Ok(());
        }

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if entries.next_entry().await?.is_some() {
            return Ok(());
        }

        match tokio::fs::remove_dir(dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove every file this root holds for `job_id`.
    pub async fn purge_job_files(&self, job_id: Uuid) -> Result<(), ExportError> {
        for dir in [self.job_dir(job_id), self.staging_dir(job_id)] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Quota errors may arrive wrapped by the tar layer; walk the source chain.
fn map_write_error(err: io::Error) -> ExportError {
    let mut source = err
        .get_ref()
        .map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(current) = source {
        if let Some(quota) = current.downcast_ref::<QuotaExceeded>() {
            return ExportError::StorageQuotaExceeded {
                limit_bytes: quota.limit_bytes,
            };
        }
        source = match current.downcast_ref::<io::Error>() {
            Some(io_err) => io_err
                .get_ref()
                .map(|inner| inner as &(dyn std::error::Error + 'static)),
            None => current.source(),
        };
    }
    ExportError::TransientIo(err.to_string())
}

fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn entry_header(size: u64) -> tar::Header {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(size);
    header.set_mode(ARCHIVE_FILE_MODE);
    header.set_mtime(0);
    header
}

fn append_json<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    value: &serde_json::Value,
) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(io::Error::from)?;
    let mut header = entry_header(bytes.len() as u64);
    builder.append_data(&mut header, name, bytes.as_slice())
}

/// Write the archive and return its compressed size.
fn write_archive(contents: &ArchiveContents, path: &Path, limit_bytes: u64) -> io::Result<u64> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = File::create(path)?;
    let writer = QuotaWriter {
        inner: file,
        written: 0,
        limit_bytes,
    };
    let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));

    append_json(&mut builder, "manifest.json", &contents.manifest)?;
    append_json(&mut builder, "config.json", &contents.config)?;
    if let Some(dependencies) = &contents.dependencies {
        append_json(&mut builder, "dependencies.json", dependencies)?;
    }

    for asset in &contents.assets {
        let source = File::open(&asset.source_path)?;
        let size = source.metadata()?.len();
        let mut header = entry_header(size);
        builder.append_data(&mut header, format!("assets/{}", asset.name), source)?;
    }

    let writer = builder.into_inner()?.finish()?;
    let written = writer.written;
    writer.inner.sync_all()?;
    Ok(written)
}
