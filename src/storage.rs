//! Storage of delivery evidence photos on the local filesystem

use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use log::{trace, warn};
use tokio::{fs, io::AsyncWriteExt};

/// The fixed prefix stored evidence is served from
pub const UPLOAD_URL_PREFIX: &str = "/uploads";

/// A photo written to the evidence directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvidence {
    /// Location on disk
    pub path: PathBuf,
    /// Path clients use to fetch the photo back
    pub url: String,
}

/// Writes evidence photos into a single directory
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    dir: PathBuf,
}

impl EvidenceStore {
    /// Create a store rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory evidence is written to
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ensure the evidence directory exists
    pub async fn init(&self) -> io::Result<()> {
        fs::create_dir_all(&self.dir).await
    }

    /// Derive the file name for a package's evidence, from the package id, the
    /// time of delivery (to the second) and the extension of the uploaded file.
    ///
    /// Every byte of the package id other than ascii alphanumerics and `-` is
    /// written as `_` followed by two hex digits. Distinct ids therefore always
    /// get distinct names, and no name can point outside the evidence directory.
    /// Extensions that are not plain ascii alphanumerics are dropped.
    pub fn file_name(package_id: &str, original_name: &str, at: DateTime<Utc>) -> String {
        let mut escaped = String::with_capacity(package_id.len());
        for b in package_id.bytes() {
            match b {
                b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' => escaped.push(b as char),
                _ => escaped.push_str(&format!("_{:02X}", b)),
            }
        }
        let extension = Path::new(original_name)
            .extension()
            .and_then(|e| e.to_str())
            .filter(|e| e.bytes().all(|b| b.is_ascii_alphanumeric()))
            .map(|e| format!(".{}", e))
            .unwrap_or_default();

        format!(
            "{}_evidence_{}{}",
            escaped,
            at.format("%Y%m%d%H%M%S"),
            extension
        )
    }

    /// Write `contents` as the evidence for `package_id`, flushing it to disk.
    /// Existing evidence is never overwritten: if the name is already taken an
    /// [`io::ErrorKind::AlreadyExists`] error is returned. A partially written
    /// file is removed before the error is returned.
    pub async fn save(
        &self,
        package_id: &str,
        original_name: &str,
        at: DateTime<Utc>,
        contents: &[u8],
    ) -> io::Result<StoredEvidence> {
        let name = Self::file_name(package_id, original_name, at);
        let path = self.dir.join(&name);
        trace!("writing {} bytes of evidence to {:?}", contents.len(), path);

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await?;
        if let Err(e) = write_synced(&mut file, contents).await {
            drop(file);
            if let Err(remove_err) = fs::remove_file(&path).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!("failed to remove partial evidence {:?}: {}", path, remove_err);
                }
            }
            return Err(e);
        }

        Ok(StoredEvidence {
            path,
            url: format!("{}/{}", UPLOAD_URL_PREFIX, name),
        })
    }

    /// Best-effort removal of evidence whose delivery could not be recorded
    pub async fn discard(&self, evidence: &StoredEvidence) {
        match fs::remove_file(&evidence.path).await {
            Ok(()) => trace!("discarded evidence {:?}", evidence.path),
            Err(e) => warn!("failed to discard evidence {:?}: {}", evidence.path, e),
        }
    }
}

async fn write_synced(file: &mut fs::File, contents: &[u8]) -> io::Result<()> {
    file.write_all(contents).await?;
    file.sync_all().await
}
