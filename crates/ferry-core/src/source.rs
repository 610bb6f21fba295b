//! Read-only file sources shared by every recipient of a transfer.
//!
//! A [`FileSource`] is cheap to clone. Each read opens its own view of the
//! data, so concurrent sessions can read different ranges independently.

use crate::error::{FerryError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::OnceCell;

/// Buffer size used when hashing a disk file
const HASH_READ_SIZE: usize = 1024 * 1024;

enum Backing {
    Memory(Arc<[u8]>),
    Disk(PathBuf),
}

struct Inner {
    name: String,
    len: u64,
    backing: Backing,
    digest: OnceCell<[u8; 32]>,
}

/// A file to send
#[derive(Clone)]
pub struct FileSource {
    inner: Arc<Inner>,
}

impl FileSource {
    /// In-memory file.
    pub fn from_bytes(name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) -> Self {
        let bytes = bytes.into();
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                len: bytes.len() as u64,
                backing: Backing::Memory(bytes),
                digest: OnceCell::new(),
            }),
        }
    }

    /// File on disk. The name sent to recipients is the path's final component.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Io`] if the path cannot be inspected and
    /// [`FerryError::Validation`] if it is not a regular file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        if !metadata.is_file() {
            return Err(FerryError::validation(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            inner: Arc::new(Inner {
                name,
                len: metadata.len(),
                backing: Backing::Disk(path.to_path_buf()),
                digest: OnceCell::new(),
            }),
        })
    }

    /// Name announced to recipients.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Size in bytes.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.inner.len
    }

    /// Whether the file is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Reject files that cannot be sent.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Validation`] for an empty file.
    pub fn validate(&self) -> Result<()> {
        if self.is_empty() {
            return Err(FerryError::validation(format!(
                "{} is empty",
                self.inner.name
            )));
        }
        Ok(())
    }

    /// Read up to `len` bytes starting at `offset`.
    ///
    /// Returns fewer bytes only at end of file.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Io`] if the backing file cannot be read.
    pub async fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset >= self.inner.len {
            return Ok(Vec::new());
        }
        let available = (self.inner.len - offset).min(len as u64) as usize;
        match &self.inner.backing {
            Backing::Memory(bytes) => {
                let start = offset as usize;
                Ok(bytes[start..start + available].to_vec())
            }
            Backing::Disk(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; available];
                file.read_exact(&mut buf).await?;
                Ok(buf)
            }
        }
    }

    /// BLAKE3 hash of the whole file, computed once and cached.
    ///
    /// # Errors
    ///
    /// Returns [`FerryError::Io`] if the file cannot be read in full.
    pub async fn digest(&self) -> Result<[u8; 32]> {
        self.inner
            .digest
            .get_or_try_init(|| self.compute_digest())
            .await
            .copied()
    }

    async fn compute_digest(&self) -> Result<[u8; 32]> {
        let mut hasher = blake3::Hasher::new();
        match &self.inner.backing {
            Backing::Memory(bytes) => {
                hasher.update(bytes);
            }
            Backing::Disk(path) => {
                let mut file = tokio::fs::File::open(path).await?;
                let mut buf = vec![0u8; HASH_READ_SIZE];
                let mut total = 0u64;
                loop {
                    let n = file.read(&mut buf).await?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                    total += n as u64;
                }
                if total != self.inner.len {
                    return Err(FerryError::Io(format!(
                        "{} changed size while hashing ({} != {})",
                        path.display(),
                        total,
                        self.inner.len
                    )));
                }
            }
        }
        Ok(*hasher.finalize().as_bytes())
    }
}

impl std::fmt::Debug for FileSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSource")
            .field("name", &self.inner.name)
            .field("len", &self.inner.len)
            .finish_non_exhaustive()
    }
}
