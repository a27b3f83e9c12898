//! The on-disk cache store: whole-file mirror of server paths under the
//! cache root, with atomic replacement for fetched content.

use std::io::SeekFrom;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::common::error::{SessionFsError, SessionFsResult};
use crate::common::util::fold_timestamp;

/// Owns the cache directory and performs the whole-file disk
/// operations of the cache manager.
#[derive(Debug)]
pub struct CacheStore {
    /// The cache root directory.
    root: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache location mirroring a server-absolute path.
    #[must_use]
    pub fn cache_path(&self, server_path: &str) -> PathBuf {
        self.root.join(server_path.trim_start_matches('/'))
    }

    /// Create the parent directories of a cache path on demand.
    pub async fn create_dirs(&self, cache_path: &Path) -> SessionFsResult<()> {
        if let Some(parent) = cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// Create an empty cache file, truncating a stale leftover from an
    /// earlier eviction. Existence checks belong to the metadata maps,
    /// not the disk mirror.
    pub async fn create_empty(&self, cache_path: &Path) -> SessionFsResult<()> {
        self.create_dirs(cache_path).await?;
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(cache_path)
            .await?;
        Ok(())
    }

    /// Read up to `len` bytes at `offset`; short at end of file.
    pub async fn read_bytes(
        &self,
        cache_path: &Path,
        offset: u64,
        len: usize,
    ) -> SessionFsResult<Vec<u8>> {
        let mut file = File::open(cache_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0_u8; len];
        let mut filled = 0;
        while filled < len {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write `data` at `offset`, extending the file when the offset is
    /// past the current end. Hole semantics are the host's.
    pub async fn write_bytes(
        &self,
        cache_path: &Path,
        offset: u64,
        data: &[u8],
    ) -> SessionFsResult<()> {
        let mut file = OpenOptions::new().write(true).open(cache_path).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    /// Resize the cache file.
    pub async fn truncate(&self, cache_path: &Path, size: u64) -> SessionFsResult<()> {
        let file = OpenOptions::new().write(true).open(cache_path).await?;
        file.set_len(size).await?;
        Ok(())
    }

    /// The current on-disk size of a cache file.
    pub async fn size(&self, cache_path: &Path) -> SessionFsResult<u64> {
        let meta = tokio::fs::metadata(cache_path).await?;
        Ok(meta.len())
    }

    /// The modification time of a cache file, nanoseconds since epoch.
    pub async fn mtime(&self, cache_path: &Path) -> SessionFsResult<i64> {
        let meta = tokio::fs::metadata(cache_path).await?;
        Ok(fold_timestamp(meta.mtime(), meta.mtime_nsec()))
    }

    /// Remove a cache file if present.
    pub async fn remove(&self, cache_path: &Path) -> SessionFsResult<()> {
        match tokio::fs::remove_file(cache_path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Move a cache file to its new location, creating parents.
    pub async fn rename(&self, old_path: &Path, new_path: &Path) -> SessionFsResult<()> {
        self.create_dirs(new_path).await?;
        tokio::fs::rename(old_path, new_path).await?;
        Ok(())
    }

    /// Start an atomic whole-file replacement of `cache_path`.
    ///
    /// Streamed chunks land in a temporary file next to the target;
    /// `commit` renames it into place, `abort` discards it. A reader
    /// holding an old handle keeps its old view either way.
    pub async fn begin_replace(&self, cache_path: &Path) -> SessionFsResult<AtomicWriter> {
        self.create_dirs(cache_path).await?;
        let name = cache_path
            .file_name()
            .map_or_else(|| "fetch".to_owned(), |n| n.to_string_lossy().into_owned());
        let tmp_path = cache_path.with_file_name(format!(".{name}.{}.tmp", Uuid::new_v4()));
        let file = File::create(&tmp_path).await?;
        Ok(AtomicWriter {
            target: cache_path.to_path_buf(),
            tmp_path,
            file,
        })
    }
}

/// In-flight atomic replacement of one cache file.
#[derive(Debug)]
pub struct AtomicWriter {
    /// The file being replaced.
    target: PathBuf,
    /// The temporary file receiving the new content.
    tmp_path: PathBuf,
    /// The open temporary file.
    file: File,
}

impl AtomicWriter {
    /// Append a chunk of the new content.
    pub async fn write_chunk(&mut self, data: &[u8]) -> SessionFsResult<()> {
        self.file.write_all(data).await.map_err(SessionFsError::from)
    }

    /// Publish the new content over the target.
    pub async fn commit(mut self) -> SessionFsResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        tokio::fs::rename(&self.tmp_path, &self.target).await?;
        Ok(())
    }

    /// Discard the new content, leaving the target untouched.
    pub async fn abort(self) {
        if let Err(err) = tokio::fs::remove_file(&self.tmp_path).await {
            debug!("Failed to remove abandoned fetch file: {err}");
        }
    }
}
