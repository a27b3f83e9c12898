//! In-memory client state: cache metadata, attribute snapshots and the
//! open-file table, all behind one coarse mutex.

use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::rpc::message::AttrResponse;

/// Local cache metadata for one cached file.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// True iff the local copy has diverged from the server's copy
    /// since the last successful flush or fetch.
    pub locally_modified: bool,
    /// The server timestamp of the last version synchronized with,
    /// nanoseconds since the epoch.
    pub server_timestamp: i64,
    /// The file's leaf name.
    pub base_name: String,
}

/// The attribute snapshot served to local `getattr`.
///
/// `uid` and `gid` are rewritten to the invoking user so the host OS
/// permits access regardless of the server-side ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileAttributes {
    /// Size in bytes.
    pub size: i64,
    /// File type and permission bits.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u64,
    /// The spoofed local user id.
    pub uid: u32,
    /// The spoofed local group id.
    pub gid: u32,
    /// Time of last access, nanoseconds.
    pub atime: i64,
    /// Time of last modification, nanoseconds.
    pub mtime: i64,
    /// Time of last status change, nanoseconds.
    pub ctime: i64,
}

impl FileAttributes {
    /// Build the local snapshot from a server attribute response,
    /// spoofing ownership to the invoking user.
    #[must_use]
    pub fn from_server(attr: &AttrResponse) -> Self {
        Self {
            size: attr.size,
            mode: attr.mode,
            nlink: attr.nlink,
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
        }
    }
}

/// The pair of independently-positioned handles backing one open file.
///
/// Reads and writes against the same cache file keep separate cursors,
/// so a read-while-write within a session never disturbs the other
/// side's position.
#[derive(Debug)]
pub struct OpenFile {
    /// The read handle with its own cursor.
    read: Mutex<File>,
    /// The write handle with its own cursor.
    write: Mutex<File>,
}

/// Shared reference to an open file, cloned out of the table so that
/// disk I/O runs without the coarse state mutex.
pub type OpenFileRef = Arc<OpenFile>;

impl OpenFile {
    /// Open the handle pair against an existing cache file.
    pub async fn open_pair(cache_path: &Path) -> std::io::Result<Self> {
        let read = File::open(cache_path).await?;
        let write = OpenOptions::new().write(true).open(cache_path).await?;
        Ok(Self {
            read: Mutex::new(read),
            write: Mutex::new(write),
        })
    }

    /// Read up to `size` bytes at `offset`; short at end of file.
    pub async fn read_at(&self, offset: u64, size: usize) -> std::io::Result<Vec<u8>> {
        let mut file = self.read.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0_u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Write `data` at `offset` and push it through to the OS, so that
    /// the on-disk size is observable as soon as this returns.
    pub async fn write_at(&self, offset: u64, data: &[u8]) -> std::io::Result<()> {
        let mut file = self.write.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await
    }

    /// Flush and sync the write side before a close-flush reads the
    /// file back from disk.
    pub async fn flush_and_sync(&self) -> std::io::Result<()> {
        let mut file = self.write.lock().await;
        file.flush().await?;
        file.sync_all().await
    }
}

/// The three client maps, guarded together by one coarse mutex. Lock
/// holders only consult or mutate the maps; disk and network I/O
/// happens with the lock released.
#[derive(Debug, Default)]
pub struct ClientState {
    /// server-absolute path to cache entry.
    pub metadata: HashMap<String, CacheEntry>,
    /// server-absolute path to open handle pair. An entry here implies
    /// an entry in `metadata`.
    pub open_files: HashMap<String, OpenFileRef>,
    /// server-absolute path to attribute snapshot.
    pub attrs: HashMap<String, FileAttributes>,
}

/// Move every entry keyed by `old` itself, or by a path under `old`,
/// to the corresponding key under `new`. Other entries are untouched.
pub fn rekey_prefix<V>(map: &mut HashMap<String, V>, old: &str, new: &str) {
    let prefix = format!("{old}/");
    let keys: Vec<String> = map
        .keys()
        .filter(|k| *k == old || k.starts_with(&prefix))
        .cloned()
        .collect();
    for key in keys {
        if let Some(value) = map.remove(&key) {
            let suffix = &key[old.len()..];
            map.insert(format!("{new}{suffix}"), value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rekey_exact_and_children() {
        let mut map = HashMap::new();
        map.insert("/d/a".to_owned(), 1);
        map.insert("/d/a/x".to_owned(), 2);
        map.insert("/d/ab".to_owned(), 3);
        map.insert("/other".to_owned(), 4);

        rekey_prefix(&mut map, "/d/a", "/d/b");

        assert_eq!(map.get("/d/b"), Some(&1));
        assert_eq!(map.get("/d/b/x"), Some(&2));
        // "/d/ab" only shares a string prefix, not a path prefix.
        assert_eq!(map.get("/d/ab"), Some(&3));
        assert_eq!(map.get("/other"), Some(&4));
        assert!(!map.contains_key("/d/a"));
        assert!(!map.contains_key("/d/a/x"));
    }

    #[tokio::test]
    async fn test_open_file_independent_cursors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"0123456789").await.expect("seed");

        let open_file = OpenFile::open_pair(&path).await.expect("open pair");
        // Interleave a write with reads; each side keeps its own cursor.
        let head = open_file.read_at(0, 4).await.expect("read");
        assert_eq!(head, b"0123");
        open_file.write_at(4, b"WXYZ").await.expect("write");
        let tail = open_file.read_at(4, 6).await.expect("read");
        assert_eq!(tail, b"WXYZ89");
    }

    #[tokio::test]
    async fn test_read_at_past_eof_is_short() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"abc").await.expect("seed");

        let open_file = OpenFile::open_pair(&path).await.expect("open pair");
        assert_eq!(open_file.read_at(1, 100).await.expect("read"), b"bc");
        assert!(open_file.read_at(10, 4).await.expect("read").is_empty());
    }

    #[tokio::test]
    async fn test_write_at_beyond_end_extends() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("f.bin");
        tokio::fs::write(&path, b"ab").await.expect("seed");

        let open_file = OpenFile::open_pair(&path).await.expect("open pair");
        open_file.write_at(4, b"zz").await.expect("write");
        let meta = tokio::fs::metadata(&path).await.expect("meta");
        assert_eq!(meta.len(), 6);
    }
}
