//! The client-side cache manager: whole-file fetch on open, local I/O
//! against the cache, whole-file flush on close, and the background
//! subscriber applying server-driven evictions.

use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::error::{Context, SessionFsError, SessionFsResult};
use crate::common::util::{fold_timestamp, now_nanos};
use crate::rpc::message::{EntryType, StatusResponse};

/// In-memory client state
pub mod meta;
/// Path translation
pub mod path;
/// The on-disk cache store
pub mod store;
/// The RPC client stub
pub mod stub;
/// The notification subscriber task
pub mod subscriber;

pub use self::meta::{CacheEntry, ClientState, FileAttributes, OpenFile, OpenFileRef};
pub use self::path::PathResolver;
pub use self::store::{AtomicWriter, CacheStore};
pub use self::stub::{CompareOutcome, RpcStub, MAX_ATTEMPTS};

use self::meta::rekey_prefix;

/// What an `open_file` call has to do, decided under the state mutex
/// and executed after it is released.
#[derive(Debug, Clone, Copy)]
enum OpenPlan {
    /// Not cached yet; fetch the whole file.
    Fetch,
    /// Already open by this client; a successful no-op.
    Noop,
    /// Cached but closed; validate against the server.
    Compare(i64),
}

/// The client core serving one mounted tree.
///
/// All maps live behind one coarse mutex; the lock is held only while
/// consulting or mutating them, never across disk or network I/O.
#[derive(Debug)]
pub struct FsClient {
    /// This client's opaque identifier, minted once at construction.
    client_id: String,
    /// Path translation against the negotiated server root.
    resolver: PathResolver,
    /// The on-disk cache.
    store: Arc<CacheStore>,
    /// The coarse-locked metadata, open-file and attribute maps.
    state: Arc<Mutex<ClientState>>,
    /// The RPC stub.
    stub: Arc<RpcStub>,
    /// The background subscriber task.
    subscriber: Option<JoinHandle<()>>,
    /// Cancels the subscriber.
    cancel: CancellationToken,
}

impl FsClient {
    /// Connect to the server, negotiate the served root and start the
    /// notification subscriber.
    pub async fn new(
        server_addr: &str,
        cache_root: impl Into<PathBuf>,
    ) -> SessionFsResult<Self> {
        let client_id = Uuid::new_v4().to_string();
        let stub = Arc::new(RpcStub::new(server_addr, client_id.clone()));
        let server_root = stub.request_root().await?;
        info!("Client {client_id} initialized, server root is {server_root}");

        let resolver = PathResolver::new(server_root, cache_root);
        let store = Arc::new(CacheStore::new(resolver.cache_root().to_path_buf()));
        let state = Arc::new(Mutex::new(ClientState::default()));
        let cancel = CancellationToken::new();
        let subscriber = subscriber::spawn(
            Arc::clone(&stub),
            Arc::clone(&state),
            Arc::clone(&store),
            cancel.clone(),
        );

        Ok(Self {
            client_id,
            resolver,
            store,
            state,
            stub,
            subscriber: Some(subscriber),
            cancel,
        })
    }

    /// This client's identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// The negotiated server root.
    #[must_use]
    pub fn server_root(&self) -> &str {
        self.resolver.server_root()
    }

    /// The resolver used by this client.
    #[must_use]
    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Whether a server-absolute path currently has a cache entry.
    #[must_use]
    pub fn is_cached(&self, server_path: &str) -> bool {
        self.state.lock().metadata.contains_key(server_path)
    }

    /// Whether a server-absolute path is currently open.
    #[must_use]
    pub fn is_open(&self, server_path: &str) -> bool {
        self.state.lock().open_files.contains_key(server_path)
    }

    /// The current attribute snapshot of a server-absolute path.
    #[must_use]
    pub fn attr_snapshot(&self, server_path: &str) -> Option<FileAttributes> {
        self.state.lock().attrs.get(server_path).copied()
    }

    /// Cancel the subscription stream and join the subscriber task.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.subscriber.take() {
            if let Err(err) = handle.await {
                debug!("Subscriber task ended abnormally: {err}");
            }
        }
    }

    /// Attributes of a file or directory, from the snapshot map when
    /// cached, otherwise from the server. Ownership is spoofed to the
    /// invoking user.
    pub async fn get_attributes(
        &self,
        name: &str,
        directory: &str,
    ) -> SessionFsResult<FileAttributes> {
        let server_path = self.resolver.resolve_join(directory, name);
        if let Some(attr) = self.state.lock().attrs.get(&server_path) {
            return Ok(*attr);
        }
        let resp = self.stub.getattr(&server_path).await?;
        let attr = FileAttributes::from_server(&resp);
        self.state.lock().attrs.insert(server_path, attr);
        Ok(attr)
    }

    /// List a directory on the server.
    pub async fn ls_contents(
        &self,
        directory: &str,
    ) -> SessionFsResult<std::collections::BTreeMap<String, EntryType>> {
        let server_path = self.resolver.resolve(directory);
        let resp = self.stub.ls(&server_path).await?;
        Ok(resp.entries)
    }

    /// Open a file: fetch it on first contact, validate the cached copy
    /// on re-open, succeed as a no-op when it is already open.
    pub async fn open_file(&self, name: &str, directory: &str) -> SessionFsResult<()> {
        let server_path = self.resolver.resolve_join(directory, name);
        let cache_path = self.store.cache_path(&server_path);

        let plan = {
            let state = self.state.lock();
            if !state.metadata.contains_key(&server_path) {
                OpenPlan::Fetch
            } else if state.open_files.contains_key(&server_path) {
                OpenPlan::Noop
            } else {
                let timestamp = state
                    .metadata
                    .get(&server_path)
                    .map_or(0, |entry| entry.server_timestamp);
                OpenPlan::Compare(timestamp)
            }
        };

        match plan {
            OpenPlan::Noop => {
                debug!("{server_path} is already open; open is idempotent");
                Ok(())
            }
            OpenPlan::Fetch => self.fetch_and_open(&server_path, &cache_path).await,
            OpenPlan::Compare(client_timestamp) => {
                match self
                    .stub
                    .compare(&server_path, client_timestamp, &self.store, &cache_path)
                    .await
                {
                    Ok(outcome) => {
                        if let CompareOutcome::Updated { .. } = outcome {
                            debug!("Cache for {server_path} was stale; replaced");
                        }
                        let handles = OpenFile::open_pair(&cache_path).await?;
                        let mut state = self.state.lock();
                        if let Some(entry) = state.metadata.get_mut(&server_path) {
                            entry.server_timestamp = outcome.timestamp();
                            entry.locally_modified = false;
                        }
                        state
                            .open_files
                            .insert(server_path.clone(), Arc::new(handles));
                        Ok(())
                    }
                    Err(compare_err) => {
                        // The entry can no longer be trusted; drop it and
                        // fall back to a fresh fetch.
                        warn!(
                            "Compare of {server_path} failed ({compare_err}); \
                             dropping the cache entry"
                        );
                        {
                            let mut state = self.state.lock();
                            state.metadata.remove(&server_path);
                            state.attrs.remove(&server_path);
                        }
                        self.fetch_and_open(&server_path, &cache_path)
                            .await
                            .map_err(|fetch_err| SessionFsError::Stale {
                                path: server_path.clone(),
                                context: vec![
                                    compare_err.to_string(),
                                    fetch_err.to_string(),
                                ],
                            })
                    }
                }
            }
        }
    }

    /// Fetch the whole file and install the cache entry and handle pair.
    async fn fetch_and_open(&self, server_path: &str, cache_path: &Path) -> SessionFsResult<()> {
        let timestamp = self
            .stub
            .fetch(server_path, &self.store, cache_path)
            .await?;
        let handles = OpenFile::open_pair(cache_path)
            .await
            .with_context(|| format!("opening the handle pair for {server_path}"))?;
        let base_name = server_path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_owned();

        let mut state = self.state.lock();
        state.metadata.insert(
            server_path.to_owned(),
            CacheEntry {
                locally_modified: false,
                server_timestamp: timestamp,
                base_name,
            },
        );
        state
            .open_files
            .insert(server_path.to_owned(), Arc::new(handles));
        Ok(())
    }

    /// Look up the open handle pair of a path, requiring both the cache
    /// entry and the open entry.
    fn open_handle(&self, server_path: &str) -> SessionFsResult<OpenFileRef> {
        let state = self.state.lock();
        if !state.metadata.contains_key(server_path) {
            return Err(SessionFsError::InvalidState {
                context: vec![format!(
                    "{server_path} is not in the cache; open it first"
                )],
            });
        }
        state
            .open_files
            .get(server_path)
            .cloned()
            .ok_or_else(|| SessionFsError::InvalidState {
                context: vec![format!(
                    "{server_path} is cached but not open; open it first"
                )],
            })
    }

    /// Read from the cached copy of an open file.
    pub async fn read_file(
        &self,
        name: &str,
        directory: &str,
        size: usize,
        offset: u64,
    ) -> SessionFsResult<Vec<u8>> {
        let server_path = self.resolver.resolve_join(directory, name);
        let handle = self.open_handle(&server_path)?;
        Ok(handle.read_at(offset, size).await?)
    }

    /// Write to the cached copy of an open file, marking it dirty and
    /// refreshing the attribute snapshot so its size always matches the
    /// cache file on disk.
    pub async fn write_file(
        &self,
        name: &str,
        directory: &str,
        data: &[u8],
        offset: u64,
    ) -> SessionFsResult<usize> {
        let server_path = self.resolver.resolve_join(directory, name);
        let cache_path = self.store.cache_path(&server_path);
        let handle = self.open_handle(&server_path)?;
        handle.write_at(offset, data).await?;

        let disk_size = i64::try_from(self.store.size(&cache_path).await?).unwrap_or(i64::MAX);
        let fallback = local_attr_snapshot(&cache_path).await?;
        let now = now_nanos();
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.metadata.get_mut(&server_path) {
                entry.locally_modified = true;
            }
            match state.attrs.get_mut(&server_path) {
                Some(attr) => {
                    attr.size = disk_size;
                    attr.mtime = now;
                }
                None => {
                    state.attrs.insert(server_path.clone(), fallback);
                }
            }
        }
        Ok(data.len())
    }

    /// Close a file, flushing it whole to the server when it was
    /// modified during this session.
    pub async fn close_file(&self, name: &str, directory: &str) -> SessionFsResult<()> {
        let server_path = self.resolver.resolve_join(directory, name);
        let cache_path = self.store.cache_path(&server_path);

        let (handle, modified) = {
            let mut state = self.state.lock();
            let Some(handle) = state.open_files.get(&server_path).cloned() else {
                return Err(SessionFsError::InvalidState {
                    context: vec![format!("close of {server_path} which is not open")],
                });
            };
            match state.metadata.get(&server_path) {
                Some(entry) => (handle, entry.locally_modified),
                None => {
                    // Open without a cache entry breaks the table
                    // invariant; drop the handle as best-effort cleanup.
                    state.open_files.remove(&server_path);
                    return Err(SessionFsError::InvalidState {
                        context: vec![format!(
                            "{server_path} is open but has no cache entry"
                        )],
                    });
                }
            }
        };

        if !modified {
            debug!("{server_path} was not modified, no flush needed");
            self.state.lock().open_files.remove(&server_path);
            return Ok(());
        }

        handle.flush_and_sync().await?;
        self.state.lock().open_files.remove(&server_path);
        drop(handle);

        let timestamp = match self.stub.close_flush(&server_path, &cache_path).await {
            Ok(timestamp) => timestamp,
            Err(err) => {
                // Keep the session alive so the caller can close again.
                warn!("Flush of {server_path} failed, re-opening the local handles");
                match OpenFile::open_pair(&cache_path).await {
                    Ok(handles) => {
                        self.state
                            .lock()
                            .open_files
                            .insert(server_path.clone(), Arc::new(handles));
                    }
                    Err(reopen_err) => {
                        warn!("Could not re-open {server_path}: {reopen_err}");
                    }
                }
                return Err(err);
            }
        };

        let disk_size = self
            .store
            .size(&cache_path)
            .await
            .add_context("refreshing the snapshot size after the flush")?;
        let disk_size = i64::try_from(disk_size).unwrap_or(i64::MAX);
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.metadata.get_mut(&server_path) {
                entry.locally_modified = false;
                entry.server_timestamp = timestamp;
            }
            if let Some(attr) = state.attrs.get_mut(&server_path) {
                attr.size = disk_size;
                attr.mtime = timestamp;
                attr.ctime = timestamp;
            }
        }
        info!("{server_path} flushed and closed");
        Ok(())
    }

    /// Create a new file locally: an empty cache file, a dirty cache
    /// entry with no server version yet, and an open handle pair. The
    /// server first sees the file at close-flush time.
    pub async fn create_file(&self, name: &str, directory: &str) -> SessionFsResult<()> {
        let server_path = self.resolver.resolve_join(directory, name);
        let cache_path = self.store.cache_path(&server_path);
        {
            let state = self.state.lock();
            if state.metadata.contains_key(&server_path)
                || state.open_files.contains_key(&server_path)
            {
                return Err(SessionFsError::AlreadyExists {
                    path: server_path,
                    context: vec!["create of a file this client already knows".to_owned()],
                });
            }
        }

        self.store.create_empty(&cache_path).await?;
        let handles = OpenFile::open_pair(&cache_path).await?;
        let attr = local_attr_snapshot(&cache_path).await?;
        let base_name = name.to_owned();

        let mut state = self.state.lock();
        state.metadata.insert(
            server_path.clone(),
            CacheEntry {
                locally_modified: true,
                server_timestamp: 0,
                base_name,
            },
        );
        state
            .open_files
            .insert(server_path.clone(), Arc::new(handles));
        state.attrs.insert(server_path, attr);
        Ok(())
    }

    /// Create a directory on the server.
    pub async fn make_directory(&self, directory: &str, mode: u32) -> SessionFsResult<()> {
        let server_path = self.resolver.resolve(directory);
        self.stub.mkdir(&server_path, mode).await
    }

    /// Remove a file or empty directory on the server and forget any
    /// local state for it.
    pub async fn delete_file(&self, full_path: &str) -> SessionFsResult<()> {
        let server_path = self.resolver.resolve(full_path);
        self.stub.unlink(&server_path).await?;

        {
            let mut state = self.state.lock();
            state.metadata.remove(&server_path);
            state.attrs.remove(&server_path);
            state.open_files.remove(&server_path);
        }
        let cache_path = self.store.cache_path(&server_path);
        if let Err(err) = self.store.remove(&cache_path).await {
            debug!("Failed to remove the cache file of {server_path}: {err}");
        }
        Ok(())
    }

    /// Rename on the server, then re-key every local entry under the
    /// old path and move the cached copy.
    pub async fn rename_file(
        &self,
        name: &str,
        new_name: &str,
        directory: &str,
        new_directory: &str,
    ) -> SessionFsResult<()> {
        let old_path = self.resolver.resolve_join(directory, name);
        let new_path = self.resolver.resolve_join(new_directory, new_name);
        self.stub.rename(&old_path, &new_path).await?;

        let old_cache = self.store.cache_path(&old_path);
        let new_cache = self.store.cache_path(&new_path);
        if old_cache.exists() {
            if let Err(err) = self.store.rename(&old_cache, &new_cache).await {
                debug!("Failed to move the cached copy of {old_path}: {err}");
            }
        }
        {
            let mut state = self.state.lock();
            let ClientState {
                ref mut metadata,
                ref mut open_files,
                ref mut attrs,
            } = *state;
            rekey_prefix(metadata, &old_path, &new_path);
            rekey_prefix(attrs, &old_path, &new_path);
            rekey_prefix(open_files, &old_path, &new_path);
        }
        Ok(())
    }

    /// Resize a file on the server, mirroring the new size into the
    /// cached copy when one exists.
    pub async fn truncate_file(
        &self,
        name: &str,
        directory: &str,
        size: u64,
    ) -> SessionFsResult<()> {
        let server_path = self.resolver.resolve_join(directory, name);
        self.stub.truncate(&server_path, size).await?;

        let cached = self.state.lock().metadata.contains_key(&server_path);
        if cached {
            let cache_path = self.store.cache_path(&server_path);
            if cache_path.exists() {
                self.store.truncate(&cache_path, size).await?;
            }
            let now = now_nanos();
            let mut state = self.state.lock();
            if let Some(attr) = state.attrs.get_mut(&server_path) {
                attr.size = i64::try_from(size).unwrap_or(i64::MAX);
                attr.mtime = now;
            }
        }
        Ok(())
    }

    /// The server's diagnostics view.
    pub async fn server_status(&self) -> SessionFsResult<StatusResponse> {
        self.stub.status().await
    }
}

impl Drop for FsClient {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.subscriber.take() {
            handle.abort();
        }
    }
}

/// Build an attribute snapshot from the local cache file, with
/// ownership spoofed to the invoking user.
async fn local_attr_snapshot(cache_path: &Path) -> SessionFsResult<FileAttributes> {
    let meta = tokio::fs::metadata(cache_path).await?;
    Ok(FileAttributes {
        size: i64::try_from(meta.len()).unwrap_or(i64::MAX),
        mode: meta.mode(),
        nlink: meta.nlink(),
        uid: nix::unistd::getuid().as_raw(),
        gid: nix::unistd::getgid().as_raw(),
        atime: fold_timestamp(meta.atime(), meta.atime_nsec()),
        mtime: fold_timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: fold_timestamp(meta.ctime(), meta.ctime_nsec()),
    })
}
