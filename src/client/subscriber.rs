//! The background task consuming the server's notification stream and
//! applying evictions to the local maps.

use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::rpc::connection::read_frame_from;
use crate::rpc::message::{self, Notification, NotificationKind, RespType};

use super::meta::{rekey_prefix, ClientState};
use super::store::CacheStore;
use super::stub::RpcStub;

/// Spawn the subscriber task for a client.
///
/// The task opens the subscription stream once and consumes it until
/// the server closes it or the token is cancelled. Reconnecting after a
/// drop is deliberately not attempted; compare-on-open keeps the cache
/// correct without notifications.
pub fn spawn(
    stub: Arc<RpcStub>,
    state: Arc<Mutex<ClientState>>,
    store: Arc<CacheStore>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        run(stub, state, store, token).await;
    })
}

/// The subscriber loop.
async fn run(
    stub: Arc<RpcStub>,
    state: Arc<Mutex<ClientState>>,
    store: Arc<CacheStore>,
    token: CancellationToken,
) {
    let conn = match stub.open_subscription().await {
        Ok(conn) => conn,
        Err(err) => {
            warn!("Failed to open the notification stream: {err}");
            return;
        }
    };
    // Keep the whole stream; dropping the write direction would look
    // like a disconnect to the server's watchdog.
    let mut stream = conn.into_stream();
    let mut buf = BytesMut::with_capacity(4 * 1024);

    loop {
        tokio::select! {
            () = token.cancelled() => {
                debug!("Subscriber cancelled");
                return;
            }
            frame = read_frame_from(&mut stream, &mut buf) => {
                let (header, body) = match frame {
                    Ok(frame) => frame,
                    Err(err) => {
                        info!("Notification stream ended: {err}");
                        return;
                    }
                };
                if header.op != RespType::Notification.to_u8() {
                    debug!("Ignoring a non-notification frame on the subscription stream");
                    continue;
                }
                match message::decode::<Notification>(&body) {
                    Ok(notification) => {
                        apply_notification(&state, &store, notification).await;
                    }
                    Err(err) => {
                        // Survive a bad notification; only a dead stream
                        // ends the task.
                        warn!("Undecodable notification: {err}");
                    }
                }
            }
        }
    }
}

/// Apply one notification to the client maps.
///
/// The state mutex is held only for the map mutations; disk cleanup
/// runs after it is released.
pub(super) async fn apply_notification(
    state: &Mutex<ClientState>,
    store: &CacheStore,
    notification: Notification,
) {
    let path = notification.path.clone();
    match notification.kind {
        NotificationKind::Update => {
            let mut guard = state.lock();
            if guard.open_files.contains_key(&path) {
                // Open-session stability wins over immediate coherence;
                // the entry survives until the local close.
                warn!("Skipping update eviction of {path}: file is open locally");
                return;
            }
            guard.metadata.remove(&path);
            guard.attrs.remove(&path);
            debug!("Evicted {path} after a remote update");
            // The stale cache file stays on disk; the next open streams
            // a fresh copy over it.
        }
        NotificationKind::Delete => {
            {
                let mut guard = state.lock();
                if guard.open_files.contains_key(&path) {
                    warn!("Skipping delete eviction of {path}: file is open locally");
                    return;
                }
                guard.metadata.remove(&path);
                guard.attrs.remove(&path);
            }
            let cache_path = store.cache_path(&path);
            if let Err(err) = store.remove(&cache_path).await {
                debug!("Failed to remove the cache file of deleted {path}: {err}");
            }
            debug!("Evicted {path} after a remote delete");
        }
        NotificationKind::Rename => {
            let Some(new_path) = notification.new_path else {
                warn!("Rename notification for {path} without a destination");
                return;
            };
            {
                let mut guard = state.lock();
                let ClientState {
                    ref mut metadata,
                    ref mut open_files,
                    ref mut attrs,
                } = *guard;
                rekey_prefix(metadata, &path, &new_path);
                rekey_prefix(attrs, &path, &new_path);
                rekey_prefix(open_files, &path, &new_path);
            }
            let old_cache = store.cache_path(&path);
            let new_cache = store.cache_path(&new_path);
            if old_cache.exists() {
                if let Err(err) = store.rename(&old_cache, &new_cache).await {
                    // Fall back to a refetch on the next open.
                    debug!("Failed to move the cache file of {path}: {err}");
                    let mut guard = state.lock();
                    guard.metadata.remove(&new_path);
                    guard.attrs.remove(&new_path);
                }
            }
            debug!("Re-keyed {path} to {new_path} after a remote rename");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::meta::CacheEntry;

    fn entry(name: &str) -> CacheEntry {
        CacheEntry {
            locally_modified: false,
            server_timestamp: 10,
            base_name: name.to_owned(),
        }
    }

    fn state_with(path: &str) -> Arc<Mutex<ClientState>> {
        let state = ClientState::default();
        let state = Arc::new(Mutex::new(state));
        state.lock().metadata.insert(path.to_owned(), entry("f"));
        state
    }

    #[tokio::test]
    async fn test_update_evicts_closed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let state = state_with("/srv/f");

        apply_notification(
            &state,
            &store,
            Notification {
                kind: NotificationKind::Update,
                path: "/srv/f".to_owned(),
                new_path: None,
                timestamp: 99,
            },
        )
        .await;

        assert!(!state.lock().metadata.contains_key("/srv/f"));
    }

    #[tokio::test]
    async fn test_update_skips_open_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let state = state_with("/srv/f");
        {
            let cache_path = store.cache_path("/srv/f");
            store.create_empty(&cache_path).await.expect("create");
            let handles = crate::client::meta::OpenFile::open_pair(&cache_path)
                .await
                .expect("open pair");
            state
                .lock()
                .open_files
                .insert("/srv/f".to_owned(), Arc::new(handles));
        }

        apply_notification(
            &state,
            &store,
            Notification {
                kind: NotificationKind::Update,
                path: "/srv/f".to_owned(),
                new_path: None,
                timestamp: 99,
            },
        )
        .await;

        // Invalidation was skipped: the entry survives.
        assert!(state.lock().metadata.contains_key("/srv/f"));
    }

    #[tokio::test]
    async fn test_delete_removes_cache_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let state = state_with("/srv/f");
        let cache_path = store.cache_path("/srv/f");
        store.create_empty(&cache_path).await.expect("create");

        apply_notification(
            &state,
            &store,
            Notification {
                kind: NotificationKind::Delete,
                path: "/srv/f".to_owned(),
                new_path: None,
                timestamp: 99,
            },
        )
        .await;

        assert!(!state.lock().metadata.contains_key("/srv/f"));
        assert!(!cache_path.exists());
    }

    #[tokio::test]
    async fn test_rename_rekeys_and_moves_cache_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStore::new(dir.path());
        let state = state_with("/srv/old");
        let old_cache = store.cache_path("/srv/old");
        store.create_empty(&old_cache).await.expect("create");

        apply_notification(
            &state,
            &store,
            Notification {
                kind: NotificationKind::Rename,
                path: "/srv/old".to_owned(),
                new_path: Some("/srv/new".to_owned()),
                timestamp: 99,
            },
        )
        .await;

        let guard = state.lock();
        assert!(!guard.metadata.contains_key("/srv/old"));
        assert!(guard.metadata.contains_key("/srv/new"));
        drop(guard);
        assert!(!old_cache.exists());
        assert!(store.cache_path("/srv/new").exists());
    }
}
