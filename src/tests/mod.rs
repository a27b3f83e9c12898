//! End-to-end tests: a real server on an ephemeral loopback port and
//! real clients with their own cache directories.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use crate::client::FsClient;
use crate::common::error::SessionFsError;
use crate::common::logger::init_logger;
use crate::rpc::common::TimeoutOptions;
use crate::rpc::message::EntryType;
use crate::rpc::server::RpcServer;
use crate::server::{FileService, SubscriberRegistry};

/// A running in-process server over a temporary root.
struct TestServer {
    /// Keeps the accept loop alive.
    _server: RpcServer<FileService>,
    /// The served root; removed on drop.
    root: TempDir,
    /// The loopback address clients connect to.
    addr: String,
    /// The registry, for asserting server-side state.
    registry: Arc<SubscriberRegistry>,
}

impl TestServer {
    async fn start() -> Self {
        init_logger("debug");
        let root = tempfile::tempdir().expect("server root");
        let registry = Arc::new(SubscriberRegistry::new());
        let service = Arc::new(FileService::new(
            root.path().to_path_buf(),
            Arc::clone(&registry),
        ));
        let mut server = RpcServer::new(TimeoutOptions::default(), service);
        server.listen("127.0.0.1:0").await.expect("listen");
        let addr = server.local_addr().expect("bound address").to_string();
        Self {
            _server: server,
            root,
            addr,
            registry,
        }
    }

    /// A fresh client with its own cache directory.
    async fn client(&self) -> (FsClient, TempDir) {
        let cache = tempfile::tempdir().expect("cache root");
        let client = FsClient::new(&self.addr, cache.path().to_path_buf())
            .await
            .expect("client construction");
        (client, cache)
    }

    /// Block until the server has the client's subscription queue, so
    /// fan-out from other clients cannot race the subscribe call.
    async fn await_subscribed(&self, client: &FsClient) {
        wait_until(|| self.registry.has_subscriber(client.client_id())).await;
    }
}

/// Poll a condition for a bounded time.
async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200_u32 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not met within the bounded wait");
}

#[tokio::test]
async fn test_write_then_read_roundtrip() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client.create_file("f.txt", "/dir").await.expect("create");
    let data = b"EricZhang12345";
    let written = client
        .write_file("f.txt", "/dir", data, 0)
        .await
        .expect("write");
    assert_eq!(written, data.len());

    // The snapshot and the cache file must agree on the size.
    let server_path = client.resolver().resolve_join("/dir", "f.txt");
    let cache_path = client.resolver().cache_path(&server_path);
    let attr = client.attr_snapshot(&server_path).expect("snapshot");
    assert_eq!(attr.size, 14);
    assert_eq!(std::fs::metadata(&cache_path).expect("meta").len(), 14);

    client.close_file("f.txt", "/dir").await.expect("close");
    client.open_file("f.txt", "/dir").await.expect("re-open");
    let read = client
        .read_file("f.txt", "/dir", data.len(), 0)
        .await
        .expect("read");
    assert_eq!(read, data);
    client.close_file("f.txt", "/dir").await.expect("close again");

    // The flush landed in the server's tree.
    let on_server = std::fs::read(server.root.path().join("dir/f.txt")).expect("server file");
    assert_eq!(on_server, data);
}

#[tokio::test]
async fn test_partial_overwrite_preserves_tail() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client.create_file("f.txt", "/dir").await.expect("create");
    client
        .write_file("f.txt", "/dir", b"EricZhang12345", 0)
        .await
        .expect("write");
    client.close_file("f.txt", "/dir").await.expect("close");

    client.open_file("f.txt", "/dir").await.expect("open");
    client
        .write_file("f.txt", "/dir", b"Fuse!", 6)
        .await
        .expect("overwrite");
    client.close_file("f.txt", "/dir").await.expect("close");

    client.open_file("f.txt", "/dir").await.expect("open");
    let read = client
        .read_file("f.txt", "/dir", 14, 0)
        .await
        .expect("read");
    assert_eq!(read, b"EricZhFuse!345");
}

#[tokio::test]
async fn test_two_client_coherence_after_close() {
    let server = TestServer::start().await;
    let (client_a, _cache_a) = server.client().await;
    let (client_b, _cache_b) = server.client().await;

    client_a
        .create_file("Eric.txt", "/t")
        .await
        .expect("create");
    client_a
        .write_file("Eric.txt", "/t", b"This is my test", 0)
        .await
        .expect("write");
    client_a
        .close_file("Eric.txt", "/t")
        .await
        .expect("close");

    client_b.open_file("Eric.txt", "/t").await.expect("open");
    client_b
        .write_file("Eric.txt", "/t", b"Hi", 15)
        .await
        .expect("append");
    client_b
        .close_file("Eric.txt", "/t")
        .await
        .expect("close");

    // Compare on re-open sees B's flush even without the notification.
    client_a.open_file("Eric.txt", "/t").await.expect("open");
    let read = client_a
        .read_file("Eric.txt", "/t", 17, 0)
        .await
        .expect("read");
    assert_eq!(read, b"This is my testHi");
}

#[tokio::test]
async fn test_rename_updates_listing_and_local_maps() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client.create_file("a.txt", "/d").await.expect("create");
    client
        .write_file("a.txt", "/d", b"payload", 0)
        .await
        .expect("write");
    client.close_file("a.txt", "/d").await.expect("close");

    client
        .rename_file("a.txt", "b.txt", "/d", "/d")
        .await
        .expect("rename");

    let listing = client.ls_contents("/d").await.expect("ls");
    assert!(listing.contains_key("b.txt"));
    assert!(!listing.contains_key("a.txt"));

    let old_path = client.resolver().resolve_join("/d", "a.txt");
    let new_path = client.resolver().resolve_join("/d", "b.txt");
    assert!(!client.is_cached(&old_path));
    assert!(client.is_cached(&new_path));

    // The cached copy moved with the entry and still serves reads.
    client.open_file("b.txt", "/d").await.expect("open renamed");
    let read = client
        .read_file("b.txt", "/d", 7, 0)
        .await
        .expect("read");
    assert_eq!(read, b"payload");
}

#[tokio::test]
async fn test_update_notification_evicts_cached_closed_file() {
    let server = TestServer::start().await;
    std::fs::create_dir_all(server.root.path().join("d")).expect("seed dir");
    std::fs::write(server.root.path().join("d/f"), b"version one").expect("seed file");

    let (client_a, _cache_a) = server.client().await;
    let (client_b, _cache_b) = server.client().await;
    server.await_subscribed(&client_a).await;

    client_a.open_file("f", "/d").await.expect("open");
    client_a.close_file("f", "/d").await.expect("close");
    let server_path = client_a.resolver().resolve_join("/d", "f");
    assert!(client_a.is_cached(&server_path));

    client_b.open_file("f", "/d").await.expect("open");
    client_b
        .write_file("f", "/d", b"version two", 0)
        .await
        .expect("write");
    client_b.close_file("f", "/d").await.expect("close");

    // Within bounded time the UPDATE notification evicts A's entry.
    wait_until(|| !client_a.is_cached(&server_path)).await;

    client_a.open_file("f", "/d").await.expect("re-open");
    let read = client_a
        .read_file("f", "/d", 11, 0)
        .await
        .expect("read");
    assert_eq!(read, b"version two");
}

#[tokio::test]
async fn test_delete_notification_removes_cache_file() {
    let server = TestServer::start().await;
    std::fs::create_dir_all(server.root.path().join("d")).expect("seed dir");
    std::fs::write(server.root.path().join("d/f"), b"doomed").expect("seed file");

    let (client_a, _cache_a) = server.client().await;
    let (client_b, _cache_b) = server.client().await;
    server.await_subscribed(&client_a).await;

    client_a.open_file("f", "/d").await.expect("open");
    client_a.close_file("f", "/d").await.expect("close");
    let server_path = client_a.resolver().resolve_join("/d", "f");
    let cache_path = client_a.resolver().cache_path(&server_path);
    assert!(cache_path.exists());

    client_b.delete_file("/d/f").await.expect("delete");

    wait_until(|| !client_a.is_cached(&server_path)).await;
    wait_until(|| !cache_path.exists()).await;
}

#[tokio::test]
async fn test_directory_listing_includes_mkdir() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client
        .make_directory("/test_suite_dir", 0o755)
        .await
        .expect("mkdir");
    let listing = client.ls_contents("/").await.expect("ls");
    assert_eq!(
        listing.get("test_suite_dir"),
        Some(&EntryType::Directory)
    );

    // Repeating the mkdir is a no-op.
    client
        .make_directory("/test_suite_dir", 0o755)
        .await
        .expect("repeat mkdir");
}

#[tokio::test]
async fn test_open_is_idempotent_while_open() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client.create_file("f", "/d").await.expect("create");
    client
        .write_file("f", "/d", b"dirty", 0)
        .await
        .expect("write");

    let server_path = client.resolver().resolve_join("/d", "f");
    assert!(client.is_open(&server_path));
    // A second open of an open file succeeds without altering state.
    client.open_file("f", "/d").await.expect("repeated open");
    assert!(client.is_open(&server_path));

    // The dirty flag survived, so the close still flushes.
    client.close_file("f", "/d").await.expect("close");
    let on_server = std::fs::read(server.root.path().join("d/f")).expect("server file");
    assert_eq!(on_server, b"dirty");
}

#[tokio::test]
async fn test_getattr_missing_entry_is_not_found() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    let err = client
        .get_attributes(".hidden-probe", "/")
        .await
        .expect_err("missing file");
    assert!(matches!(err, SessionFsError::NotFound { .. }));
}

#[tokio::test]
async fn test_getattr_spoofs_ownership() {
    let server = TestServer::start().await;
    std::fs::write(server.root.path().join("f"), b"x").expect("seed");
    let (client, _cache) = server.client().await;

    let attr = client.get_attributes("f", "/").await.expect("getattr");
    assert_eq!(attr.uid, nix::unistd::getuid().as_raw());
    assert_eq!(attr.gid, nix::unistd::getgid().as_raw());
    assert_eq!(attr.size, 1);
}

#[tokio::test]
async fn test_size_consistency_across_extending_writes() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client.create_file("grow.bin", "/d").await.expect("create");
    let server_path = client.resolver().resolve_join("/d", "grow.bin");
    let cache_path = client.resolver().cache_path(&server_path);

    for (offset, data) in [(0_u64, &b"aaaa"[..]), (4, b"bb"), (10, b"c")] {
        client
            .write_file("grow.bin", "/d", data, offset)
            .await
            .expect("write");
        let snapshot = client.attr_snapshot(&server_path).expect("snapshot");
        let disk = std::fs::metadata(&cache_path).expect("meta").len();
        assert_eq!(snapshot.size, i64::try_from(disk).expect("fits"));
    }
}

#[tokio::test]
async fn test_open_missing_file_is_backend_unavailable() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    let err = client
        .open_file("missing.txt", "/")
        .await
        .expect_err("open of a missing file fails");
    assert!(matches!(err, SessionFsError::BackendUnavailable { .. }));
}

#[tokio::test]
async fn test_read_without_open_is_invalid_state() {
    let server = TestServer::start().await;
    std::fs::write(server.root.path().join("f"), b"x").expect("seed");
    let (client, _cache) = server.client().await;

    let err = client
        .read_file("f", "/", 1, 0)
        .await
        .expect_err("read without open");
    assert!(matches!(err, SessionFsError::InvalidState { .. }));

    // Cached but closed is still not readable.
    client.open_file("f", "/").await.expect("open");
    client.close_file("f", "/").await.expect("close");
    let err = client
        .read_file("f", "/", 1, 0)
        .await
        .expect_err("read after close");
    assert!(matches!(err, SessionFsError::InvalidState { .. }));
}

#[tokio::test]
async fn test_create_collision_is_already_exists() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client.create_file("f", "/d").await.expect("create");
    let err = client
        .create_file("f", "/d")
        .await
        .expect_err("double create");
    assert!(matches!(err, SessionFsError::AlreadyExists { .. }));
}

#[tokio::test]
async fn test_truncate_shrinks_server_and_cache() {
    let server = TestServer::start().await;
    let (client, _cache) = server.client().await;

    client.create_file("t.bin", "/d").await.expect("create");
    client
        .write_file("t.bin", "/d", b"0123456789", 0)
        .await
        .expect("write");
    client.close_file("t.bin", "/d").await.expect("close");

    client
        .truncate_file("t.bin", "/d", 4)
        .await
        .expect("truncate");
    let on_server = std::fs::metadata(server.root.path().join("d/t.bin")).expect("meta");
    assert_eq!(on_server.len(), 4);

    let server_path = client.resolver().resolve_join("/d", "t.bin");
    let snapshot = client.attr_snapshot(&server_path).expect("snapshot");
    assert_eq!(snapshot.size, 4);

    // Re-open refetches the truncated content.
    client.open_file("t.bin", "/d").await.expect("open");
    let read = client
        .read_file("t.bin", "/d", 10, 0)
        .await
        .expect("read");
    assert_eq!(read, b"0123");
}

#[tokio::test]
async fn test_status_reports_open_sessions() {
    let server = TestServer::start().await;
    std::fs::write(server.root.path().join("f"), b"x").expect("seed");
    let (client, _cache) = server.client().await;

    client.open_file("f", "/").await.expect("open");
    let status = client.server_status().await.expect("status");
    assert!(status
        .connected_clients
        .contains(&client.client_id().to_owned()));
    let server_path = client.resolver().resolve_join("/", "f");
    assert!(status.open_files.contains_key(&server_path));

    client
        .write_file("f", "/", b"y", 0)
        .await
        .expect("write");
    client.close_file("f", "/").await.expect("close");
    let status = client.server_status().await.expect("status");
    assert!(!status.open_files.contains_key(&server_path));
}

#[tokio::test]
async fn test_shutdown_joins_subscriber_without_deadlock() {
    let server = TestServer::start().await;
    let (mut client, _cache) = server.client().await;
    server.await_subscribed(&client).await;

    tokio::time::timeout(Duration::from_secs(5), client.shutdown())
        .await
        .expect("shutdown must not hang");
}

#[tokio::test]
async fn test_server_cleans_up_disconnected_client() {
    let server = TestServer::start().await;
    std::fs::write(server.root.path().join("f"), b"x").expect("seed");

    let (mut client, _cache) = server.client().await;
    server.await_subscribed(&client).await;
    client.open_file("f", "/").await.expect("open");
    let server_path = client.resolver().resolve_join("/", "f");
    assert!(server.registry.has_interest(&server_path));

    let client_id = client.client_id().to_owned();
    client.shutdown().await;
    drop(client);

    let registry = Arc::clone(&server.registry);
    wait_until(move || !registry.has_subscriber(&client_id)).await;
    let registry = Arc::clone(&server.registry);
    wait_until(move || !registry.has_interest(&server_path)).await;
}

#[tokio::test]
async fn test_flushed_create_registers_interest_for_later_updates() {
    let server = TestServer::start().await;
    let (client_a, _cache_a) = server.client().await;
    let (client_b, _cache_b) = server.client().await;
    server.await_subscribed(&client_a).await;

    // A creates the file; the server first sees it at flush time.
    client_a.create_file("n.txt", "/d").await.expect("create");
    client_a
        .write_file("n.txt", "/d", b"one", 0)
        .await
        .expect("write");
    client_a.close_file("n.txt", "/d").await.expect("close");

    // B rewrites it; A must be evicted through its flush-registered
    // interest.
    client_b.open_file("n.txt", "/d").await.expect("open");
    client_b
        .write_file("n.txt", "/d", b"two", 0)
        .await
        .expect("write");
    client_b.close_file("n.txt", "/d").await.expect("close");

    let server_path = client_a.resolver().resolve_join("/d", "n.txt");
    wait_until(|| !client_a.is_cached(&server_path)).await;
}
