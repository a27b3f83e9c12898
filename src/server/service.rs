//! The RPC file service: open, compare, close-flush, the unary tree
//! operations, and the long-lived subscription stream.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task;
use tracing::{debug, error, info, warn};

use crate::common::error::{SessionFsError, SessionFsResult};
use crate::common::util::now_nanos;
use crate::rpc::connection::{write_frame_to, Connection};
use crate::rpc::error::RpcError;
use crate::rpc::message::{
    self, AckResponse, AttrResponse, CloseChunk, CloseResponse, CompareRequest, DirListResponse,
    EntryType, ErrorResponse, FileChunk, GetattrRequest, LsRequest, MkdirRequest, Notification,
    NotificationKind, OpenRequest, RenameRequest, ReqType, RespType, RootRequest, RootResponse,
    StatusCode, StatusRequest, StatusResponse, SubscribeRequest, TruncateRequest, UnlinkRequest,
    CHUNK_SIZE, ROOT_HANDSHAKE_CODE,
};
use crate::rpc::packet::FrameHeader;
use crate::rpc::server::RpcDispatcher;

use super::fs_util;
use super::registry::SubscriberRegistry;

/// Resolve a client-supplied server-absolute path against the served
/// root, rejecting traversal outside of it.
fn resolve_guarded(root: &Path, path: &str) -> SessionFsResult<PathBuf> {
    let candidate = PathBuf::from(path);
    if candidate
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(SessionFsError::ArgumentInvalid {
            context: vec![format!("path {path} contains parent components")],
        });
    }
    if !candidate.starts_with(root) {
        return Err(SessionFsError::ArgumentInvalid {
            context: vec![format!(
                "path {path} is outside the served root {}",
                root.display()
            )],
        });
    }
    Ok(candidate)
}

/// The file service owning the authoritative tree under `root`.
#[derive(Debug)]
pub struct FileService {
    /// The served root directory.
    root: PathBuf,
    /// The subscriber registry shared with the diagnostics view.
    registry: Arc<SubscriberRegistry>,
}

impl FileService {
    /// Create the service for the given root.
    #[must_use]
    pub fn new(root: PathBuf, registry: Arc<SubscriberRegistry>) -> Self {
        Self { root, registry }
    }

    /// The registry backing this service.
    #[must_use]
    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Send a successful unary response.
    async fn send_ok<T: Serialize>(
        conn: &mut Connection,
        seq: u64,
        op: RespType,
        msg: &T,
    ) -> Result<(), RpcError> {
        let body = message::encode(msg)?;
        conn.send_frame(seq, op.to_u8(), &body).await
    }

    /// Send an error frame carrying the mapped status code.
    async fn send_err(
        conn: &mut Connection,
        seq: u64,
        err: SessionFsError,
    ) -> Result<(), RpcError> {
        let resp = ErrorResponse {
            message: err.to_string(),
            code: StatusCode::from(err),
        };
        let body = message::encode(&resp)?;
        conn.send_frame(seq, RespType::Error.to_u8(), &body).await
    }

    /// Send the outcome of a unary handler.
    async fn reply<T: Serialize>(
        conn: &mut Connection,
        seq: u64,
        op: RespType,
        result: SessionFsResult<T>,
    ) -> Result<(), RpcError> {
        match result {
            Ok(msg) => Self::send_ok(conn, seq, op, &msg).await,
            Err(err) => Self::send_err(conn, seq, err).await,
        }
    }

    /// Stream the whole content of `path` as `FileChunk` frames and
    /// finish with an empty `eof` frame.
    async fn stream_file(
        conn: &mut Connection,
        seq: u64,
        path: &Path,
        timestamp: i64,
    ) -> Result<(), RpcError> {
        let mut file = match tokio::fs::File::open(path).await {
            Ok(file) => file,
            Err(err) => {
                return Self::send_err(conn, seq, SessionFsError::from(err)).await;
            }
        };
        let mut buf = vec![0_u8; CHUNK_SIZE];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|err| RpcError::InternalError(err.to_string()))?;
            let chunk = FileChunk {
                timestamp,
                update: true,
                eof: n == 0,
                data: buf.get(..n).unwrap_or(&[]).to_vec(),
            };
            let body = message::encode(&chunk)?;
            conn.send_frame(seq, RespType::FileChunk.to_u8(), &body)
                .await?;
            if n == 0 {
                return Ok(());
            }
        }
    }

    /// `request_root`: hand the served root to a correctly-initialized
    /// client and remember its identifier.
    fn handle_request_root(&self, req: &RootRequest) -> SessionFsResult<RootResponse> {
        if req.code != ROOT_HANDSHAKE_CODE {
            warn!("Root request with a wrong handshake code");
            return Err(SessionFsError::PermissionDenied {
                context: vec!["wrong handshake code for request_root".to_owned()],
            });
        }
        if !req.client_id.is_empty() {
            self.registry.register_client(&req.client_id);
        }
        Ok(RootResponse {
            root_path: self.root.display().to_string(),
        })
    }

    /// `open`: register interest and stream the file back.
    async fn handle_open(
        &self,
        req: &OpenRequest,
        conn: &mut Connection,
        seq: u64,
    ) -> Result<(), RpcError> {
        debug!("Client {} opens {}", req.client_id, req.path);
        let (path, timestamp) = match resolve_guarded(&self.root, &req.path)
            .and_then(|path| fs_util::file_timestamp(&path).map(|ts| (path, ts)))
        {
            Ok(resolved) => resolved,
            Err(err) => return Self::send_err(conn, seq, err).await,
        };
        self.registry.register_interest(&req.path, &req.client_id);
        self.registry.register_open(&req.path, &req.client_id);
        Self::stream_file(conn, seq, &path, timestamp).await
    }

    /// `compare`: confirm a current cached copy with a single frame, or
    /// stream the newer content.
    async fn handle_compare(
        &self,
        req: &CompareRequest,
        conn: &mut Connection,
        seq: u64,
    ) -> Result<(), RpcError> {
        let (path, timestamp) = match resolve_guarded(&self.root, &req.path)
            .and_then(|path| fs_util::file_timestamp(&path).map(|ts| (path, ts)))
        {
            Ok(resolved) => resolved,
            Err(err) => return Self::send_err(conn, seq, err).await,
        };
        self.registry.register_interest(&req.path, &req.client_id);
        self.registry.register_open(&req.path, &req.client_id);

        if timestamp <= req.client_timestamp {
            debug!("Cache for {} is valid", req.path);
            let chunk = FileChunk {
                timestamp,
                update: false,
                eof: true,
                data: Vec::new(),
            };
            let body = message::encode(&chunk)?;
            conn.send_frame(seq, RespType::FileChunk.to_u8(), &body)
                .await
        } else {
            debug!("Cache for {} is stale, sending update", req.path);
            Self::stream_file(conn, seq, &path, timestamp).await
        }
    }

    /// `close`: receive the flushed content chunk by chunk, replace the
    /// backing file atomically, stamp it, and fan out the update.
    ///
    /// Any failure drops the connection; the client retries the whole
    /// flush on a fresh one.
    async fn handle_close(
        &self,
        first: CloseChunk,
        conn: &mut Connection,
        seq: u64,
    ) -> Result<(), RpcError> {
        debug!("Client {} flushes {}", first.client_id, first.path);
        let path = match resolve_guarded(&self.root, &first.path) {
            Ok(path) => path,
            Err(err) => {
                Self::send_err(conn, seq, err).await?;
                return Err(RpcError::InvalidRequest(
                    "close flush for an invalid path".to_owned(),
                ));
            }
        };

        let client_id = first.client_id.clone();
        let rpc_path = first.path.clone();
        let tmp_path = Self::flush_tmp_path(&path, &client_id);
        let flush_result = self.receive_flush(first, conn, &path, &tmp_path).await;
        let timestamp = match flush_result {
            Ok(timestamp) => timestamp,
            Err(err) => {
                // Leave no partial temp file behind.
                let _ = tokio::fs::remove_file(&tmp_path).await;
                let message = err.to_string();
                let _ = Self::send_err(conn, seq, err).await;
                return Err(RpcError::InternalError(message));
            }
        };

        Self::send_ok(conn, seq, RespType::CloseDone, &CloseResponse { timestamp }).await?;

        // A file created on the client is first seen here; make sure the
        // flusher itself is registered before notifying the others.
        self.registry.register_interest(&rpc_path, &client_id);
        let notification = Notification {
            kind: NotificationKind::Update,
            path: rpc_path.clone(),
            new_path: None,
            timestamp,
        };
        self.registry.fan_out(&rpc_path, &client_id, &notification);
        self.registry.finish_open(&rpc_path, &client_id);
        info!("Client {client_id} flushed {rpc_path}");
        Ok(())
    }

    /// The temporary file a flush streams into before the atomic rename.
    fn flush_tmp_path(path: &Path, client_id: &str) -> PathBuf {
        let name = path
            .file_name()
            .map_or_else(|| "flush".to_owned(), |n| n.to_string_lossy().into_owned());
        path.with_file_name(format!(".{name}.{client_id}.tmp"))
    }

    /// Drain the close-flush chunk stream into the temporary file and
    /// rename it over the target. Returns the new authoritative
    /// timestamp.
    async fn receive_flush(
        &self,
        first: CloseChunk,
        conn: &mut Connection,
        path: &Path,
        tmp_path: &Path,
    ) -> SessionFsResult<i64> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = tokio::fs::File::create(tmp_path).await?;
        tmp.write_all(&first.data).await?;

        let mut eof = first.eof;
        while !eof {
            let (header, body) = conn.recv_frame().await.map_err(|err| {
                SessionFsError::InvalidState {
                    context: vec![format!("close-flush stream interrupted: {err}")],
                }
            })?;
            if header.op != ReqType::CloseChunk.to_u8() {
                return Err(SessionFsError::InvalidState {
                    context: vec![format!(
                        "unexpected frame op {} inside a close-flush",
                        header.op
                    )],
                });
            }
            let chunk: CloseChunk =
                message::decode(&body).map_err(|err| SessionFsError::InvalidState {
                    context: vec![format!("undecodable close-flush chunk: {err}")],
                })?;
            tmp.write_all(&chunk.data).await?;
            eof = chunk.eof;
        }

        tmp.sync_all().await?;
        drop(tmp);
        tokio::fs::rename(tmp_path, path).await?;
        fs_util::file_timestamp(path)
    }

    /// `getattr`: silent `NotFound` for missing paths.
    fn handle_getattr(&self, req: &GetattrRequest) -> SessionFsResult<AttrResponse> {
        let path = resolve_guarded(&self.root, &req.path)?;
        fs_util::stat_attr(&path)
    }

    /// `ls`: entry name to type tag, skipping entries that are neither
    /// regular files nor directories.
    async fn handle_ls(&self, req: &LsRequest) -> SessionFsResult<DirListResponse> {
        let path = resolve_guarded(&self.root, &req.path)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| SessionFsError::NotFound {
                path: req.path.clone(),
                context: vec!["ls target missing".to_owned()],
            })?;
        if !meta.is_dir() {
            return Err(SessionFsError::ArgumentInvalid {
                context: vec![format!("{} is not a directory", req.path)],
            });
        }

        let mut entries = std::collections::BTreeMap::new();
        let mut dir = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if file_type.is_dir() {
                entries.insert(name, EntryType::Directory);
            } else if file_type.is_file() {
                entries.insert(name, EntryType::RegularFile);
            }
        }
        Ok(DirListResponse { entries })
    }

    /// `mkdir`: idempotent for an existing directory, an error when the
    /// name exists as a file.
    async fn handle_mkdir(&self, req: &MkdirRequest) -> SessionFsResult<AckResponse> {
        let path = resolve_guarded(&self.root, &req.path)?;
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => {
                debug!("mkdir of existing directory {}", req.path);
                return Ok(AckResponse {});
            }
            Ok(_) => {
                return Err(SessionFsError::AlreadyExists {
                    path: req.path.clone(),
                    context: vec!["mkdir target exists as a file".to_owned()],
                });
            }
            Err(_) => {}
        }
        tokio::fs::create_dir(&path).await?;
        let perms: std::fs::Permissions =
            std::os::unix::fs::PermissionsExt::from_mode(req.mode & 0o7777);
        tokio::fs::set_permissions(&path, perms).await?;
        info!("Created directory {}", req.path);
        Ok(AckResponse {})
    }

    /// `rename`: atomic on the backing filesystem; re-keys interest and
    /// fans out to clients caching the old path.
    async fn handle_rename(&self, req: &RenameRequest) -> SessionFsResult<AckResponse> {
        let old = resolve_guarded(&self.root, &req.path)?;
        let new = resolve_guarded(&self.root, &req.new_path)?;
        if let Some(parent) = new.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&old, &new)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => SessionFsError::NotFound {
                    path: req.path.clone(),
                    context: vec!["rename source missing".to_owned()],
                },
                _ => SessionFsError::from(err),
            })?;

        let timestamp = fs_util::file_timestamp(&new).unwrap_or_default();
        let notification = Notification {
            kind: NotificationKind::Rename,
            path: req.path.clone(),
            new_path: Some(req.new_path.clone()),
            timestamp,
        };
        self.registry
            .fan_out(&req.path, &req.client_id, &notification);
        self.registry
            .rekey_path(&req.path, &req.new_path, &req.client_id);
        info!("Renamed {} to {}", req.path, req.new_path);
        Ok(AckResponse {})
    }

    /// `unlink`: removes a file or an empty directory.
    async fn handle_unlink(&self, req: &UnlinkRequest) -> SessionFsResult<AckResponse> {
        let path = resolve_guarded(&self.root, &req.path)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| SessionFsError::NotFound {
                path: req.path.clone(),
                context: vec!["unlink target missing".to_owned()],
            })?;
        if meta.is_dir() {
            tokio::fs::remove_dir(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }

        let notification = Notification {
            kind: NotificationKind::Delete,
            path: req.path.clone(),
            new_path: None,
            timestamp: now_nanos(),
        };
        self.registry
            .fan_out(&req.path, &req.client_id, &notification);
        self.registry.drop_path(&req.path);
        info!("Removed {}", req.path);
        Ok(AckResponse {})
    }

    /// `truncate`: resize the backing file.
    async fn handle_truncate(&self, req: &TruncateRequest) -> SessionFsResult<AckResponse> {
        let path = resolve_guarded(&self.root, &req.path)?;
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => SessionFsError::NotFound {
                    path: req.path.clone(),
                    context: vec!["truncate target missing".to_owned()],
                },
                _ => SessionFsError::from(err),
            })?;
        file.set_len(req.size).await?;
        Ok(AckResponse {})
    }

    /// `status`: the diagnostics snapshot.
    fn handle_status(&self) -> StatusResponse {
        let (connected_clients, open_files) = self.registry.status_snapshot();
        StatusResponse {
            connected_clients,
            open_files,
        }
    }

    /// `subscribe`: register the queue, watch the connection for the
    /// client going away, and pump notifications until shutdown.
    ///
    /// Consumes the connection; when the loop ends, every registry entry
    /// of the client is cleaned up.
    async fn handle_subscribe(&self, req: SubscribeRequest, conn: Connection, seq: u64) {
        info!("Client {} subscribed", req.client_id);
        let queue = self.registry.subscribe(&req.client_id);
        let write_timeout = conn.timeout_options().write_timeout;
        let (mut read_half, mut write_half) = conn.into_stream().into_split();

        // Watchdog: the only way the peer talks on this connection again
        // is by going away; any read completion shuts the queue down.
        let watchdog_queue = Arc::clone(&queue);
        let watchdog = task::spawn(async move {
            let mut probe = [0_u8; 64];
            loop {
                match read_half.read(&mut probe).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        debug!("Ignoring unexpected bytes on a subscription stream");
                    }
                }
            }
            watchdog_queue.cancel();
        });

        while let Some(notification) = queue.pop().await {
            let body = match message::encode(&notification) {
                Ok(body) => body,
                Err(err) => {
                    error!("Failed to encode a notification: {err}");
                    continue;
                }
            };
            let header = FrameHeader {
                seq,
                op: RespType::Notification.to_u8(),
                len: body.len() as u64,
            };
            if let Err(err) =
                write_frame_to(&mut write_half, header, &body, write_timeout).await
            {
                debug!("Subscriber {} went away: {err}", req.client_id);
                break;
            }
        }

        queue.cancel();
        watchdog.abort();
        self.registry.cleanup_client(&req.client_id);
        info!("Client {} unsubscribed", req.client_id);
    }
}

#[async_trait]
impl RpcDispatcher for FileService {
    async fn dispatch(
        &self,
        header: FrameHeader,
        body: Bytes,
        mut conn: Connection,
    ) -> Result<Option<Connection>, RpcError> {
        let seq = header.seq;
        let req_type = match ReqType::from_u8(header.op) {
            Ok(req_type) => req_type,
            Err(err) => {
                warn!("Dropping a frame with an unknown op: {err}");
                Self::send_err(
                    &mut conn,
                    seq,
                    SessionFsError::ArgumentInvalid {
                        context: vec![format!("unknown request op {}", header.op)],
                    },
                )
                .await?;
                return Ok(Some(conn));
            }
        };

        match req_type {
            ReqType::RequestRoot => {
                let req: RootRequest = message::decode(&body)?;
                let result = self.handle_request_root(&req);
                Self::reply(&mut conn, seq, RespType::Root, result).await?;
            }
            ReqType::Open => {
                let req: OpenRequest = message::decode(&body)?;
                self.handle_open(&req, &mut conn, seq).await?;
            }
            ReqType::Compare => {
                let req: CompareRequest = message::decode(&body)?;
                self.handle_compare(&req, &mut conn, seq).await?;
            }
            ReqType::CloseChunk => {
                let first: CloseChunk = message::decode(&body)?;
                self.handle_close(first, &mut conn, seq).await?;
            }
            ReqType::Getattr => {
                let req: GetattrRequest = message::decode(&body)?;
                let result = self.handle_getattr(&req);
                Self::reply(&mut conn, seq, RespType::Attr, result).await?;
            }
            ReqType::Ls => {
                let req: LsRequest = message::decode(&body)?;
                let result = self.handle_ls(&req).await;
                Self::reply(&mut conn, seq, RespType::DirList, result).await?;
            }
            ReqType::Mkdir => {
                let req: MkdirRequest = message::decode(&body)?;
                let result = self.handle_mkdir(&req).await;
                Self::reply(&mut conn, seq, RespType::Ack, result).await?;
            }
            ReqType::Rename => {
                let req: RenameRequest = message::decode(&body)?;
                let result = self.handle_rename(&req).await;
                Self::reply(&mut conn, seq, RespType::Ack, result).await?;
            }
            ReqType::Unlink => {
                let req: UnlinkRequest = message::decode(&body)?;
                let result = self.handle_unlink(&req).await;
                Self::reply(&mut conn, seq, RespType::Ack, result).await?;
            }
            ReqType::Truncate => {
                let req: TruncateRequest = message::decode(&body)?;
                let result = self.handle_truncate(&req).await;
                Self::reply(&mut conn, seq, RespType::Ack, result).await?;
            }
            ReqType::Status => {
                let StatusRequest {} = message::decode(&body)?;
                let status = self.handle_status();
                Self::send_ok(&mut conn, seq, RespType::Status, &status).await?;
            }
            ReqType::Subscribe => {
                let req: SubscribeRequest = message::decode(&body)?;
                self.handle_subscribe(req, conn, seq).await;
                return Ok(None);
            }
        }
        Ok(Some(conn))
    }
}
