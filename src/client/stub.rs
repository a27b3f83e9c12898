//! The RPC client stub: one fresh connection per attempt, bounded
//! retries for the streaming calls, and the mapping from transport and
//! wire errors into the crate error taxonomy.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::common::error::{SessionFsError, SessionFsResult};
use crate::rpc::common::TimeoutOptions;
use crate::rpc::connection::Connection;
use crate::rpc::error::RpcError;
use crate::rpc::message::{
    self, AckResponse, AttrResponse, CloseChunk, CloseResponse, CompareRequest, DirListResponse,
    ErrorResponse, FileChunk, GetattrRequest, LsRequest, MkdirRequest, OpenRequest, RenameRequest,
    ReqType, RespType, RootRequest, RootResponse, StatusCode, StatusRequest, StatusResponse,
    SubscribeRequest, TruncateRequest, UnlinkRequest, CHUNK_SIZE, ROOT_HANDSHAKE_CODE,
};
use crate::rpc::packet::FrameHeader;

use super::store::CacheStore;

/// How many times an idempotent streaming call is attempted before the
/// caller observes `BackendUnavailable`. Every attempt starts from a
/// fresh connection and discards any partial buffer.
pub const MAX_ATTEMPTS: u32 = 3;

/// The answer of a `compare` call.
#[derive(Debug, Clone, Copy)]
pub enum CompareOutcome {
    /// The cached copy is current; the server only confirmed the
    /// timestamp.
    Valid {
        /// The server's timestamp.
        timestamp: i64,
    },
    /// The cached copy was stale; the newer content has replaced the
    /// cache file.
    Updated {
        /// The server's timestamp of the new content.
        timestamp: i64,
    },
}

impl CompareOutcome {
    /// The server timestamp carried by either outcome.
    #[must_use]
    pub fn timestamp(self) -> i64 {
        match self {
            Self::Valid { timestamp } | Self::Updated { timestamp } => timestamp,
        }
    }
}

/// Issues calls against the file server on behalf of one client.
#[derive(Debug)]
pub struct RpcStub {
    /// The server address.
    addr: String,
    /// The owning client's identifier, sent on every mutating call.
    client_id: String,
    /// Connection timeouts.
    timeout_options: TimeoutOptions,
}

impl RpcStub {
    /// Create a stub for the given server address and client id.
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            client_id: client_id.into(),
            timeout_options: TimeoutOptions::default(),
        }
    }

    /// Map a transport failure.
    fn map_rpc(err: &RpcError) -> SessionFsError {
        SessionFsError::BackendUnavailable {
            context: vec![err.to_string()],
        }
    }

    /// Map a typed error frame from the server.
    fn map_error_response(path_hint: &str, resp: ErrorResponse) -> SessionFsError {
        match resp.code {
            StatusCode::NotFound => SessionFsError::NotFound {
                path: path_hint.to_owned(),
                context: vec![resp.message],
            },
            StatusCode::AlreadyExists => SessionFsError::AlreadyExists {
                path: path_hint.to_owned(),
                context: vec![resp.message],
            },
            StatusCode::PermissionDenied => SessionFsError::PermissionDenied {
                context: vec![resp.message],
            },
            StatusCode::InvalidArgument => SessionFsError::ArgumentInvalid {
                context: vec![resp.message],
            },
            StatusCode::Internal => SessionFsError::BackendUnavailable {
                context: vec![resp.message],
            },
        }
    }

    /// Open a fresh connection for one call.
    async fn connect(&self) -> SessionFsResult<Connection> {
        Connection::connect(&self.addr, self.timeout_options.clone())
            .await
            .map_err(|err| Self::map_rpc(&err))
    }

    /// Decode a response frame that must be of the expected type,
    /// turning a typed error frame into the mapped error.
    fn decode_expected<Resp: DeserializeOwned>(
        expect: RespType,
        path_hint: &str,
        header: FrameHeader,
        body: &[u8],
    ) -> SessionFsResult<Resp> {
        let resp_type = RespType::from_u8(header.op).map_err(|err| Self::map_rpc(&err))?;
        if resp_type == RespType::Error {
            let resp: ErrorResponse = message::decode(body).map_err(|err| Self::map_rpc(&err))?;
            return Err(Self::map_error_response(path_hint, resp));
        }
        if resp_type != expect {
            return Err(SessionFsError::InvalidState {
                context: vec![format!(
                    "expected a {expect:?} response, got {resp_type:?}"
                )],
            });
        }
        message::decode(body).map_err(|err| Self::map_rpc(&err))
    }

    /// Issue one unary call.
    async fn call_unary<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        op: ReqType,
        expect: RespType,
        path_hint: &str,
        req: &Req,
    ) -> SessionFsResult<Resp> {
        let mut conn = self.connect().await?;
        let seq = conn.next_seq();
        let body = message::encode(req).map_err(|err| Self::map_rpc(&err))?;
        conn.send_frame(seq, op.to_u8(), &body)
            .await
            .map_err(|err| Self::map_rpc(&err))?;
        let (header, body) = conn.recv_frame().await.map_err(|err| Self::map_rpc(&err))?;
        if header.seq != seq {
            return Err(SessionFsError::InvalidState {
                context: vec![format!(
                    "response sequence {} does not match request {seq}",
                    header.seq
                )],
            });
        }
        Self::decode_expected(expect, path_hint, header, &body)
    }

    /// Ask the server for its served root, registering this client.
    pub async fn request_root(&self) -> SessionFsResult<String> {
        let req = RootRequest {
            code: ROOT_HANDSHAKE_CODE.to_owned(),
            client_id: self.client_id.clone(),
        };
        let resp: RootResponse = self
            .call_unary(ReqType::RequestRoot, RespType::Root, "/", &req)
            .await?;
        Ok(resp.root_path)
    }

    /// Fetch the attributes of a server-absolute path.
    pub async fn getattr(&self, path: &str) -> SessionFsResult<AttrResponse> {
        let req = GetattrRequest {
            path: path.to_owned(),
        };
        self.call_unary(ReqType::Getattr, RespType::Attr, path, &req)
            .await
    }

    /// List a directory.
    pub async fn ls(&self, path: &str) -> SessionFsResult<DirListResponse> {
        let req = LsRequest {
            path: path.to_owned(),
        };
        self.call_unary(ReqType::Ls, RespType::DirList, path, &req)
            .await
    }

    /// Create a directory with the given mode.
    pub async fn mkdir(&self, path: &str, mode: u32) -> SessionFsResult<()> {
        let req = MkdirRequest {
            path: path.to_owned(),
            mode,
        };
        let AckResponse {} = self
            .call_unary(ReqType::Mkdir, RespType::Ack, path, &req)
            .await?;
        Ok(())
    }

    /// Rename a file or directory.
    pub async fn rename(&self, path: &str, new_path: &str) -> SessionFsResult<()> {
        let req = RenameRequest {
            path: path.to_owned(),
            new_path: new_path.to_owned(),
            client_id: self.client_id.clone(),
        };
        let AckResponse {} = self
            .call_unary(ReqType::Rename, RespType::Ack, path, &req)
            .await?;
        Ok(())
    }

    /// Remove a file or an empty directory.
    pub async fn unlink(&self, path: &str) -> SessionFsResult<()> {
        let req = UnlinkRequest {
            path: path.to_owned(),
            client_id: self.client_id.clone(),
        };
        let AckResponse {} = self
            .call_unary(ReqType::Unlink, RespType::Ack, path, &req)
            .await?;
        Ok(())
    }

    /// Resize a file on the server.
    pub async fn truncate(&self, path: &str, size: u64) -> SessionFsResult<()> {
        let req = TruncateRequest {
            path: path.to_owned(),
            size,
        };
        let AckResponse {} = self
            .call_unary(ReqType::Truncate, RespType::Ack, path, &req)
            .await?;
        Ok(())
    }

    /// Fetch the diagnostics view.
    pub async fn status(&self) -> SessionFsResult<StatusResponse> {
        self.call_unary(ReqType::Status, RespType::Status, "/", &StatusRequest {})
            .await
    }

    /// Fetch a whole file into the cache, atomically replacing the
    /// cache file. Returns the server timestamp of the content.
    pub async fn fetch(
        &self,
        path: &str,
        store: &CacheStore,
        cache_path: &Path,
    ) -> SessionFsResult<i64> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.fetch_once(path, store, cache_path).await {
                Ok(timestamp) => return Ok(timestamp),
                Err(err) => {
                    debug!("Fetch attempt {attempt} of {path} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(SessionFsError::BackendUnavailable {
            context: vec![format!(
                "open of {path} failed after {MAX_ATTEMPTS} attempts: {}",
                last_err.map_or_else(|| "unknown error".to_owned(), |e| e.to_string())
            )],
        })
    }

    /// One fetch attempt over a fresh connection.
    async fn fetch_once(
        &self,
        path: &str,
        store: &CacheStore,
        cache_path: &Path,
    ) -> SessionFsResult<i64> {
        let mut conn = self.connect().await?;
        let seq = conn.next_seq();
        let req = OpenRequest {
            path: path.to_owned(),
            client_id: self.client_id.clone(),
        };
        let body = message::encode(&req).map_err(|err| Self::map_rpc(&err))?;
        conn.send_frame(seq, ReqType::Open.to_u8(), &body)
            .await
            .map_err(|err| Self::map_rpc(&err))?;

        let mut writer = store.begin_replace(cache_path).await?;
        let mut timestamp = 0_i64;
        loop {
            let frame = conn.recv_frame().await.map_err(|err| Self::map_rpc(&err));
            let (header, body) = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    writer.abort().await;
                    return Err(err);
                }
            };
            let chunk: FileChunk =
                match Self::decode_expected(RespType::FileChunk, path, header, &body) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        writer.abort().await;
                        return Err(err);
                    }
                };
            if let Err(err) = writer.write_chunk(&chunk.data).await {
                writer.abort().await;
                return Err(err);
            }
            timestamp = chunk.timestamp;
            if chunk.eof {
                break;
            }
        }
        writer.commit().await?;
        Ok(timestamp)
    }

    /// Validate a cached copy against the server, replacing the cache
    /// file when the server streams newer content.
    pub async fn compare(
        &self,
        path: &str,
        client_timestamp: i64,
        store: &CacheStore,
        cache_path: &Path,
    ) -> SessionFsResult<CompareOutcome> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self
                .compare_once(path, client_timestamp, store, cache_path)
                .await
            {
                Ok(outcome) => return Ok(outcome),
                Err(err) => {
                    debug!("Compare attempt {attempt} of {path} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(SessionFsError::BackendUnavailable {
            context: vec![format!(
                "compare of {path} failed after {MAX_ATTEMPTS} attempts: {}",
                last_err.map_or_else(|| "unknown error".to_owned(), |e| e.to_string())
            )],
        })
    }

    /// One compare attempt over a fresh connection.
    async fn compare_once(
        &self,
        path: &str,
        client_timestamp: i64,
        store: &CacheStore,
        cache_path: &Path,
    ) -> SessionFsResult<CompareOutcome> {
        let mut conn = self.connect().await?;
        let seq = conn.next_seq();
        let req = CompareRequest {
            path: path.to_owned(),
            client_timestamp,
            client_id: self.client_id.clone(),
        };
        let body = message::encode(&req).map_err(|err| Self::map_rpc(&err))?;
        conn.send_frame(seq, ReqType::Compare.to_u8(), &body)
            .await
            .map_err(|err| Self::map_rpc(&err))?;

        let (header, body) = conn.recv_frame().await.map_err(|err| Self::map_rpc(&err))?;
        let first: FileChunk = Self::decode_expected(RespType::FileChunk, path, header, &body)?;
        if !first.update {
            return Ok(CompareOutcome::Valid {
                timestamp: first.timestamp,
            });
        }

        // Stale: buffer the streamed content into a replacement file.
        let mut writer = store.begin_replace(cache_path).await?;
        let mut timestamp = first.timestamp;
        let mut eof = first.eof;
        if let Err(err) = writer.write_chunk(&first.data).await {
            writer.abort().await;
            return Err(err);
        }
        while !eof {
            let frame = conn.recv_frame().await.map_err(|err| Self::map_rpc(&err));
            let (header, body) = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    writer.abort().await;
                    return Err(err);
                }
            };
            let chunk: FileChunk =
                match Self::decode_expected(RespType::FileChunk, path, header, &body) {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        writer.abort().await;
                        return Err(err);
                    }
                };
            if let Err(err) = writer.write_chunk(&chunk.data).await {
                writer.abort().await;
                return Err(err);
            }
            timestamp = chunk.timestamp;
            eof = chunk.eof;
        }
        writer.commit().await?;
        Ok(CompareOutcome::Updated { timestamp })
    }

    /// Stream the cache file to the server as the close-flush.
    /// Returns the new authoritative timestamp.
    pub async fn close_flush(&self, path: &str, cache_path: &Path) -> SessionFsResult<i64> {
        let mut last_err = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.close_once(path, cache_path).await {
                Ok(timestamp) => return Ok(timestamp),
                Err(err) => {
                    debug!("Close-flush attempt {attempt} of {path} failed: {err}");
                    last_err = Some(err);
                }
            }
        }
        Err(SessionFsError::BackendUnavailable {
            context: vec![format!(
                "close-flush of {path} failed after {MAX_ATTEMPTS} attempts: {}",
                last_err.map_or_else(|| "unknown error".to_owned(), |e| e.to_string())
            )],
        })
    }

    /// One close-flush attempt: reopen the cache file and stream it
    /// from the beginning over a fresh connection.
    async fn close_once(&self, path: &str, cache_path: &Path) -> SessionFsResult<i64> {
        let mut file = File::open(cache_path).await?;
        let mut conn = self.connect().await?;
        let seq = conn.next_seq();

        let mut buf = vec![0_u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            let chunk = CloseChunk {
                path: path.to_owned(),
                client_id: self.client_id.clone(),
                data: buf.get(..n).unwrap_or(&[]).to_vec(),
                eof: n == 0,
            };
            let body = message::encode(&chunk).map_err(|err| Self::map_rpc(&err))?;
            conn.send_frame(seq, ReqType::CloseChunk.to_u8(), &body)
                .await
                .map_err(|err| Self::map_rpc(&err))?;
            if n == 0 {
                break;
            }
        }

        let (header, body) = conn.recv_frame().await.map_err(|err| Self::map_rpc(&err))?;
        let resp: CloseResponse = Self::decode_expected(RespType::CloseDone, path, header, &body)?;
        Ok(resp.timestamp)
    }

    /// Open the long-lived notification stream. The returned connection
    /// is ready to read `Notification` frames.
    pub async fn open_subscription(&self) -> SessionFsResult<Connection> {
        let mut conn = self.connect().await?;
        let seq = conn.next_seq();
        let req = SubscribeRequest {
            client_id: self.client_id.clone(),
        };
        let body = message::encode(&req).map_err(|err| Self::map_rpc(&err))?;
        conn.send_frame(seq, ReqType::Subscribe.to_u8(), &body)
            .await
            .map_err(|err| Self::map_rpc(&err))?;
        Ok(conn)
    }
}
