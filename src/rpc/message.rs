use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::error::RpcError;

/// Chunk size for streamed file content.
pub const CHUNK_SIZE: usize = 4096;

/// The code a client must present when asking for the served root.
pub const ROOT_HANDSHAKE_CODE: &str = "sessionfs-root-v1";

/// Encode a message body with bincode.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>, RpcError> {
    bincode::serialize(msg).map_err(RpcError::from)
}

/// Decode a message body with bincode.
pub fn decode<T: DeserializeOwned>(buf: &[u8]) -> Result<T, RpcError> {
    bincode::deserialize(buf)
        .map_err(|e| RpcError::InvalidRequest(format!("Failed to decode message body: {e}")))
}

/// The request type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqType {
    /// Ask the server for its served root path.
    RequestRoot,
    /// Fetch a whole file, streamed back in chunks.
    Open,
    /// Validate a cached copy against the server timestamp.
    Compare,
    /// One chunk of a close-flush; repeated until `eof`.
    CloseChunk,
    /// Fetch the attributes of a path.
    Getattr,
    /// List a directory.
    Ls,
    /// Create a directory.
    Mkdir,
    /// Rename a file or directory.
    Rename,
    /// Remove a file or an empty directory.
    Unlink,
    /// Resize a file.
    Truncate,
    /// Diagnostics view of the registry.
    Status,
    /// Open the long-lived notification stream.
    Subscribe,
}

impl ReqType {
    /// Convert u8 to `ReqType`
    pub fn from_u8(op: u8) -> Result<Self, RpcError> {
        match op {
            0 => Ok(Self::RequestRoot),
            1 => Ok(Self::Open),
            2 => Ok(Self::Compare),
            3 => Ok(Self::CloseChunk),
            4 => Ok(Self::Getattr),
            5 => Ok(Self::Ls),
            6 => Ok(Self::Mkdir),
            7 => Ok(Self::Rename),
            8 => Ok(Self::Unlink),
            9 => Ok(Self::Truncate),
            10 => Ok(Self::Status),
            11 => Ok(Self::Subscribe),
            _ => Err(RpcError::InvalidRequest(format!(
                "Invalid request type: {op}"
            ))),
        }
    }

    /// Convert `ReqType` to u8
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::RequestRoot => 0,
            Self::Open => 1,
            Self::Compare => 2,
            Self::CloseChunk => 3,
            Self::Getattr => 4,
            Self::Ls => 5,
            Self::Mkdir => 6,
            Self::Rename => 7,
            Self::Unlink => 8,
            Self::Truncate => 9,
            Self::Status => 10,
            Self::Subscribe => 11,
        }
    }
}

/// The response type of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RespType {
    /// The served root path.
    Root,
    /// One chunk of streamed file content.
    FileChunk,
    /// The final answer of a close-flush.
    CloseDone,
    /// File attributes.
    Attr,
    /// Directory listing.
    DirList,
    /// Plain acknowledgement.
    Ack,
    /// Diagnostics response.
    Status,
    /// A pushed invalidation notification.
    Notification,
    /// The operation failed; body carries the status code.
    Error,
}

impl RespType {
    /// Convert u8 to `RespType`
    pub fn from_u8(op: u8) -> Result<Self, RpcError> {
        match op {
            0 => Ok(Self::Root),
            1 => Ok(Self::FileChunk),
            2 => Ok(Self::CloseDone),
            3 => Ok(Self::Attr),
            4 => Ok(Self::DirList),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Status),
            7 => Ok(Self::Notification),
            8 => Ok(Self::Error),
            _ => Err(RpcError::InvalidResponse(format!(
                "Invalid response type: {op}"
            ))),
        }
    }

    /// Convert `RespType` to u8
    #[must_use]
    pub fn to_u8(self) -> u8 {
        match self {
            Self::Root => 0,
            Self::FileChunk => 1,
            Self::CloseDone => 2,
            Self::Attr => 3,
            Self::DirList => 4,
            Self::Ack => 5,
            Self::Status => 6,
            Self::Notification => 7,
            Self::Error => 8,
        }
    }
}

/// The status code of an error response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusCode {
    /// The path does not exist.
    NotFound,
    /// The path already exists.
    AlreadyExists,
    /// The operation is forbidden.
    PermissionDenied,
    /// The request is malformed.
    InvalidArgument,
    /// The server met an internal error.
    Internal,
}

/// Request for the served root path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootRequest {
    /// The handshake code.
    pub code: String,
    /// The requesting client identifier.
    pub client_id: String,
}

/// The served root path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootResponse {
    /// The server-absolute root directory.
    pub root_path: String,
}

/// Request to fetch a whole file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRequest {
    /// The server-absolute path.
    pub path: String,
    /// The requesting client identifier.
    pub client_id: String,
}

/// One chunk of streamed file content, shared by `open` and `compare`.
///
/// For `compare`, a single chunk with `update == false` confirms the
/// cached copy; `update == true` chunks carry the newer content. The
/// last chunk of any stream has `eof == true`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    /// The authoritative server timestamp of the content.
    pub timestamp: i64,
    /// Whether the chunk carries replacement content.
    pub update: bool,
    /// Whether this is the final chunk of the stream.
    pub eof: bool,
    /// The raw bytes.
    pub data: Vec<u8>,
}

/// Request to validate a cached copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompareRequest {
    /// The server-absolute path.
    pub path: String,
    /// The timestamp the client recorded for its cached copy.
    pub client_timestamp: i64,
    /// The requesting client identifier.
    pub client_id: String,
}

/// One chunk of a close-flush, client-streamed until `eof`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseChunk {
    /// The server-absolute path.
    pub path: String,
    /// The flushing client identifier.
    pub client_id: String,
    /// The raw bytes.
    pub data: Vec<u8>,
    /// Whether this is the final chunk of the flush.
    pub eof: bool,
}

/// The final answer of a close-flush.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CloseResponse {
    /// The new authoritative timestamp of the flushed file.
    pub timestamp: i64,
}

/// Request for the attributes of a path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetattrRequest {
    /// The server-absolute path.
    pub path: String,
}

/// File attributes, timestamps in nanoseconds since the epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrResponse {
    /// Size in bytes.
    pub size: i64,
    /// File type and permission bits.
    pub mode: u32,
    /// Number of hard links.
    pub nlink: u64,
    /// Owner user id on the server.
    pub uid: u32,
    /// Owner group id on the server.
    pub gid: u32,
    /// Time of last access.
    pub atime: i64,
    /// Time of last modification.
    pub mtime: i64,
    /// Time of last status change.
    pub ctime: i64,
}

/// Request to list a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LsRequest {
    /// The server-absolute path.
    pub path: String,
}

/// The type tag of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// A directory.
    Directory,
    /// A regular file.
    RegularFile,
}

/// Directory listing, entry name to type tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirListResponse {
    /// The entries of the directory.
    pub entries: BTreeMap<String, EntryType>,
}

/// Request to create a directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MkdirRequest {
    /// The server-absolute path.
    pub path: String,
    /// The permission bits to apply.
    pub mode: u32,
}

/// Request to rename a file or directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRequest {
    /// The current server-absolute path.
    pub path: String,
    /// The new server-absolute path.
    pub new_path: String,
    /// The initiating client identifier.
    pub client_id: String,
}

/// Request to remove a file or an empty directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnlinkRequest {
    /// The server-absolute path.
    pub path: String,
    /// The initiating client identifier.
    pub client_id: String,
}

/// Request to resize a file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TruncateRequest {
    /// The server-absolute path.
    pub path: String,
    /// The new size in bytes.
    pub size: u64,
}

/// Plain acknowledgement.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AckResponse {}

/// Request for the diagnostics view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StatusRequest {}

/// Diagnostics view over the server registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    /// The identifiers of currently connected clients.
    pub connected_clients: Vec<String>,
    /// Paths currently held open, with the clients holding them.
    pub open_files: BTreeMap<String, Vec<String>>,
}

/// Request to open the notification stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    /// The subscribing client identifier.
    pub client_id: String,
}

/// The kind of a pushed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// The path was rewritten by another client's close-flush.
    Update,
    /// The path was removed.
    Delete,
    /// The path was renamed; `new_path` carries the destination.
    Rename,
}

/// A server-pushed invalidation event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    /// The kind of event.
    pub kind: NotificationKind,
    /// The path being invalidated.
    pub path: String,
    /// The destination path of a rename.
    pub new_path: Option<String>,
    /// The authoritative timestamp of the event.
    pub timestamp: i64,
}

/// The body of an error response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// The status code.
    pub code: StatusCode,
    /// A human-readable description.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_req_type_roundtrip() {
        for op in 0..12_u8 {
            let req = ReqType::from_u8(op).expect("op should be valid");
            assert_eq!(req.to_u8(), op);
        }
        assert!(ReqType::from_u8(200).is_err());
    }

    #[test]
    fn test_resp_type_roundtrip() {
        for op in 0..9_u8 {
            let resp = RespType::from_u8(op).expect("op should be valid");
            assert_eq!(resp.to_u8(), op);
        }
        assert!(RespType::from_u8(200).is_err());
    }

    #[test]
    fn test_body_roundtrip() {
        let notif = Notification {
            kind: NotificationKind::Rename,
            path: "/srv/a.txt".to_owned(),
            new_path: Some("/srv/b.txt".to_owned()),
            timestamp: 1_700_000_000_000_000_000,
        };
        let buf = encode(&notif).expect("notification should encode");
        let decoded: Notification = decode(&buf).expect("notification should decode");
        assert_eq!(decoded.kind, NotificationKind::Rename);
        assert_eq!(decoded.path, notif.path);
        assert_eq!(decoded.new_path, notif.new_path);
        assert_eq!(decoded.timestamp, notif.timestamp);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(decode::<AttrResponse>(&[1, 2, 3]).is_err());
    }
}
