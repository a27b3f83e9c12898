use thiserror::Error;

/// Error types for the RPC server and client transport
#[derive(Debug, Error)]
pub enum RpcError {
    /// The request is invalid.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// The response is invalid.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    /// The server/client meet an internal error.
    #[error("Internal error: {0}")]
    InternalError(String),
    /// The operation did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),
}

impl From<std::io::Error> for RpcError {
    fn from(err: std::io::Error) -> Self {
        Self::InternalError(err.to_string())
    }
}

impl From<bincode::Error> for RpcError {
    fn from(err: bincode::Error) -> Self {
        Self::InternalError(err.to_string())
    }
}
