use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::task;
use tracing::{debug, info};

use super::common::TimeoutOptions;
use super::connection::Connection;
use super::error::RpcError;
use super::packet::FrameHeader;

/// Trait implemented by the service dispatching decoded request frames.
///
/// The dispatcher receives ownership of the connection so that it can
/// stream further frames in either direction. It returns the connection
/// when the call is complete, or `None` when it consumed the connection
/// (a long-lived subscription, or a stream the dispatcher chose to
/// close).
#[async_trait]
pub trait RpcDispatcher: Send + Sync + 'static {
    /// Handle one request frame.
    async fn dispatch(
        &self,
        header: FrameHeader,
        body: Bytes,
        conn: Connection,
    ) -> Result<Option<Connection>, RpcError>;
}

/// The RPC server definition.
#[derive(Debug)]
pub struct RpcServer<T>
where
    T: RpcDispatcher,
{
    /// Options for the timeout of server connections
    timeout_options: TimeoutOptions,
    /// Main worker task running the accept loop
    main_worker: Option<task::JoinHandle<()>>,
    /// The dispatcher shared by all connections
    dispatcher: Arc<T>,
    /// The bound address, available after `listen`
    local_addr: Option<SocketAddr>,
}

impl<T> RpcServer<T>
where
    T: RpcDispatcher,
{
    /// Create a new RPC server.
    pub fn new(timeout_options: TimeoutOptions, dispatcher: Arc<T>) -> Self {
        Self {
            timeout_options,
            main_worker: None,
            dispatcher,
            local_addr: None,
        }
    }

    /// Start listening on the given address.
    ///
    /// Each accepted connection runs on its own task, reading one
    /// request frame at a time and handing it to the dispatcher.
    pub async fn listen(&mut self, addr: &str) -> Result<(), RpcError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|err| RpcError::InternalError(format!("Failed to bind {addr}: {err}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| RpcError::InternalError(err.to_string()))?;
        self.local_addr = Some(local_addr);
        info!("listening on {local_addr}");

        let timeout_options = self.timeout_options.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let handle = task::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {peer}");
                        let conn = Connection::new(stream, timeout_options.clone());
                        let dispatcher = Arc::clone(&dispatcher);
                        task::spawn(async move {
                            Self::serve_connection(dispatcher, conn).await;
                        });
                    }
                    Err(err) => {
                        debug!("Failed to accept connection: {err}");
                        continue;
                    }
                }
            }
        });

        self.main_worker = Some(handle);
        Ok(())
    }

    /// The bound address, once `listen` has succeeded.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Serve a single connection until the peer goes away or the
    /// dispatcher consumes it.
    async fn serve_connection(dispatcher: Arc<T>, mut conn: Connection) {
        loop {
            let (header, body) = match conn.recv_frame_wait().await {
                Ok(frame) => frame,
                Err(err) => {
                    // EOF here is the normal end of a client connection.
                    debug!("Connection closed: {err}");
                    return;
                }
            };
            match dispatcher.dispatch(header, body, conn).await {
                Ok(Some(returned)) => conn = returned,
                Ok(None) => return,
                Err(err) => {
                    debug!("Dispatch failed, dropping connection: {err}");
                    return;
                }
            }
        }
    }

    /// Stop accepting new connections.
    ///
    /// Established connections drain on their own; their tasks exit when
    /// the peers disconnect.
    pub async fn stop(&mut self) {
        if let Some(handle) = self.main_worker.take() {
            handle.abort();
        }
    }
}
