use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::common::TimeoutOptions;
use super::error::RpcError;
use super::packet::{Decode, Encode, FrameHeader, FRAME_HEADER_SIZE};

/// Run one I/O step against a deadline, folding an elapsed deadline and
/// an I/O failure into the transport error.
async fn io_timeout<T>(
    duration: Duration,
    what: &str,
    fut: impl Future<Output = std::io::Result<T>>,
) -> Result<T, RpcError> {
    match timeout(duration, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(RpcError::InternalError(format!("{what}: {err}"))),
        Err(_) => Err(RpcError::Timeout(format!(
            "{what} did not finish within {duration:?}"
        ))),
    }
}

/// Write one frame to the given writer.
pub async fn write_frame_to<W>(
    writer: &mut W,
    header: FrameHeader,
    body: &[u8],
    write_timeout: Duration,
) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
{
    debug_assert_eq!(header.len as usize, body.len());
    let mut buf = header.encode();
    buf.extend_from_slice(body);
    io_timeout(write_timeout, "frame write", writer.write_all(&buf)).await
}

/// Read one frame from the given reader, blocking until it arrives.
///
/// Used on long-lived notification streams where silence is normal.
pub async fn read_frame_from<R>(
    reader: &mut R,
    buf: &mut BytesMut,
) -> Result<(FrameHeader, Bytes), RpcError>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0_u8; FRAME_HEADER_SIZE as usize];
    reader
        .read_exact(&mut header_buf)
        .await
        .map_err(|err| RpcError::InternalError(err.to_string()))?;
    let header = FrameHeader::decode(&header_buf)?;

    buf.resize(header.len as usize, 0);
    reader
        .read_exact(buf.as_mut())
        .await
        .map_err(|err| RpcError::InternalError(err.to_string()))?;
    Ok((header, buf.split().freeze()))
}

/// A framed connection over a TCP stream.
///
/// A connection carries one logical RPC at a time, so framing needs no
/// multiplexing; the sequence number ties response frames to their
/// request as a sanity check.
#[derive(Debug)]
pub struct Connection {
    /// The TCP stream for the connection.
    stream: TcpStream,
    /// Options for the timeout of the connection
    timeout_options: TimeoutOptions,
    /// Receive buffer, reused across frames to reduce allocation
    recv_buf: BytesMut,
    /// Auto increment sequence number, marks request and response pairs
    seq: u64,
}

impl Connection {
    /// Wrap an accepted or connected stream.
    #[must_use]
    pub fn new(stream: TcpStream, timeout_options: TimeoutOptions) -> Self {
        Self {
            stream,
            timeout_options,
            recv_buf: BytesMut::with_capacity(64 * 1024),
            seq: 0,
        }
    }

    /// Connect to the given address.
    pub async fn connect(addr: &str, timeout_options: TimeoutOptions) -> Result<Self, RpcError> {
        let stream = io_timeout(
            timeout_options.connect_timeout,
            &format!("connect to {addr}"),
            TcpStream::connect(addr),
        )
        .await?;
        Ok(Self::new(stream, timeout_options))
    }

    /// Get the next sequence number.
    pub fn next_seq(&mut self) -> u64 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    /// Send one frame.
    pub async fn send_frame(
        &mut self,
        seq: u64,
        op: u8,
        body: &[u8],
    ) -> Result<(), RpcError> {
        let header = FrameHeader {
            seq,
            op,
            len: body.len() as u64,
        };
        write_frame_to(
            &mut self.stream,
            header,
            body,
            self.timeout_options.write_timeout,
        )
        .await
    }

    /// Receive one frame within the read timeout.
    pub async fn recv_frame(&mut self) -> Result<(FrameHeader, Bytes), RpcError> {
        let read_timeout = self.timeout_options.read_timeout;
        let mut header_buf = [0_u8; FRAME_HEADER_SIZE as usize];
        io_timeout(
            read_timeout,
            "frame header read",
            self.stream.read_exact(&mut header_buf),
        )
        .await?;
        let header = FrameHeader::decode(&header_buf)?;

        self.recv_buf.resize(header.len as usize, 0);
        io_timeout(
            read_timeout,
            "frame body read",
            self.stream.read_exact(self.recv_buf.as_mut()),
        )
        .await?;
        Ok((header, self.recv_buf.split().freeze()))
    }

    /// Receive one frame, blocking until it arrives.
    ///
    /// Used where the peer is allowed to stay silent for a long time,
    /// like the server waiting for the next request on an idle
    /// connection.
    pub async fn recv_frame_wait(&mut self) -> Result<(FrameHeader, Bytes), RpcError> {
        read_frame_from(&mut self.stream, &mut self.recv_buf).await
    }

    /// The configured timeouts of this connection.
    #[must_use]
    pub fn timeout_options(&self) -> &TimeoutOptions {
        &self.timeout_options
    }

    /// Take the underlying stream, e.g. to split it for a long-lived
    /// subscription.
    #[must_use]
    pub fn into_stream(self) -> TcpStream {
        debug!("Connection handed over its stream");
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_frame_roundtrip_over_loopback() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local addr").to_string();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept should succeed");
            let mut conn = Connection::new(stream, TimeoutOptions::default());
            let (header, body) = conn.recv_frame().await.expect("frame should arrive");
            assert_eq!(header.op, 3);
            assert_eq!(&body[..], b"ping");
            conn.send_frame(header.seq, 4, b"pong")
                .await
                .expect("reply should send");
        });

        let mut conn = Connection::connect(&addr, TimeoutOptions::default())
            .await
            .expect("connect should succeed");
        let seq = conn.next_seq();
        conn.send_frame(seq, 3, b"ping")
            .await
            .expect("send should succeed");
        let (header, body) = conn.recv_frame().await.expect("reply should arrive");
        assert_eq!(header.seq, seq);
        assert_eq!(header.op, 4);
        assert_eq!(&body[..], b"pong");

        server.await.expect("server task should finish");
    }

    #[tokio::test]
    async fn test_recv_on_closed_peer_fails() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local addr").to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept should succeed");
            drop(stream);
        });

        let mut conn = Connection::connect(&addr, TimeoutOptions::default())
            .await
            .expect("connect should succeed");
        assert!(conn.recv_frame_wait().await.is_err());
    }

    #[tokio::test]
    async fn test_recv_frame_times_out_on_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind should succeed");
        let addr = listener.local_addr().expect("local addr").to_string();
        let server = tokio::spawn(async move {
            // Hold the connection open without sending anything.
            let (_stream, _) = listener.accept().await.expect("accept should succeed");
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let timeout_options = TimeoutOptions {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_millis(100),
            write_timeout: Duration::from_secs(1),
        };
        let mut conn = Connection::connect(&addr, timeout_options)
            .await
            .expect("connect should succeed");
        let err = conn
            .recv_frame()
            .await
            .expect_err("a silent peer must trip the read timeout");
        assert!(matches!(err, RpcError::Timeout(_)));
        server.abort();
    }
}
