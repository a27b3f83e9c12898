/// This module contains the framed-TCP RPC transport shared by the file
/// server and its clients.
///
/// Every call is one exchange of frames over a connection: a 17-byte
/// header (sequence number, operation code, body length) followed by a
/// bincode-encoded body. Streaming calls repeat frames under the same
/// sequence number until a frame marked `eof`.

/// The common module contains the shared timeout options.
pub mod common;

/// The connection module owns framing over a TCP stream.
pub mod connection;

/// The error module contains the transport error type.
pub mod error;

/// The message module contains the data structures shared between the
/// client and server.
pub mod message;

/// The packet module contains the frame header encoding and decoding.
pub mod packet;

/// The server module contains the generic RPC server.
pub mod server;
