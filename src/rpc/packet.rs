use std::fmt::Debug;

use super::error::RpcError;

/// The size of a frame header on the wire.
pub const FRAME_HEADER_SIZE: u64 = 17;

/// The Encode trait is used to encode a message structure into a byte buffer.
pub trait Encode {
    /// Encode the message into a byte buffer.
    fn encode(&self) -> Vec<u8>;
}

/// The Decode trait is used to decode a byte buffer into a data structure.
pub trait Decode {
    /// Decode the byte buffer into a data structure.
    fn decode(buf: &[u8]) -> Result<Self, RpcError>
    where
        Self: Sized;
}

/// The header preceding every frame on the wire.
///
/// Both directions use the same layout. Response frames echo the
/// sequence number of the request they answer; streaming calls repeat
/// the sequence number across all frames of the stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// The sequence number of the frame.
    pub seq: u64,
    /// The operation type of the frame.
    pub op: u8,
    /// The length of the frame body.
    pub len: u64,
}

impl Encode for FrameHeader {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE as usize);
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.push(self.op);
        buf.extend_from_slice(&self.len.to_be_bytes());
        buf
    }
}

impl Decode for FrameHeader {
    fn decode(buf: &[u8]) -> Result<Self, RpcError> {
        if buf.len() < FRAME_HEADER_SIZE as usize {
            return Err(RpcError::InvalidRequest("Invalid frame header".to_owned()));
        }

        let seq = u64::from_be_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        let op = buf[8];
        let len = u64::from_be_bytes([
            buf[9], buf[10], buf[11], buf[12], buf[13], buf[14], buf[15], buf[16],
        ]);

        Ok(Self { seq, op, len })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_header_roundtrip() {
        let header = FrameHeader {
            seq: 42,
            op: 7,
            len: 4096,
        };
        let buf = header.encode();
        assert_eq!(buf.len() as u64, FRAME_HEADER_SIZE);
        let decoded = FrameHeader::decode(&buf).expect("header should decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_frame_header_too_short() {
        assert!(FrameHeader::decode(&[0_u8; 3]).is_err());
    }
}
