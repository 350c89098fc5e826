//! Raw `(type, length, payload)` framing, independent of what the payload
//! means.

use crate::error::ProtocolError;
use std::io::{self, Read, Write};

/// Size in bytes of the frame header: one `i32` type code, one `i32`
/// payload length, both little-endian.
pub const HEADER_SIZE: usize = 8;

/// A decoded frame: a message type code plus its raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_code: i32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(type_code: i32, payload: Vec<u8>) -> Self {
        Frame { type_code, payload }
    }

    /// Serializes the frame to its wire form.
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        bytes.extend_from_slice(&self.type_code.to_le_bytes());
        bytes.extend_from_slice(&(self.payload.len() as i32).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Attempts to decode one frame out of `buf`.
    ///
    /// Returns the frame and the number of bytes it consumed. Both
    /// `buf.len() < HEADER_SIZE` and a payload that isn't fully buffered
    /// yet are reported as [`ProtocolError::Incomplete`] — never a hard
    /// error — so a caller accumulating bytes from a stream can just
    /// keep reading and retry.
    pub fn decode(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
        if buf.len() < HEADER_SIZE {
            return Err(ProtocolError::Incomplete);
        }

        let type_code = i32::from_le_bytes(buf[0..4].try_into().unwrap());
        let length = i32::from_le_bytes(buf[4..8].try_into().unwrap());
        if length < 0 {
            return Err(ProtocolError::Invalid("negative frame length".into()));
        }
        let length = length as usize;

        if buf.len() < HEADER_SIZE + length {
            return Err(ProtocolError::Incomplete);
        }

        let payload = buf[HEADER_SIZE..HEADER_SIZE + length].to_vec();
        Ok((Frame::new(type_code, payload), HEADER_SIZE + length))
    }

    /// Blocking read of exactly one frame from `reader`. Used by the
    /// thread-per-connection server and client, where each connection
    /// has its own thread and can afford to block on I/O.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Frame> {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header)?;
        let type_code = i32::from_le_bytes(header[0..4].try_into().unwrap());
        let length = i32::from_le_bytes(header[4..8].try_into().unwrap());
        if length < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "negative frame length"));
        }
        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload)?;
        Ok(Frame::new(type_code, payload))
    }

    /// Blocking write of the frame to `writer`.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&self.encode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn encode_decode_round_trip() {
        let frame = Frame::new(20, b"50|mot1".to_vec());
        let bytes = frame.encode();
        let (decoded, consumed) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn empty_payload_round_trips() {
        let frame = Frame::new(30, Vec::new());
        let bytes = frame.encode();
        let (decoded, _) = Frame::decode(&bytes).unwrap();
        assert_eq!(decoded.payload, Vec::<u8>::new());
    }

    #[test]
    fn short_header_is_incomplete_not_an_error() {
        let buf = [0u8; 4];
        assert_eq!(Frame::decode(&buf), Err(ProtocolError::Incomplete));
    }

    #[test]
    fn truncated_payload_is_incomplete() {
        let frame = Frame::new(50, b"msgkey|some/path".to_vec());
        let mut bytes = frame.encode();
        bytes.truncate(bytes.len() - 2);
        assert_eq!(Frame::decode(&bytes), Err(ProtocolError::Incomplete));
    }

    #[test]
    fn read_from_blocks_until_full_frame_available() {
        let frame = Frame::new(22, b"50|mot1".to_vec());
        let bytes = frame.encode();
        let mut cursor = Cursor::new(bytes);
        let decoded = Frame::read_from(&mut cursor).unwrap();
        assert_eq!(decoded, frame);
    }
}
