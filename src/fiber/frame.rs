//! Frame encoding/decoding for the fiber multiplexer
//!
//! Frame format (all integers little-endian):
//! ```text
//! +-----------+-----------+-------+----------+--------+
//! | dest_port | src_port  | flags | reserved | length |
//! |  4 bytes  |  4 bytes  |  1 B  |   1 B    |  2 B   |
//! +-----------+-----------+-------+----------+--------+
//! |                    payload (length bytes)          |
//! +----------------------------------------------------+
//! ```

use super::FiberError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Frame header size in bytes
pub const FRAME_HEADER_SIZE: usize = 12;

/// Maximum payload size
pub const MAX_PAYLOAD_SIZE: usize = 65507;

/// Frame flag bits
pub mod flags {
    /// Connection request
    pub const SYN: u8 = 0b0000_0001;
    /// Acknowledgement; alone it carries a 4-byte credit delta
    pub const ACK: u8 = 0b0000_0010;
    /// End of write
    pub const FIN: u8 = 0b0000_0100;
    /// Abortive close
    pub const RST: u8 = 0b0000_1000;
    /// Payload bytes for the fiber
    pub const DATA: u8 = 0b0001_0000;
}

/// Size of a credit (`ACK`) payload
pub const CREDIT_PAYLOAD_SIZE: usize = 4;

/// A parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub dest_port: u32,
    pub src_port: u32,
    pub flags: u8,
    pub length: u16,
}

impl FrameHeader {
    /// Parse and validate a wire header. Unknown flag combinations and
    /// oversized lengths are protocol violations that fault the demux.
    pub fn parse(raw: &[u8; FRAME_HEADER_SIZE]) -> Result<Self, FiberError> {
        let header = Self {
            dest_port: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            src_port: u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]),
            flags: raw[8],
            length: u16::from_le_bytes([raw[10], raw[11]]),
        };

        match header.flags {
            f if f == flags::SYN => {}
            f if f == flags::SYN | flags::ACK => {}
            f if f == flags::ACK => {}
            f if f == flags::FIN => {}
            f if f == flags::RST => {}
            f if f == flags::DATA => {}
            f => {
                return Err(FiberError::InvalidFrame(format!(
                    "unknown flags combination: {:#010b}",
                    f
                )))
            }
        }

        if header.length as usize > MAX_PAYLOAD_SIZE {
            return Err(FiberError::InvalidFrame(format!(
                "length {} exceeds max payload",
                header.length
            )));
        }

        Ok(header)
    }

    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw[0..4].copy_from_slice(&self.dest_port.to_le_bytes());
        raw[4..8].copy_from_slice(&self.src_port.to_le_bytes());
        raw[8] = self.flags;
        raw[10..12].copy_from_slice(&self.length.to_le_bytes());
        raw
    }
}

/// A full frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dest_port: u32,
    pub src_port: u32,
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    fn control(dest_port: u32, src_port: u32, flags: u8) -> Self {
        Self {
            dest_port,
            src_port,
            flags,
            payload: Bytes::new(),
        }
    }

    /// Connection request
    pub fn syn(dest_port: u32, src_port: u32) -> Self {
        Self::control(dest_port, src_port, flags::SYN)
    }

    /// Connection accepted
    pub fn syn_ack(dest_port: u32, src_port: u32) -> Self {
        Self::control(dest_port, src_port, flags::SYN | flags::ACK)
    }

    /// End of write
    pub fn fin(dest_port: u32, src_port: u32) -> Self {
        Self::control(dest_port, src_port, flags::FIN)
    }

    /// Abortive close
    pub fn rst(dest_port: u32, src_port: u32) -> Self {
        Self::control(dest_port, src_port, flags::RST)
    }

    /// Flow control credit grant
    pub fn credit(dest_port: u32, src_port: u32, granted: u32) -> Self {
        Self {
            dest_port,
            src_port,
            flags: flags::ACK,
            payload: Bytes::copy_from_slice(&granted.to_le_bytes()),
        }
    }

    /// Payload bytes; `payload` must not exceed [`MAX_PAYLOAD_SIZE`]
    pub fn data(dest_port: u32, src_port: u32, payload: Bytes) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_SIZE);
        Self {
            dest_port,
            src_port,
            flags: flags::DATA,
            payload,
        }
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            dest_port: self.dest_port,
            src_port: self.src_port,
            flags: self.flags,
            length: self.payload.len() as u16,
        }
    }

    /// Append the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.payload);
    }

    /// Encode to a fresh buffer.
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one frame from `buf`, returning `None` if more bytes are
    /// needed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Self>, FiberError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut raw = [0u8; FRAME_HEADER_SIZE];
        raw.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let header = FrameHeader::parse(&raw)?;

        if buf.len() < FRAME_HEADER_SIZE + header.length as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(header.length as usize).freeze();

        Ok(Some(Self {
            dest_port: header.dest_port,
            src_port: header.src_port,
            flags: header.flags,
            payload,
        }))
    }
}
