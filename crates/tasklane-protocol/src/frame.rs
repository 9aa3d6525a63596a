// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for supervisor command streams.
//!
//! A connection carries exactly one command. Both directions use the same frame:
//! - 4 bytes: payload length (big-endian)
//! - 2 bytes: message type (big-endian)
//! - N bytes: protobuf payload

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted payload. Job descriptors are small; this only bounds garbage input.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix plus message type.
pub const HEADER_SIZE: usize = 6;

/// Kind of frame on a command stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    /// Command from a caller
    Request = 1,
    /// Command succeeded
    Response = 2,
    /// Command failed; the body is the supervisor's message
    Error = 3,
}

impl TryFrom<u16> for MessageType {
    type Error = FrameError;

    fn try_from(tag: u16) -> Result<Self, FrameError> {
        [MessageType::Request, MessageType::Response, MessageType::Error]
            .into_iter()
            .find(|t| *t as u16 == tag)
            .ok_or(FrameError::InvalidMessageType(tag))
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    FrameTooLarge(usize),

    #[error("unknown message type tag {0}")]
    InvalidMessageType(u16),

    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload is not a valid message: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("stream ended before a frame header")]
    ConnectionClosed,
}

/// One typed message on a command stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn request<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Request, msg)
    }

    pub fn response<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Response, msg)
    }

    pub fn error<M: Message>(msg: &M) -> Result<Self, FrameError> {
        Self::new(MessageType::Error, msg)
    }

    pub fn new<M: Message>(message_type: MessageType, msg: &M) -> Result<Self, FrameError> {
        let payload = Bytes::from(msg.encode_to_vec());
        check_length(payload.len())?;
        Ok(Self {
            message_type,
            payload,
        })
    }

    /// Decode the payload as `M`.
    pub fn decode<M: Message + Default>(&self) -> Result<M, FrameError> {
        Ok(M::decode(self.payload.clone())?)
    }

    /// Header followed by payload, ready for the wire.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put_u16(self.message_type as u16);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

fn check_length(length: usize) -> Result<usize, FrameError> {
    if length > MAX_FRAME_SIZE {
        Err(FrameError::FrameTooLarge(length))
    } else {
        Ok(length)
    }
}

/// Split a header into payload length and message type.
fn parse_header(header: &[u8; HEADER_SIZE]) -> Result<(usize, MessageType), FrameError> {
    let [l0, l1, l2, l3, t0, t1] = *header;
    let message_type = MessageType::try_from(u16::from_be_bytes([t0, t1]))?;
    let length = check_length(u32::from_be_bytes([l0, l1, l2, l3]) as usize)?;
    Ok((length, message_type))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    writer.write_all(&frame.encode()).await?;
    Ok(())
}

/// Read one frame. A stream that ends before the header is
/// [`FrameError::ConnectionClosed`]; one that ends inside the payload is an
/// I/O error.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    if let Err(e) = reader.read_exact(&mut header).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => FrameError::ConnectionClosed,
            _ => e.into(),
        });
    }

    let (length, message_type) = parse_header(&header)?;
    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        message_type,
        payload: payload.into(),
    })
}
