//! Codec for encoding/decoding control commands

use crate::messages::Command;
use crate::{FRAME_HEADER_SIZE, MAX_FRAME_SIZE};
use bincode::Options;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Connection closed before a complete frame was read")]
    Closed,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control command codec
///
/// Format: [length: u32 big-endian][payload: bincode serialized Command]
///
/// The inherent `encode`/`decode` work on byte buffers. The type also implements
/// `tokio_util::codec::{Encoder, Decoder}` so a connection that carries nothing
/// but commands can be wrapped in `FramedRead`/`FramedWrite`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandCodec;

impl CommandCodec {
    /// Encode a command to a single self-delimiting frame
    pub fn encode(command: &Command) -> Result<Bytes, CodecError> {
        let payload = bincode_options()
            .serialize(command)
            .map_err(|e| CodecError::MalformedFrame(e.to_string()))?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }

        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.extend_from_slice(&payload);

        Ok(buf.freeze())
    }

    /// Decode a command from the front of `buf`
    ///
    /// Returns Ok(Some(command)) if a complete frame was consumed,
    /// Ok(None) if more data is needed (nothing is consumed),
    /// Err if the frame is malformed.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; FRAME_HEADER_SIZE];
        length_bytes.copy_from_slice(&buf[..FRAME_HEADER_SIZE]);
        let length = check_length(u32::from_be_bytes(length_bytes))?;

        if buf.len() < FRAME_HEADER_SIZE + length {
            buf.reserve(FRAME_HEADER_SIZE + length - buf.len());
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(length);

        decode_payload(&payload).map(Some)
    }
}

impl tokio_util::codec::Decoder for CommandCodec {
    type Item = Command;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        Self::decode(src)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Command>, CodecError> {
        match Self::decode(buf)? {
            Some(command) => Ok(Some(command)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Closed),
        }
    }
}

impl tokio_util::codec::Encoder<Command> for CommandCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), CodecError> {
        let frame = Self::encode(&item)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Read exactly one command frame from `reader`
///
/// Never reads past the end of the frame, so whatever follows the command on
/// the stream is left untouched for the next owner of the connection.
pub async fn read_command<R>(reader: &mut R) -> Result<Command, CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut header = [0u8; FRAME_HEADER_SIZE];
    read_exact_or_closed(reader, &mut header).await?;
    let length = check_length(u32::from_be_bytes(header))?;

    let mut payload = vec![0u8; length];
    read_exact_or_closed(reader, &mut payload).await?;

    decode_payload(&payload)
}

/// Write one command frame to `writer` and flush it
pub async fn write_command<W>(writer: &mut W, command: &Command) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let frame = CommandCodec::encode(command)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

fn check_length(length: u32) -> Result<usize, CodecError> {
    let length = length as usize;
    if length > MAX_FRAME_SIZE {
        return Err(CodecError::MalformedFrame(format!(
            "declared length {} exceeds maximum {}",
            length, MAX_FRAME_SIZE
        )));
    }
    Ok(length)
}

/// Fixed-width integers, and a payload must be exactly one command
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

fn decode_payload(payload: &[u8]) -> Result<Command, CodecError> {
    bincode_options()
        .deserialize(payload)
        .map_err(|e| CodecError::MalformedFrame(e.to_string()))
}

async fn read_exact_or_closed<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), CodecError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(CodecError::Closed),
        Err(e) => Err(CodecError::Io(e)),
    }
}
