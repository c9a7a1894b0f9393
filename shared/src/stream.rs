//! Length-prefixed framing for the TCP transport
//!
//! Each chunk is preceded by a big-endian `u32` length. Two lengths are
//! reserved: `0` asks the peer to echo, `0xFFFFFFFF` is the echo reply. Both
//! are used as RTT probes and never carry a body.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const ECHO_REQUEST: u32 = 0x0000_0000;
pub const ECHO_REPLY: u32 = 0xFFFF_FFFF;

/// Largest body accepted on a TCP connection (343 KiB)
pub const MAX_CHUNK_LEN: usize = 343 * 1024;

#[derive(Debug, PartialEq, Eq)]
pub enum Chunk {
    Data(Vec<u8>),
    EchoRequest,
    EchoReply,
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("chunk of {0} bytes exceeds limit")]
    TooLarge(usize),
}

impl FramingError {
    /// True when the peer closed the stream cleanly between chunks
    pub fn is_eof(&self) -> bool {
        matches!(self, FramingError::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

pub async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Chunk, FramingError> {
    let len = reader.read_u32().await?;
    match len {
        ECHO_REQUEST => Ok(Chunk::EchoRequest),
        ECHO_REPLY => Ok(Chunk::EchoReply),
        len => {
            let len = len as usize;
            if len > MAX_CHUNK_LEN {
                return Err(FramingError::TooLarge(len));
            }
            let mut body = vec![0u8; len];
            reader.read_exact(&mut body).await?;
            Ok(Chunk::Data(body))
        }
    }
}

pub async fn write_chunk<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> Result<(), FramingError> {
    if data.len() > MAX_CHUNK_LEN {
        return Err(FramingError::TooLarge(data.len()));
    }
    // An empty body would be read back as an echo request
    if data.is_empty() {
        return Ok(());
    }
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&(data.len() as u32).to_be_bytes());
    buf.extend_from_slice(data);
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_echo_request<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FramingError> {
    writer.write_all(&ECHO_REQUEST.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_echo_reply<W: AsyncWrite + Unpin>(writer: &mut W) -> Result<(), FramingError> {
    writer.write_all(&ECHO_REPLY.to_be_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
