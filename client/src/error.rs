use shared::{CloseReason, FrameError};
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("rsa error: {0}")]
    Rsa(#[from] rsa::Error),
    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid key file: {0}")]
    KeyFile(String),
    #[error("gate did not answer the connect request")]
    NoEstablish,
    #[error("timed out waiting for the gate")]
    Timeout,
    #[error("disconnected by the gate ({0:?})")]
    Disconnected(Option<CloseReason>),
    #[error("server seed signature does not verify")]
    BadSignature,
    #[error("server seed has {0} bytes")]
    BadSeedLength(usize),
}
