//! Error types of the gateway
//!
//! [`GateError`] covers infrastructure failures: sockets, the bus, the
//! key-value store, HTTP and configuration. [`HandshakeError`] is the domain
//! failure of a login attempt; every variant maps onto exactly one retcode
//! that is sent back to the client in `GetPlayerTokenRsp`.

use crate::crypto::CryptoError;
use shared::Retcode;
use std::io;

#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("message bus error: {0}")]
    Bus(String),
    #[error("control plane error: {0}")]
    ControlPlane(String),
    #[error("key-value store error: {0}")]
    Kv(#[from] redis::RedisError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("frame error: {0}")]
    Frame(#[from] shared::FrameError),
    #[error("encoding error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Why a `GetPlayerTokenReq` was refused
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("identity service rejected the credential (retcode {0})")]
    AccountVerify(i32),
    #[error("identity service unavailable: {0}")]
    IdentityUnavailable(String),
    #[error("account {0} is already logging in")]
    AnotherLogin(String),
    #[error("account is forbidden until {end_time}")]
    BlackUid { end_time: u32 },
    #[error("server is stopped for maintenance")]
    StopServer,
    #[error("session cap reached")]
    MaxPlayer,
    #[error("previous session of uid {0} did not go offline in time")]
    KickTimeout(u32),
    #[error("no game worker available")]
    NoGameWorker,
    #[error("unknown key id {0}")]
    UnknownKeyId(u32),
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] GateError),
}

impl HandshakeError {
    pub fn retcode(&self) -> Retcode {
        match self {
            HandshakeError::AccountVerify(_) => Retcode::AccountVerifyError,
            HandshakeError::AnotherLogin(_) => Retcode::AnotherLogin,
            HandshakeError::BlackUid { .. } => Retcode::BlackUid,
            HandshakeError::StopServer => Retcode::StopServer,
            HandshakeError::MaxPlayer => Retcode::MaxPlayer,
            HandshakeError::IdentityUnavailable(_)
            | HandshakeError::KickTimeout(_)
            | HandshakeError::NoGameWorker
            | HandshakeError::UnknownKeyId(_)
            | HandshakeError::BadRequest(_)
            | HandshakeError::Internal(_) => Retcode::SvrError,
        }
    }
}

impl From<CryptoError> for HandshakeError {
    fn from(e: CryptoError) -> Self {
        HandshakeError::Internal(GateError::Crypto(e))
    }
}
