//! Wire formats shared by the gateway and the probe client
//!
//! Everything here is transport plumbing with no runtime state: the
//! reliable-UDP segment engine and its control datagrams, the TCP length
//! framing, the whitened proto-frame envelope, the keystream that whitens it,
//! the protobuf messages the gateway inspects, and the bus envelope used to
//! talk to workers.

pub mod byte_check;
pub mod enet;
pub mod envelope;
pub mod frame;
pub mod kcp;
pub mod keystream;
pub mod proto;
pub mod retcode;
pub mod stream;

pub use byte_check::ByteCheckMode;
pub use enet::EnetControl;
pub use envelope::Envelope;
pub use frame::{FrameError, ProtoFrame};
pub use kcp::{Kcp, KcpConfig, KcpError};
pub use keystream::{Keystream, SeedMode};
pub use retcode::{CloseReason, Retcode};

/// Milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
