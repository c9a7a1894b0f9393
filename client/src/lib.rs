//! # Probe Client
//!
//! A headless client for the edge gateway. It connects over TCP or reliable
//! UDP, performs the token handshake (plain or RSA seed exchange), sends the
//! login request and pings. Operators use the binary as a smoke test; the
//! workspace integration tests drive the library directly.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::{Credentials, GateClient};
//! use shared::{Keystream, SeedMode};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let dispatch = Keystream::derive(0x1F2E_3D4C_5B6A_7988, SeedMode::Normal);
//!     let mut client = GateClient::connect_tcp("127.0.0.1:22102".parse()?, dispatch).await?;
//!     let credentials = Credentials {
//!         account_uid: "alice".to_string(),
//!         account_token: "token".to_string(),
//!         ..Default::default()
//!     };
//!     let rsp = client.request_token(&credentials, None, Duration::from_secs(5)).await?;
//!     println!("uid {} retcode {}", rsp.uid, rsp.retcode);
//!     client.close().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod login;
pub mod network;

pub use error::ClientError;
pub use login::{Credentials, SeedKeys};
pub use network::GateClient;
