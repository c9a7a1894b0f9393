//! # Edge Gateway
//!
//! The gateway terminates client connections and routes their traffic onto a
//! message bus. Game logic lives in worker processes elsewhere; the gateway
//! only knows how to authenticate a connection, bind it to a player uid and
//! move frames between the client and that player's workers.
//!
//! ## Connection lifecycle
//!
//! A client connects over reliable UDP (or length-prefixed TCP when enabled)
//! and sends `GetPlayerTokenReq` as its first frame. The handshake verifies
//! the credential, takes the per-account login lock, evicts any previous
//! session of the same uid anywhere in the fleet, picks game and path
//! workers and negotiates the session keystream. From then on the session
//! forwards `PlayerLoginReq` to its game worker and becomes active once the
//! worker accepts it.
//!
//! ## Modules
//!
//! - `transport`: UDP and TCP listeners producing one [`transport::Link`] per connection
//! - `session`: per-connection state machine with its receive and send tasks
//! - `router`: client frame routing and bus envelope handling
//! - `handshake`: the `GetPlayerTokenReq` pipeline
//! - `registry`: local session tables, fleet presence and kick waiters
//! - `control_plane`: discovery RPCs and the snapshots they feed
//! - `bus`, `identity`, `login_lock`, `accounts`: external collaborators
//! - `crypto`: RSA seed exchange and identity request signing
//! - `server`: startup, serving and graceful shutdown
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use gate::config::GateConfig;
//! use gate::context::GateServices;
//! use gate::server::GateServer;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GateConfig::loopback();
//!     let server = GateServer::new(config, GateServices::standalone()).await?;
//!     println!("Listening on {}", server.local_udp_addr());
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod accounts;
pub mod bus;
pub mod cmd_proxy;
pub mod config;
pub mod context;
pub mod control_plane;
pub mod crypto;
pub mod error;
pub mod handshake;
pub mod identity;
pub mod login_lock;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
pub mod transport;

pub use error::{GateError, HandshakeError};
pub use server::GateServer;
