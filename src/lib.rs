//! # Lobby Protocol
//!
//! Client-side implementation of an MMO lobby server protocol: packet
//! framing, the proprietary connection cipher, and the login handshake
//! state machine.
//!
//! ## Architecture
//! - **core**: packet and segment framing, IPC envelope
//! - **crypto**: Blowfish connection cipher with MD5 key derivation
//! - **transport**: TCP transport with an observer-based receive loop
//! - **protocol**: opcode payloads and the handshake runner
//! - **config**: TOML-backed configuration with validation
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use lobby_protocol::config::LobbyConfig;
//! use lobby_protocol::protocol::runner::LobbyRunner;
//! use lobby_protocol::protocol::session::LoginSession;
//! use lobby_protocol::transport::LobbyTransport;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> lobby_protocol::Result<()> {
//! let config = LobbyConfig::from_file("lobby.toml")?;
//! config.validate_strict()?;
//!
//! let session = LoginSession::new("0123456789abcdef0123456789abcdef", false, 5)?;
//! let transport = Arc::new(LobbyTransport::new());
//! transport
//!     .connect(&config.client.address, config.client.connection_timeout)
//!     .await?;
//!
//! let runner = LobbyRunner::new(
//!     Arc::clone(&transport),
//!     session,
//!     config.version.to_version_info(),
//!     &config.client,
//! );
//!
//! let cancel = CancellationToken::new();
//! let driver = {
//!     let runner = Arc::clone(&runner);
//!     let cancel = cancel.clone();
//!     tokio::spawn(async move { runner.run(cancel).await })
//! };
//!
//! runner.wait_logged_in().await?;
//! for character in runner.characters()? {
//!     let token = runner.get_travel_token(&character).await?;
//!     println!("{}: token {:#x}", character.name, token.token);
//! }
//!
//! cancel.cancel();
//! driver.await.map_err(|e| {
//!     lobby_protocol::ProtocolError::Decode(format!("driver task failed: {e}"))
//! })??;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod crypto;
pub mod error;
pub mod protocol;
pub mod transport;
pub mod utils;

pub use config::LobbyConfig;
pub use error::{ProtocolError, Result};
pub use protocol::runner::{DcTravelToken, LobbyRunner, Phase};
pub use protocol::session::{FileReport, LoginSession, VersionInfo};
pub use transport::LobbyTransport;
