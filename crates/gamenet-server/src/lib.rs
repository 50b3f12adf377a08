//! Authoritative UDP game server: connect-token handshake, per-client AEAD
//! channels, and a reliable-ordered plus best-effort-unordered channel pair
//! built on [`gamenet_proto`]'s sans-IO fragmentation and ack engine.
//!
//! [`Server`](crate::server::Server) owns the socket and the handshake state
//! machine; each admitted peer becomes its own
//! [`ClientInstance`](crate::client::ClientInstance) running an independent
//! tick loop, the same split the teacher draws between a WebTransport
//! server's endpoint and its per-session backend.

#![warn(missing_docs)]

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod replay;
pub mod server;
pub mod token;
pub mod wire;

pub use client::{ClientHandles, ClientInstance};
pub use config::ServerConfig;
pub use error::Error;
pub use server::{Connection, Server};
pub use token::{ChallengeToken, ConnectToken, TokenError};
