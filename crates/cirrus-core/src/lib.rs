//! # Cirrus Core
//!
//! Session layer of the Cirrus peer-to-peer file synchronization protocol.
//!
//! This crate provides:
//! - Message type registry and wire codec
//! - Typed, validated message variants
//! - Per-connection session state machine
//! - Connection registry with share snapshots
//! - Configuration and logging setup
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Server                                  │
//! │   (shares by id, live connections by id)                        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Session                                 │
//! │   (greeting, starttls, keys, manifest, transfers)               │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Messages                                │
//! │   (self-describing JSON units with signed/payload markers)      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Sockets, TLS and share storage are collaborators behind the
//! [`Transport`] and [`ShareStore`] traits.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod message;
pub mod server;
pub mod session;
pub mod share;

pub use config::{Config, LoggingConfig, ProtocolConfig, ShareConfig};
pub use error::{ConfigError, Error, MessageError, RegistryError, SessionError};
pub use message::{Body, Message, MessageType, Variant};
pub use server::{Connection, Server, Transport};
pub use session::{Negotiated, PeerInfo, Role, Session, SessionState, SessionStats};
pub use share::{MemoryStore, Share, ShareSnapshot, ShareStore};

/// Highest protocol version implemented
pub const PROTOCOL_VERSION: u32 = 1;

/// Feature announcing that the sender will not upgrade the transport
pub const FEATURE_PLAINTEXT: &str = "plaintext";
