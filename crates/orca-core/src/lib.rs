//! Orca Core - Shared types, protocols, and utilities
//!
//! This crate provides the fundamental building blocks for the Orca
//! peer-to-peer file sharing node: content addressing, key material,
//! chunk framing, the overlay wire format, and the RPC transport.

pub mod chunk;
pub mod error;
pub mod keys;
pub mod proto;
pub mod transport;
pub mod types;

pub use error::{Error, Result};
pub use keys::Keypair;
pub use transport::{ListenerGuard, MessageHandler, PeerAddress, TcpTransport, Transport};
pub use types::*;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Bodies larger than this are streamed in chunks of this size
pub const CHUNK_THRESHOLD: usize = 1024;
