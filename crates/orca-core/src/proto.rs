//! Protocol buffer message definitions for overlay RPCs
//!
//! These are manually defined to match the orca.proto schema,
//! avoiding the need for protoc at build time.

use crate::{Error, Result, PROTOCOL_VERSION};
use prost::Message;

/// Message envelope wrapping all protocol messages
#[derive(Clone, PartialEq, Message)]
pub struct Envelope {
    /// Protocol version
    #[prost(uint32, tag = "1")]
    pub version: u32,
    /// Request ID for correlation
    #[prost(uint64, tag = "2")]
    pub request_id: u64,
    /// The node that sent this message, so the receiver can learn about it
    #[prost(message, optional, tag = "3")]
    pub sender: Option<NodeInfo>,
    /// The actual message payload
    #[prost(oneof = "Payload", tags = "40, 41, 42, 43, 44, 45, 46, 47, 100")]
    pub payload: Option<Payload>,
}

/// Payload variants for the envelope
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum Payload {
    #[prost(message, tag = "40")]
    FindNodeRequest(FindNodeRequest),
    #[prost(message, tag = "41")]
    FindNodeResponse(FindNodeResponse),
    #[prost(message, tag = "42")]
    FindValueRequest(FindValueRequest),
    #[prost(message, tag = "43")]
    FindValueResponse(FindValueResponse),
    #[prost(message, tag = "44")]
    StoreRequest(StoreRequest),
    #[prost(message, tag = "45")]
    StoreResponse(StoreResponse),
    #[prost(message, tag = "46")]
    PingRequest(PingRequest),
    #[prost(message, tag = "47")]
    PingResponse(PingResponse),
    #[prost(message, tag = "100")]
    ErrorResponse(ErrorResponse),
}

#[derive(Clone, PartialEq, Message)]
pub struct NodeInfo {
    #[prost(bytes, tag = "1")]
    pub node_id: Vec<u8>,
    #[prost(string, tag = "2")]
    pub address: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindNodeRequest {
    #[prost(bytes, tag = "1")]
    pub target_id: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindNodeResponse {
    #[prost(message, repeated, tag = "1")]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindValueRequest {
    /// Namespaced record key
    #[prost(string, tag = "1")]
    pub key: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct FindValueResponse {
    #[prost(string, repeated, tag = "1")]
    pub values: Vec<String>,
    #[prost(message, repeated, tag = "2")]
    pub nodes: Vec<NodeInfo>,
}

#[derive(Clone, PartialEq, Message)]
pub struct StoreRequest {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct StoreResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub error: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct PingResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorResponse {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Envelope {
    /// Create a new envelope with the current protocol version
    pub fn new(request_id: u64, sender: Option<NodeInfo>, payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION as u32,
            request_id,
            sender,
            payload: Some(payload),
        }
    }

    /// Encode the envelope to bytes
    pub fn to_bytes(&self) -> Vec<u8> {
        self.encode_to_vec()
    }

    /// Decode an envelope from bytes, checking version compatibility
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        let envelope = Self::decode(buf)?;

        if envelope.version != PROTOCOL_VERSION as u32 {
            return Err(Error::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: envelope.version,
            });
        }

        Ok(envelope)
    }
}

/// Error codes
pub mod error_codes {
    // Protocol errors (1xx)
    pub const VERSION_MISMATCH: u32 = 100;
    pub const INVALID_MESSAGE: u32 = 101;

    // Validation errors (3xx)
    pub const INVALID_DATA: u32 = 301;
}

pub fn error_response(request_id: u64, sender: Option<NodeInfo>, code: u32, message: String) -> Envelope {
    Envelope::new(
        request_id,
        sender,
        Payload::ErrorResponse(ErrorResponse { code, message }),
    )
}
