//! HTTP wire types shared by the transfer server and client

use serde::{Deserialize, Serialize};

/// Hex SHA-256 digest of the body, signed by the server
pub const HEADER_MESSAGE: &str = "x-message";
/// Hex ed25519 signature over the digest bytes
pub const HEADER_SIGNATURE: &str = "x-signature";
/// Hex ed25519 verifying key of the signer
pub const HEADER_PUBLIC_KEY: &str = "x-publickey";
/// Present when the body is `<len>***<bytes>` framed
pub const HEADER_CHUNK_FRAMING: &str = "x-chunk-framing";

pub const ROUTE_REQUEST_FILE: &str = "/requestFile";
pub const ROUTE_STORE_FILE: &str = "/storeFile";
pub const ROUTE_QUOTE: &str = "/quote";
pub const ROUTE_SEND_TRANSACTION: &str = "/sendTransaction";

/// Body of `POST /storeFile/`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreFileRequest {
    pub filename: String,
    #[serde(with = "base64_bytes")]
    pub content: Vec<u8>,
}

/// Body of the `POST /sendTransaction` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionStatus {
    pub status: String,
}

pub const STATUS_ACCEPTED: &str = "accepted";
pub const STATUS_INVALID_SIGNATURE: &str = "invalid_signature";
pub const STATUS_MALFORMED: &str = "malformed";

/// Serde adapter storing bytes as standard base64 strings
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
