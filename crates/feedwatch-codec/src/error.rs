use thiserror::Error;

/// Errors returned by message codec operations.
#[derive(Debug, Error)]
pub enum CodecError {
    /// CBOR serialization failure.
    #[error("encode error: {0}")]
    Encode(String),
    /// CBOR deserialization failure.
    #[error("decode error: {0}")]
    Decode(String),
    /// Message-level schema validation failure.
    #[error("invalid message: {0}")]
    InvalidMsg(&'static str),
}
