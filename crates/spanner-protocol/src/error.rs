//! Protocol-level error types.

use thiserror::Error;

/// Errors that can occur while decoding binary payloads carried in
/// trailing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Payload is not a valid protobuf message.
    #[error("protobuf decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    /// Invalid field value in a decoded structure.
    #[error("invalid {field} value: {value}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Invalid value.
        value: i64,
    },
}
