//! `google.rpc.RetryInfo` binary codec.
//!
//! ```text
//! RetryInfo { google.protobuf.Duration retry_delay = 1; }
//! ```
//!
//! The wire message is a `prost` type; callers see a [`std::time::Duration`].

use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use crate::error::ProtocolError;

/// Wire representation of `google.rpc.RetryInfo`.
#[derive(Clone, PartialEq, Message)]
struct RetryInfoMessage {
    #[prost(message, optional, tag = "1")]
    retry_delay: Option<prost_types::Duration>,
}

/// Server-suggested retry delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryInfo {
    /// Delay before the failed call should be retried.
    pub retry_delay: Option<Duration>,
}

impl RetryInfo {
    /// Decode a binary `RetryInfo` message.
    ///
    /// Negative durations are clamped to zero.
    pub fn decode(src: &[u8]) -> Result<Self, ProtocolError> {
        let message = RetryInfoMessage::decode(src)?;
        let retry_delay = message.retry_delay.map(to_std_duration).transpose()?;
        Ok(Self { retry_delay })
    }

    /// Encode to the binary representation placed in trailing metadata.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let message = RetryInfoMessage {
            retry_delay: self.retry_delay.map(|delay| prost_types::Duration {
                seconds: i64::try_from(delay.as_secs()).unwrap_or(i64::MAX),
                nanos: delay.subsec_nanos() as i32,
            }),
        };
        Bytes::from(message.encode_to_vec())
    }
}

fn to_std_duration(wire: prost_types::Duration) -> Result<Duration, ProtocolError> {
    let prost_types::Duration { seconds, nanos } = wire;

    if !(-999_999_999..=999_999_999).contains(&nanos) {
        return Err(ProtocolError::InvalidField {
            field: "nanos",
            value: i64::from(nanos),
        });
    }

    if seconds < 0 || (seconds == 0 && nanos < 0) {
        return Ok(Duration::ZERO);
    }

    Ok(Duration::from_secs(seconds as u64) + Duration::from_nanos(nanos.max(0) as u64))
}
