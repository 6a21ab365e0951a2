//! Fuzz retry delay extraction from arbitrary trailing metadata.

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use spanner_protocol::{Code, Metadata, RETRY_INFO_KEY, ServiceError};

#[derive(Debug, Arbitrary)]
struct Input {
    code: i32,
    message: String,
    retry_info: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let code = Code::from_i32(input.code).unwrap_or(Code::Unknown);
    let mut metadata = Metadata::new();
    metadata.insert_bin(RETRY_INFO_KEY, input.retry_info);

    let err = ServiceError::new(code, input.message).with_metadata(metadata);
    let _ = err.retry_delay();
    let _ = err.is_session_not_found();
    let _ = spanner_client::is_retryable(&err);
});
