//! Fuzz `RetryInfo` decoding.
//!
//! Decoding must never panic, and a decoded delay must survive re-encoding.

#![no_main]

use libfuzzer_sys::fuzz_target;
use spanner_protocol::RetryInfo;

fuzz_target!(|data: &[u8]| {
    let Ok(info) = RetryInfo::decode(data) else {
        return;
    };

    let reencoded = RetryInfo::decode(&info.encode()).expect("re-encoded RetryInfo must decode");
    assert_eq!(reencoded, info);
});
