//! Fuzz database path parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use spanner_client::DatabaseId;

fuzz_target!(|data: &[u8]| {
    let Ok(path) = std::str::from_utf8(data) else {
        return;
    };

    if let Ok(id) = DatabaseId::parse(path) {
        let round_trip = DatabaseId::parse(&id.to_string()).expect("formatted path must parse");
        assert_eq!(round_trip, id);
    }
});
