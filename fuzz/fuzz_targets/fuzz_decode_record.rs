//! Fuzz target for event record decoding.
//!
//! Live payloads arrive from the bus unvalidated; decoding must never
//! panic, and whatever decodes must be storable.

#![no_main]

use event_replicator::record::{decode, store_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Should never panic
    let Ok(record) = decode(data) else {
        return;
    };

    assert_eq!(store_key(record.pos), record.pos.to_string());

    // Offsets can push the UTC time past year 9999, which has no
    // RFC 3339 form; only check round trips that re-decode at all.
    let json = record.to_json().expect("decoded record must serialize");
    if let Ok(again) = decode(json.as_bytes()) {
        assert_eq!(again, record);
    }
});
