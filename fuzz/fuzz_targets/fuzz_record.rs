//! Fuzz testing for stored entry decoding and key fingerprinting.
//!
//! Whatever bytes sit under an `idempotency:` key, decoding must return a
//! value or an error and never panic. A decoded entry must re-encode to the
//! exact bytes it came from.
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_record -- -max_total_time=60
//! ```

#![no_main]

use gateway_admission::fingerprint::Fingerprint;
use gateway_admission::record::StoredEntry;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(entry) = StoredEntry::decode(data) {
        assert_eq!(entry.encode(), data);
    }

    if let Some(fingerprint) = Fingerprint::of_bytes(data) {
        assert_eq!(fingerprint.as_str().len(), 64);
        assert!(fingerprint.store_key().starts_with("idempotency:"));
    }
});
