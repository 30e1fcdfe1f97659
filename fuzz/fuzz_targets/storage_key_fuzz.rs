//! Fuzz test for backend key decoding
//!
//! Run with: cargo +nightly fuzz run storage_key_fuzz -- -max_total_time=60

#![no_main]

use depcache_storage::StorageKey;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Some(key) = StorageKey::decode(input) {
            // Decoding is lossless for anything it accepts.
            assert_eq!(key.encode(), input);
            assert!(!key.prefix().is_empty());
        }
    }
});
