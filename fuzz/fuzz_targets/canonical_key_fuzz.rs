//! Fuzz test for canonical dependency key parsing
//!
//! Index records hold canonical keys, so a damaged record reaches
//! `DependencyId::from_canonical_key`. Arbitrary input must either fail with
//! an error or parse to an id whose encoding parses back to the same id.
//!
//! Run with: cargo +nightly fuzz run canonical_key_fuzz -- -max_total_time=60

#![no_main]

use depcache_core::DependencyId;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(input) = std::str::from_utf8(data) {
        if let Ok(id) = DependencyId::from_canonical_key(input) {
            let encoded = id.canonical_key();
            let reparsed = DependencyId::from_canonical_key(&encoded)
                .expect("canonical encoding must parse");
            assert_eq!(reparsed, id);
            assert_eq!(reparsed.canonical_key(), encoded);
        }
    }
});
