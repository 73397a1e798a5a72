//! Fuzz harness for the canonical JSON renderer and the key wire-shape
//! gate.
//!
//! Arbitrary bytes are fed through `canonicalize_json` and
//! `validate_public_key`; both must reject garbage with errors, never
//! panic. When canonicalization succeeds, the output must be a fixed point
//! of a second pass.

#![no_main]
use auth54_core::{canonicalize_json, validate_public_key};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let _ = validate_public_key(text);
    if let Ok(canonical) = canonicalize_json(text) {
        let again = canonicalize_json(&canonical).expect("canonical output must re-canonicalize");
        assert_eq!(canonical, again);
    }
});
