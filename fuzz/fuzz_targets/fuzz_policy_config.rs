//! Fuzz target for policy.json parsing and validation.
//!
//! Tests that building a PolicyStore from arbitrary input never panics,
//! only returns a configuration error.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pm_redact::PolicyStore;

fuzz_target!(|data: &str| {
    let _ = PolicyStore::from_json(data);
});
