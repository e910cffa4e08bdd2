//! Fuzz target for batch input parsing.

#![no_main]

use libfuzzer_sys::fuzz_target;
use pm_core::batch::BatchInput;

fuzz_target!(|data: &str| {
    let _ = BatchInput::from_json(data);
});
