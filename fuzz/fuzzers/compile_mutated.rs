//! Fuzz target for mutated compilation.
//!
//! Every input runs one fuzzing trial. Syntax, verifier and JIT errors are
//! ordinary outcomes; a `FuzzerError` means the harness corrupted its own
//! tables and is reported as a crash.

#![no_main]

use libfuzzer_sys::fuzz_target;

use opfuzz::{Fuzzer, FuzzerConfig};

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    // Same input, same mutations.
    let seed = data
        .iter()
        .fold(0u64, |acc, byte| acc.rotate_left(5) ^ u64::from(*byte));
    let mut fuzzer = match Fuzzer::new(FuzzerConfig::default().with_seed(seed)) {
        Ok(fuzzer) => fuzzer,
        Err(err) => panic!("default config rejected: {err}"),
    };
    if let Err(err) = fuzzer.fuzz(source) {
        panic!("fuzzer invariant violated: {err}");
    }
});
