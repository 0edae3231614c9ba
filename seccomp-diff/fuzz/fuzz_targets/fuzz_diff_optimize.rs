#![no_main]
use libfuzzer_sys::fuzz_target;
use log2::*;
use seccomp_diff::diff::{DiffHarness, Side};
use seccomp_diff::error::DiffError;
use seccomp_diff::filters::{compile_profile, parse_profile, read_profile, Optimization};
use std::sync::{LazyLock, Mutex};

const BUNDLED_PROFILE: &str = include_str!("../../data/fuzz_profile.toml");

struct Target {
    harness: DiffHarness,
    _log2: log2::Handle,
}

// One harness per process; coverage accumulates across inputs and is logged
// whenever it grows.
static TARGET: LazyLock<Mutex<Target>> = LazyLock::new(|| {
    let _log2 = log2::stdout().level("info").start();
    let profile = match std::env::var("SECCOMP_DIFF_PROFILE") {
        Ok(path) => read_profile(&path),
        Err(_) => parse_profile(BUNDLED_PROFILE),
    }
    .expect("fuzz profile must load");
    let left = compile_profile(&profile, Optimization::Linear).expect("linear build");
    let right = compile_profile(&profile, Optimization::Tree).expect("tree build");
    Mutex::new(Target {
        harness: DiffHarness::new(left, right),
        _log2,
    })
});

fuzz_target!(|data: &[u8]| {
    let mut target = TARGET.lock().expect("harness lock");
    let harness = &mut target.harness;
    if let Err(DiffError::Mismatch(mismatch)) = harness.check_bytes(data) {
        panic!("optimization levels disagree: {}", mismatch);
    }
    if harness.coverage_grew() {
        let (left, right) = (harness.coverage(Side::Left), harness.coverage(Side::Right));
        info!(
            "#{} linear {}/{}, tree {}/{}",
            harness.executions(),
            left.covered(),
            left.len(),
            right.covered(),
            right.len()
        );
    }
});
