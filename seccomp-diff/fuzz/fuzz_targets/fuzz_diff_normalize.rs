#![no_main]
use libfuzzer_sys::fuzz_target;
use log2::*;
use seccomp_diff::diff::{DiffHarness, Side};
use seccomp_diff::error::DiffError;
use seccomp_diff::exec::SeccompData;
use seccomp_diff::filters::{compile_profile, normalized, parse_profile, read_profile, Optimization};
use std::sync::{LazyLock, Mutex};

const BUNDLED_PROFILE: &str = include_str!("../../data/fuzz_profile.toml");

struct Target {
    harness: DiffHarness,
    _log2: log2::Handle,
}

static TARGET: LazyLock<Mutex<Target>> = LazyLock::new(|| {
    let _log2 = log2::stdout().level("info").start();
    let profile = match std::env::var("SECCOMP_DIFF_PROFILE") {
        Ok(path) => read_profile(&path),
        Err(_) => parse_profile(BUNDLED_PROFILE),
    }
    .expect("fuzz profile must load");
    let left = compile_profile(&profile, Optimization::Linear).expect("profile build");
    let right =
        compile_profile(&normalized(&profile), Optimization::Linear).expect("normalized build");
    Mutex::new(Target {
        harness: DiffHarness::new(left, right),
        _log2,
    })
});

// Structured input: libFuzzer mutates the fields instead of raw bytes.
fuzz_target!(|data: SeccompData| {
    let mut target = TARGET.lock().expect("harness lock");
    let harness = &mut target.harness;
    if let Err(DiffError::Mismatch(mismatch)) = harness.check(&data) {
        panic!("normalized profile disagrees: {}", mismatch);
    }
    if harness.coverage_grew() {
        let (left, right) = (harness.coverage(Side::Left), harness.coverage(Side::Right));
        info!(
            "#{} profile {}/{}, normalized {}/{}",
            harness.executions(),
            left.covered(),
            left.len(),
            right.covered(),
            right.len()
        );
    }
});
