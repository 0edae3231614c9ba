use seccomp_diff::actions::{Action, Verdict};
use seccomp_diff::diff::DiffHarness;
use seccomp_diff::exec::{instrumented_exec, SeccompData};
use seccomp_diff::filters::{
    compile_profile, normalized, parse_profile, Optimization, AUDIT_ARCH_X86_64,
};
use seccomp_diff::options::SeedOptions;
use seccomp_diff::seeds::{generate_for_profile, seed_arches};

const PROFILE: &str = include_str!("../data/fuzz_profile.toml");

// ===========================================================================
// Helper Functions
// ===========================================================================

fn seeds() -> Vec<SeccompData> {
    let profile = parse_profile(PROFILE).unwrap();
    let options = SeedOptions {
        arches: seed_arches(&profile.architectures),
        max_nr: 330,
    };
    generate_for_profile(&profile, &options)
}

// ===========================================================================
// Differential Tests
// ===========================================================================

#[cfg(target_arch = "x86_64")]
#[test]
fn test_optimization_levels_agree_on_seeds() {
    let profile = parse_profile(PROFILE).unwrap();
    let left = compile_profile(&profile, Optimization::Linear).unwrap();
    let right = compile_profile(&profile, Optimization::Tree).unwrap();

    let mut harness = DiffHarness::new(left, right);
    assert_eq!(harness.run_all(&seeds()), 0);
    let report = harness.finish(false).unwrap();
    assert!(report.is_clean());
    assert!(report.left.covered > 0 && report.right.covered > 0);
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_normalized_profile_agrees_on_seeds() {
    let profile = parse_profile(PROFILE).unwrap();
    let left = compile_profile(&profile, Optimization::Linear).unwrap();
    let right = compile_profile(&normalized(&profile), Optimization::Linear).unwrap();

    let mut harness = DiffHarness::new(left, right);
    assert_eq!(harness.run_all(&seeds()), 0);
    assert!(harness.finish(false).unwrap().is_clean());
}

#[cfg(target_arch = "x86_64")]
#[test]
fn test_compiled_profile_verdicts() {
    let profile = parse_profile(PROFILE).unwrap();
    let program = compile_profile(&profile, Optimization::Linear).unwrap();
    let run = |nr: i64, args: [u64; 6]| {
        let data = SeccompData::from_fields(nr as i32, AUDIT_ARCH_X86_64, 0, args);
        Verdict(instrumented_exec(&program, &data).ret)
    };

    assert_eq!(run(nix::libc::SYS_getpid, [0; 6]).action(), Action::Allow);
    assert_eq!(
        run(nix::libc::SYS_execve, [0; 6]),
        Verdict::new(Action::Errno, 1)
    );
    assert_eq!(
        run(nix::libc::SYS_socket, [16, 0, 0, 0, 0, 0]),
        Verdict::new(Action::Errno, 97)
    );
    assert_eq!(run(nix::libc::SYS_socket, [2, 0, 0, 0, 0, 0]).action(), Action::Allow);
    // Flags masked with 0b11 must equal O_WRONLY.
    assert_eq!(
        run(nix::libc::SYS_openat, [0, 0, 0o1, 0, 0, 0]),
        Verdict::new(Action::Errno, 13)
    );
    assert_eq!(
        run(nix::libc::SYS_openat, [0, 0, 0o2, 0, 0, 0]).action(),
        Action::Allow
    );
    assert_eq!(
        run(nix::libc::SYS_kill, [1, 0x1_0000_0000, 0, 0, 0, 0]).action(),
        Action::KillProcess
    );
    assert_eq!(run(nix::libc::SYS_kill, [1, 9, 0, 0, 0, 0]).action(), Action::Allow);
}
