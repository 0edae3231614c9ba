//! Seed corpus generation.
//!
//! Seeds cover every syscall number of every architecture of interest with
//! argument values sitting on 32-bit and 64-bit boundaries, which is where
//! the high/low word comparisons emitted by rule compilers tend to diverge.

use libseccomp::{ScmpArch, ScmpSyscall};
use log2::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::DiffError;
use crate::exec::{SeccompData, SECCOMP_DATA_SIZE};
use crate::filters::{arch_audit_value, OciSeccomp, AUDIT_ARCH_AARCH64, AUDIT_ARCH_I386};
use crate::options::SeedOptions;

/// Highest syscall number enumerated by default. Above every table in use today.
pub const DEFAULT_MAX_NR: i32 = 511;

/// Bit 30 of `nr` selects the x32 ABI on x86_64.
pub const X32_SYSCALL_BIT: i32 = 0x4000_0000;

pub fn arg_patterns() -> [u64; 9] {
    [
        0,
        1,
        0x7fff_ffff,
        0x8000_0000,
        0xffff_ffff,
        0x1_0000_0000,
        0xffff_ffff_0000_0000,
        0x8000_0000_0000_0000,
        u64::MAX,
    ]
}

/// Audit values for the given architectures plus one foreign architecture.
pub fn seed_arches(architectures: &[String]) -> Vec<u32> {
    let mut arches: Vec<u32> = Vec::new();
    for name in architectures {
        match arch_audit_value(name) {
            Some(value) if !arches.contains(&value) => arches.push(value),
            Some(_) => {}
            None => warn!("No audit value known for {}, not seeding it", name),
        }
    }

    let foreign = if arches.contains(&AUDIT_ARCH_I386) {
        AUDIT_ARCH_AARCH64
    } else {
        AUDIT_ARCH_I386
    };
    if !arches.contains(&foreign) {
        arches.push(foreign);
    }
    arches
}

fn syscall_numbers(max_nr: i32) -> impl Iterator<Item = i32> {
    (0..=max_nr).chain([-1, X32_SYSCALL_BIT, X32_SYSCALL_BIT | 1])
}

/// Structural seeds: every syscall number, every boundary pattern, both on
/// all arguments at once and on each argument alone.
pub fn generate(options: &SeedOptions) -> Vec<SeccompData> {
    let mut seeds = BTreeSet::new();
    let patterns = arg_patterns();

    for &arch in &options.arches {
        for nr in syscall_numbers(options.max_nr) {
            for &pattern in &patterns {
                seeds.insert(SeccompData::from_fields(nr, arch, 0, [pattern; 6]));
                for index in 0..6 {
                    let mut args = [0u64; 6];
                    args[index] = pattern;
                    seeds.insert(SeccompData::from_fields(nr, arch, 0, args));
                }
            }
        }
    }

    debug!("Generated {} structural seeds", seeds.len());
    seeds.into_iter().collect()
}

/// Argument value of interest for one syscall taken from a profile condition.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ProfileValue {
    pub syscall: String,
    pub index: u8,
    pub value: u64,
}

/// Values right on and around every condition of the profile.
pub fn profile_values(profile: &OciSeccomp) -> Vec<ProfileValue> {
    let mut values = BTreeSet::new();
    for rule in profile.syscalls.iter().flatten() {
        for cond in &rule.conditions {
            let mut candidates = vec![
                cond.value,
                cond.value.wrapping_add(1),
                cond.value.wrapping_sub(1),
            ];
            if let Some(two) = cond.value_two {
                candidates.extend([two, two ^ cond.value, cond.value & two]);
            }
            for name in &rule.names {
                for &value in &candidates {
                    values.insert(ProfileValue {
                        syscall: name.clone(),
                        index: cond.index,
                        value,
                    });
                }
            }
        }
    }
    values.into_iter().collect()
}

fn resolve_nr(name: &str, arch_name: &str) -> Option<i32> {
    let arch = ScmpArch::from_str(arch_name).ok()?;
    ScmpSyscall::from_name_by_arch(name, arch)
        .ok()
        .map(i32::from)
        .filter(|nr| *nr >= 0)
}

/// [`generate`] plus records that place each profile value in the argument
/// its condition tests.
pub fn generate_for_profile(profile: &OciSeccomp, options: &SeedOptions) -> Vec<SeccompData> {
    let mut seeds: BTreeSet<SeccompData> = generate(options).into_iter().collect();
    let structural = seeds.len();

    for value in profile_values(profile) {
        for arch_name in &profile.architectures {
            let (Some(arch), Some(nr)) = (
                arch_audit_value(arch_name),
                resolve_nr(&value.syscall, arch_name),
            ) else {
                continue;
            };
            let index = usize::from(value.index.min(5));
            let mut args = [0u64; 6];
            args[index] = value.value;
            seeds.insert(SeccompData::from_fields(nr, arch, 0, args));
            let mut args = [u64::MAX; 6];
            args[index] = value.value;
            seeds.insert(SeccompData::from_fields(nr, arch, 0, args));
        }
    }

    debug!(
        "Added {} seeds from profile conditions",
        seeds.len() - structural
    );
    seeds.into_iter().collect()
}

// ============================================================================
// Corpus files
// ============================================================================

/// Write one file per seed. Existing files with the same name are replaced.
pub fn write_corpus(dir: &Path, seeds: &[SeccompData]) -> Result<usize, DiffError> {
    fs::create_dir_all(dir)?;
    let width = seeds.len().to_string().len();
    for (i, seed) in seeds.iter().enumerate() {
        let path = dir.join(format!("seed-{:0width$}", i, width = width));
        fs::write(&path, seed.to_bytes())?;
    }
    info!("Wrote {} seeds to {}", seeds.len(), dir.display());
    Ok(seeds.len())
}

/// Read every regular file of `dir` as a record, in file name order.
pub fn read_corpus(dir: &Path) -> Result<Vec<SeccompData>, DiffError> {
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut inputs = Vec::with_capacity(paths.len());
    for path in paths {
        let bytes = fs::read(&path)?;
        if bytes.len() != SECCOMP_DATA_SIZE {
            debug!(
                "{}: {} bytes, reading as a fuzzer input",
                path.display(),
                bytes.len()
            );
        }
        inputs.push(SeccompData::from_bytes(&bytes));
    }

    debug!("Read {} inputs from {}", inputs.len(), dir.display());
    Ok(inputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Action;
    use crate::filters::{OciSyscall, OciSyscallCondition, AUDIT_ARCH_X86_64};

    fn options(max_nr: i32) -> SeedOptions {
        SeedOptions {
            arches: vec![AUDIT_ARCH_X86_64],
            max_nr,
        }
    }

    fn profile_with_condition() -> OciSeccomp {
        OciSeccomp {
            default_action: Action::Allow,
            default_errno_ret: None,
            architectures: vec!["SCMP_ARCH_X86_64".to_string()],
            syscalls: Some(vec![OciSyscall {
                names: vec!["openat".to_string()],
                action: Action::Errno,
                errno_ret: Some(13),
                conditions: vec![OciSyscallCondition {
                    index: 2,
                    value: 0o3,
                    value_two: Some(0o1),
                    op: "SCMP_CMP_MASKED_EQ".to_string(),
                }],
            }]),
        }
    }

    #[test]
    fn test_generate_covers_every_number() {
        let seeds = generate(&options(9));
        let numbers: BTreeSet<i32> = seeds.iter().map(|s| s.nr).collect();
        for nr in 0..=9 {
            assert!(numbers.contains(&nr), "missing nr {}", nr);
        }
        assert!(numbers.contains(&-1));
        assert!(numbers.contains(&X32_SYSCALL_BIT));
        assert!(!numbers.contains(&10));
    }

    #[test]
    fn test_generate_patterns() {
        let seeds = generate(&options(0));
        let all_max = SeccompData::from_fields(0, AUDIT_ARCH_X86_64, 0, [u64::MAX; 6]);
        let single = SeccompData::from_fields(0, AUDIT_ARCH_X86_64, 0, [0, 0, 0, 0x8000_0000, 0, 0]);
        assert!(seeds.contains(&all_max));
        assert!(seeds.contains(&single));

        // Nine all-argument patterns, plus each non-zero pattern on each of six
        // arguments alone; the all-zero record appears once.
        let per_nr = 9 + 8 * 6;
        assert_eq!(seeds.len(), per_nr * 4);
    }

    #[test]
    fn test_generate_is_deterministic() {
        assert_eq!(generate(&options(3)), generate(&options(3)));
    }

    #[test]
    fn test_seed_arches_adds_foreign() {
        let profile = profile_with_condition();
        assert_eq!(
            seed_arches(&profile.architectures),
            vec![AUDIT_ARCH_X86_64, AUDIT_ARCH_I386]
        );

        let names = vec!["SCMP_ARCH_X86".to_string(), "SCMP_ARCH_FOO".to_string()];
        assert_eq!(seed_arches(&names), vec![AUDIT_ARCH_I386, AUDIT_ARCH_AARCH64]);
    }

    #[test]
    fn test_profile_values() {
        let values: Vec<u64> = profile_values(&profile_with_condition())
            .into_iter()
            .map(|v| {
                assert_eq!(v.syscall, "openat");
                assert_eq!(v.index, 2);
                v.value
            })
            .collect();
        // 3, 4, 2, then value_two 1, 3 ^ 1 = 2, 3 & 1 = 1.
        assert_eq!(values, vec![1, 2, 3, 4]);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_generate_for_profile_targets_condition() {
        let profile = profile_with_condition();
        let seeds = generate_for_profile(&profile, &options(0));
        let openat = nix::libc::SYS_openat as i32;
        assert!(seeds.contains(&SeccompData::from_fields(
            openat,
            AUDIT_ARCH_X86_64,
            0,
            [0, 0, 4, 0, 0, 0]
        )));
        assert!(seeds.contains(&SeccompData::from_fields(
            openat,
            AUDIT_ARCH_X86_64,
            0,
            [u64::MAX, u64::MAX, 2, u64::MAX, u64::MAX, u64::MAX]
        )));
    }

    #[test]
    fn test_corpus_files() {
        let dir = std::env::temp_dir().join(format!("seccomp-diff-corpus-{}", std::process::id()));
        let seeds = generate(&options(1));
        assert_eq!(write_corpus(&dir, &seeds).unwrap(), seeds.len());

        let mut read = read_corpus(&dir).unwrap();
        read.sort();
        assert_eq!(read, seeds);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_read_corpus_missing_dir() {
        assert!(read_corpus(Path::new("/nonexistent/corpus")).is_err());
    }

    #[test]
    fn test_read_corpus_skips_directories() {
        let dir = std::env::temp_dir().join(format!("seccomp-diff-nested-{}", std::process::id()));
        fs::create_dir_all(dir.join("crashes")).unwrap();
        fs::write(dir.join("input"), [7u8; SECCOMP_DATA_SIZE]).unwrap();

        let read = read_corpus(&dir).unwrap();
        assert_eq!(read.len(), 1);
        assert!(matches!(read_corpus(&dir.join("input")), Err(DiffError::Io(_))));

        fs::remove_dir_all(&dir).unwrap();
    }
}
