use libseccomp::{
    error::SeccompError, ScmpAction, ScmpArch, ScmpArgCompare, ScmpCompareOp, ScmpFilterAttr,
    ScmpFilterContext, ScmpSyscall,
};
use log2::*;
use serde::{Deserialize, Serialize};
use std::fs;
#[cfg(not(libseccomp_2_6))]
use std::io::{self, Read};
use std::str::FromStr;
use thiserror::Error;

use crate::actions::{Action, ActionError};
use crate::bpf::{BpfError, Program};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug)]
pub enum ProfileError {
    #[error("Could not read profile file '{path}': {source}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Could not parse profile: {0}")]
    ProfileParse(#[from] toml::de::Error),
    #[error("Unknown syscall name: {0}")]
    UnknownSyscall(String),
    #[error("Architecture conversion error: {0}")]
    ArchConversion(String),
    #[error("libseccomp error: {0}")]
    LibSeccomp(#[from] SeccompError),
    #[error("Invalid action parameters: {0}")]
    Action(#[from] ActionError),
    #[error("Invalid OCI profile argument: {0}")]
    InvalidArgument(String),
    #[error("Exported filter is invalid: {0}")]
    Bpf(#[from] BpfError),
    #[error("Could not export filter: {0}")]
    Export(#[from] std::io::Error),
}

// ============================================================================
// Profile Structures
// ============================================================================

/// A single condition for a syscall rule. Fields are public for fuzzing purposes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct OciSyscallCondition {
    pub index: u8,
    pub value: u64,
    pub value_two: Option<u64>,
    pub op: String,
}

/// A single syscall rule. Fields are public for fuzzing purposes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct OciSyscall {
    pub names: Vec<String>,
    pub action: Action,
    pub errno_ret: Option<u32>,
    #[serde(default)]
    pub conditions: Vec<OciSyscallCondition>,
}

pub fn default_architectures() -> Vec<String> {
    vec!["SCMP_ARCH_X86_64".to_string()]
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "arbitrary", derive(arbitrary::Arbitrary))]
pub struct OciSeccomp {
    pub default_action: Action,
    pub default_errno_ret: Option<u32>,
    #[serde(default = "default_architectures")]
    pub architectures: Vec<String>,
    pub syscalls: Option<Vec<OciSyscall>>,
}

/// libseccomp optimization level used when generating BPF.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Optimization {
    /// Rules are checked one syscall after another.
    Linear = 1,
    /// Syscall numbers are dispatched through a binary tree.
    Tree = 2,
}

// ============================================================================
// Architectures
// ============================================================================

const AUDIT_ARCH_64BIT: u32 = 0x8000_0000;
const AUDIT_ARCH_LE: u32 = 0x4000_0000;

pub const AUDIT_ARCH_I386: u32 = 3 | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_X86_64: u32 = 62 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_ARM: u32 = 40 | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_AARCH64: u32 = 183 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_PPC64LE: u32 = 21 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;
pub const AUDIT_ARCH_S390X: u32 = 22 | AUDIT_ARCH_64BIT;
pub const AUDIT_ARCH_RISCV64: u32 = 243 | AUDIT_ARCH_64BIT | AUDIT_ARCH_LE;

/// `AUDIT_ARCH_*` value the kernel reports in `seccomp_data.arch`.
///
/// x32 shares the x86_64 value; its syscalls are told apart by bit 30 of `nr`.
pub fn arch_audit_value(name: &str) -> Option<u32> {
    Some(match name {
        "SCMP_ARCH_X86" => AUDIT_ARCH_I386,
        "SCMP_ARCH_X86_64" | "SCMP_ARCH_X32" => AUDIT_ARCH_X86_64,
        "SCMP_ARCH_ARM" => AUDIT_ARCH_ARM,
        "SCMP_ARCH_AARCH64" => AUDIT_ARCH_AARCH64,
        "SCMP_ARCH_PPC64LE" => AUDIT_ARCH_PPC64LE,
        "SCMP_ARCH_S390X" => AUDIT_ARCH_S390X,
        "SCMP_ARCH_RISCV64" => AUDIT_ARCH_RISCV64,
        _ => return None,
    })
}

// ============================================================================
// Public API
// ============================================================================

/// Load a seccomp profile from a TOML file.
pub fn read_profile(profile_path: &str) -> Result<OciSeccomp, ProfileError> {
    debug!("Loading profile from: {}", profile_path);
    let profile_content = fs::read_to_string(profile_path).map_err(|e| {
        error!("Failed to read profile: {}", e);
        ProfileError::FileRead {
            path: profile_path.to_string(),
            source: e,
        }
    })?;

    parse_profile(&profile_content)
}

/// Parse a seccomp profile string.
pub fn parse_profile(profile_content: &str) -> Result<OciSeccomp, ProfileError> {
    let oci_seccomp: OciSeccomp = toml::from_str(profile_content).map_err(|e| {
        error!("Failed to parse profile: {}", e);
        ProfileError::ProfileParse(e)
    })?;

    debug!(
        "Profile loaded with {} syscall rules",
        oci_seccomp.syscalls.as_ref().map(|s| s.len()).unwrap_or(0)
    );
    Ok(oci_seccomp)
}

/// Build a libseccomp filter context for the profile. Nothing is loaded
/// into the kernel.
pub fn apply_profile(oci_seccomp: &OciSeccomp) -> Result<ScmpFilterContext, ProfileError> {
    let default_action = oci_seccomp
        .default_action
        .to_scmp_action(oci_seccomp.default_errno_ret)?;
    debug!("default_action={:?}", default_action);

    let mut ctx = ScmpFilterContext::new(default_action).map_err(|e| {
        error!(
            "Failed to create filter context with default_action={:?}: {}",
            default_action, e
        );
        ProfileError::LibSeccomp(e)
    })?;

    set_architectures(&mut ctx, &oci_seccomp.architectures)?;

    match &oci_seccomp.syscalls {
        Some(syscalls) => {
            for syscall_entry in syscalls {
                apply_syscall_rule(&mut ctx, syscall_entry, default_action)?;
            }
        }
        None => info!(
            "No syscalls specified: every syscall gets {}",
            oci_seccomp.default_action
        ),
    }

    Ok(ctx)
}

/// Compile the profile to a validated BPF program.
pub fn compile_profile(
    oci_seccomp: &OciSeccomp,
    optimization: Optimization,
) -> Result<Program, ProfileError> {
    let mut ctx = apply_profile(oci_seccomp)?;
    ctx.set_filter_attr(ScmpFilterAttr::CtlOptimize, optimization as u32)
        .map_err(|e| {
            error!("Failed to set optimization level {:?}: {}", optimization, e);
            ProfileError::LibSeccomp(e)
        })?;

    let bytes = export_bpf_filter(&ctx)?;
    let program = Program::from_bytes(&bytes)?;
    debug!(
        "Compiled {:?} program with {} instructions",
        optimization,
        program.len()
    );
    Ok(program)
}

/// Split every multi-name rule into one rule per syscall.
pub fn explode_syscalls(profile: &mut OciSeccomp) {
    let Some(syscalls) = profile.syscalls.take() else {
        return;
    };
    let mut exploded = Vec::with_capacity(syscalls.len());
    for sc in syscalls {
        if sc.names.len() <= 1 {
            exploded.push(sc);
            continue;
        }
        for name in sc.names {
            exploded.push(OciSyscall {
                names: vec![name],
                action: sc.action,
                errno_ret: sc.errno_ret,
                conditions: sc.conditions.clone(),
            });
        }
    }
    profile.syscalls = Some(exploded);
}

/// Merge rules that share action, errno and conditions.
pub fn coalesce_rules_by_action(profile: &mut OciSeccomp) {
    let Some(syscalls) = profile.syscalls.take() else {
        return;
    };

    let mut groups: Vec<OciSyscall> = Vec::new();

    for sc in syscalls {
        if let Some(existing) = groups.iter_mut().find(|g| {
            g.action == sc.action && g.errno_ret == sc.errno_ret && g.conditions == sc.conditions
        }) {
            existing.names.extend(sc.names);
        } else {
            groups.push(sc);
        }
    }

    for g in &mut groups {
        g.names.sort_unstable();
        g.names.dedup();
    }

    profile.syscalls = Some(groups);
}

/// The profile as written, exploded then coalesced.
pub fn normalized(profile: &OciSeccomp) -> OciSeccomp {
    let mut normalized = profile.clone();
    explode_syscalls(&mut normalized);
    coalesce_rules_by_action(&mut normalized);
    normalized
}

// ============================================================================
// BPF Filter Export
// ============================================================================

fn export_bpf_filter(ctx: &ScmpFilterContext) -> Result<Vec<u8>, ProfileError> {
    #[cfg(libseccomp_2_6)]
    {
        ctx.export_bpf_mem().map_err(ProfileError::LibSeccomp)
    }

    #[cfg(not(libseccomp_2_6))]
    {
        debug!("Compiled with libseccomp < 2.6.0, using pipe for BPF export");
        export_bpf_via_pipe(ctx)
    }
}

#[cfg(not(libseccomp_2_6))]
fn export_bpf_via_pipe(ctx: &ScmpFilterContext) -> Result<Vec<u8>, ProfileError> {
    let (mut reader, writer) = io::pipe()?;
    // Drain concurrently so large filters cannot fill the pipe buffer.
    let drain = std::thread::spawn(move || {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).map(|_| buf)
    });
    let exported = ctx.export_bpf(&writer);
    drop(writer);

    let buf = drain
        .join()
        .map_err(|_| io::Error::other("BPF export reader panicked"))??;
    exported?;
    Ok(buf)
}

// ============================================================================
// Helper Functions
// ============================================================================

fn set_architectures(
    ctx: &mut ScmpFilterContext,
    architectures: &[String],
) -> Result<(), ProfileError> {
    let mut native_listed = false;
    for arch_str in architectures {
        let arch = ScmpArch::from_str(arch_str)
            .map_err(|e| ProfileError::ArchConversion(e.to_string()))?;

        if arch == ScmpArch::native() {
            native_listed = true;
        }
        if !ctx.is_arch_present(arch)? {
            ctx.add_arch(arch)?;
            debug!("Added architecture: {}", arch_str);
        }
    }

    // The context starts with the native architecture; keep it only when listed.
    if !native_listed && !architectures.is_empty() {
        ctx.remove_arch(ScmpArch::native())?;
        debug!("Removed native architecture");
    }

    Ok(())
}

fn apply_syscall_rule(
    ctx: &mut ScmpFilterContext,
    syscall_entry: &OciSyscall,
    default_action: ScmpAction,
) -> Result<(), ProfileError> {
    let scmp_action = syscall_entry.action.to_scmp_action(syscall_entry.errno_ret)?;

    if scmp_action == default_action {
        debug!(
            "Skipping syscall rule matching default action for: {:?}",
            syscall_entry.names
        );
        return Ok(());
    }

    let comparators = build_comparators(&syscall_entry.conditions)?;

    debug!(
        "Adding rule {:?} for syscalls: {:?}",
        scmp_action, syscall_entry.names
    );

    for syscall_name in &syscall_entry.names {
        let syscall = ScmpSyscall::from_name(syscall_name).map_err(|_| {
            error!("Unknown syscall: {}", syscall_name);
            ProfileError::UnknownSyscall(syscall_name.to_string())
        })?;

        if comparators.is_empty() {
            ctx.add_rule(scmp_action, syscall)
        } else {
            debug!("With conditions: {:?}", comparators);
            ctx.add_rule_conditional(scmp_action, syscall, &comparators)
        }
        .map_err(|e| {
            error!("Failed to add rule for {}: {}", syscall_name, e);
            ProfileError::LibSeccomp(e)
        })?;
    }

    Ok(())
}

fn build_comparators(
    conditions: &[OciSyscallCondition],
) -> Result<Vec<ScmpArgCompare>, ProfileError> {
    conditions.iter().map(build_comparator).collect()
}

fn build_comparator(arg: &OciSyscallCondition) -> Result<ScmpArgCompare, ProfileError> {
    if arg.index > 5 {
        return Err(ProfileError::InvalidArgument(format!(
            "argument index {} out of range 0..=5",
            arg.index
        )));
    }

    let (op, datum) = if arg.op == "SCMP_CMP_MASKED_EQ" {
        let datum = arg.value_two.ok_or_else(|| {
            ProfileError::InvalidArgument(
                "valueTwo must be present for SCMP_CMP_MASKED_EQ".to_string(),
            )
        })?;
        (ScmpCompareOp::MaskedEqual(arg.value), datum)
    } else {
        let op = parse_compare_op(&arg.op)?;
        (op, arg.value)
    };

    Ok(ScmpArgCompare::new(arg.index as u32, op, datum))
}

fn parse_compare_op(op: &str) -> Result<ScmpCompareOp, ProfileError> {
    match op {
        "SCMP_CMP_NE" => Ok(ScmpCompareOp::NotEqual),
        "SCMP_CMP_LT" => Ok(ScmpCompareOp::Less),
        "SCMP_CMP_LE" => Ok(ScmpCompareOp::LessOrEqual),
        "SCMP_CMP_EQ" => Ok(ScmpCompareOp::Equal),
        "SCMP_CMP_GE" => Ok(ScmpCompareOp::GreaterEqual),
        "SCMP_CMP_GT" => Ok(ScmpCompareOp::Greater),
        _ => Err(ProfileError::InvalidArgument(format!(
            "Unknown comparison operator: {}",
            op
        ))),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Verdict;
    use crate::exec::{instrumented_exec, SeccompData};

    fn rule(names: &[&str], action: Action) -> OciSyscall {
        OciSyscall {
            names: names.iter().map(|n| n.to_string()).collect(),
            action,
            errno_ret: None,
            conditions: vec![],
        }
    }

    fn profile(syscalls: Vec<OciSyscall>) -> OciSeccomp {
        OciSeccomp {
            default_action: Action::Errno,
            default_errno_ret: None,
            architectures: vec!["SCMP_ARCH_X86_64".to_string()],
            syscalls: Some(syscalls),
        }
    }

    #[test]
    fn test_parse_compare_op() {
        assert_eq!(
            parse_compare_op("SCMP_CMP_NE").unwrap(),
            ScmpCompareOp::NotEqual
        );
        assert_eq!(
            parse_compare_op("SCMP_CMP_LE").unwrap(),
            ScmpCompareOp::LessOrEqual
        );
        assert_eq!(
            parse_compare_op("SCMP_CMP_GT").unwrap(),
            ScmpCompareOp::Greater
        );
        assert!(matches!(
            parse_compare_op("SCMP_CMP_INVALID"),
            Err(ProfileError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_build_comparator_errors() {
        let masked = OciSyscallCondition {
            index: 1,
            value: 0o100,
            value_two: None,
            op: "SCMP_CMP_MASKED_EQ".to_string(),
        };
        assert!(matches!(
            build_comparator(&masked),
            Err(ProfileError::InvalidArgument(_))
        ));

        let out_of_range = OciSyscallCondition {
            index: 6,
            value: 0,
            value_two: None,
            op: "SCMP_CMP_EQ".to_string(),
        };
        assert!(matches!(
            build_comparator(&out_of_range),
            Err(ProfileError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_parse_profile() {
        let profile = parse_profile(
            r#"
            default_action = "SCMP_ACT_ERRNO"
            default_errno_ret = 38

            [[syscalls]]
            names = ["read", "write"]
            action = "SCMP_ACT_ALLOW"

            [[syscalls]]
            names = ["openat"]
            action = "SCMP_ACT_LOG"
            conditions = [{ index = 2, value = 3, value_two = 1, op = "SCMP_CMP_MASKED_EQ" }]
            "#,
        )
        .unwrap();

        assert_eq!(profile.default_action, Action::Errno);
        assert_eq!(profile.default_errno_ret, Some(38));
        assert_eq!(profile.architectures, vec!["SCMP_ARCH_X86_64"]);
        let syscalls = profile.syscalls.unwrap();
        assert_eq!(syscalls.len(), 2);
        assert_eq!(syscalls[1].conditions[0].value_two, Some(1));
    }

    #[test]
    fn test_read_profile_missing_file() {
        assert!(matches!(
            read_profile("/nonexistent/profile.toml"),
            Err(ProfileError::FileRead { .. })
        ));
    }

    #[test]
    fn test_arch_audit_value() {
        assert_eq!(arch_audit_value("SCMP_ARCH_X86_64"), Some(0xc000_003e));
        assert_eq!(arch_audit_value("SCMP_ARCH_X86"), Some(0x4000_0003));
        assert_eq!(arch_audit_value("SCMP_ARCH_AARCH64"), Some(0xc000_00b7));
        assert_eq!(arch_audit_value("SCMP_ARCH_MIPS"), None);
    }

    #[test]
    fn test_coalesce_rules() {
        let mut profile = profile(vec![
            rule(&["read"], Action::Allow),
            rule(&["write"], Action::Allow),
            rule(&["open"], Action::Log),
        ]);

        coalesce_rules_by_action(&mut profile);

        let syscalls = profile.syscalls.unwrap();
        assert_eq!(syscalls.len(), 2);

        let allow_rule = syscalls.iter().find(|s| s.action == Action::Allow).unwrap();
        assert_eq!(allow_rule.names, vec!["read", "write"]);
    }

    #[test]
    fn test_explode_syscalls() {
        let mut profile = profile(vec![rule(&["read", "write", "open"], Action::Allow)]);

        explode_syscalls(&mut profile);

        let syscalls = profile.syscalls.unwrap();
        assert_eq!(syscalls.len(), 3);
        assert_eq!(syscalls[0].names, vec!["read"]);
        assert_eq!(syscalls[1].names, vec!["write"]);
        assert_eq!(syscalls[2].names, vec!["open"]);
    }

    #[test]
    fn test_normalized_dedups_names() {
        let profile = profile(vec![
            rule(&["write", "read"], Action::Allow),
            rule(&["read"], Action::Allow),
        ]);
        let normalized = normalized(&profile);
        let syscalls = normalized.syscalls.unwrap();
        assert_eq!(syscalls.len(), 1);
        assert_eq!(syscalls[0].names, vec!["read", "write"]);
    }

    #[test]
    fn test_unknown_syscall() {
        let profile = profile(vec![rule(&["not_a_syscall"], Action::Allow)]);
        assert!(matches!(
            apply_profile(&profile),
            Err(ProfileError::UnknownSyscall(_))
        ));
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_compiled_program_classifies() {
        let mut profile = profile(vec![rule(&["read", "write"], Action::Allow)]);
        profile.default_errno_ret = Some(1);

        for optimization in [Optimization::Linear, Optimization::Tree] {
            let program = compile_profile(&profile, optimization).unwrap();
            let run = |nr: i64| {
                let data = SeccompData::from_fields(nr as i32, AUDIT_ARCH_X86_64, 0, [0; 6]);
                Verdict(instrumented_exec(&program, &data).ret)
            };
            assert_eq!(run(nix::libc::SYS_read).action(), Action::Allow);
            assert_eq!(run(nix::libc::SYS_write).action(), Action::Allow);
            let denied = run(nix::libc::SYS_openat);
            assert_eq!(denied.action(), Action::Errno);
            assert_eq!(denied.data(), 1);
        }
    }
}
