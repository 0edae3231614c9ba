use log2::*;
use std::fs;
use std::path::Path;

use crate::bpf::Program;
use crate::diff::{DiffHarness, DiffReport};
use crate::error::DiffError;
use crate::exec::SeccompData;
use crate::filters::{
    compile_profile, default_architectures, normalized, read_profile, OciSeccomp, Optimization,
};
use crate::options::{CheckOptions, DumpOptions, Pairing, SeedOptions};
use crate::seeds::{generate_for_profile, read_corpus, seed_arches, write_corpus};

// ============================================================================
// SEED CORPUS
// ============================================================================

/// Write the seed corpus for a profile into `out_dir`.
///
/// Returns the number of seed files written.
pub fn write_seeds(profile_path: &str, out_dir: &Path, max_nr: i32) -> Result<usize, DiffError> {
    let profile = read_profile(profile_path)?;
    let options = SeedOptions {
        arches: seed_arches(&profile.architectures),
        max_nr,
    };
    let seeds = generate_for_profile(&profile, &options);
    write_corpus(out_dir, &seeds)
}

// ============================================================================
// DIFFERENTIAL CHECK
// ============================================================================

fn load_program(path: &Path) -> Result<Program, DiffError> {
    let bytes = fs::read(path)?;
    Program::from_bytes(&bytes).map_err(|source| DiffError::Program {
        path: path.display().to_string(),
        source,
    })
}

/// Build both programs of a pairing. The profile, if any, is returned so
/// seeds can be derived from its conditions.
fn build_pair(pairing: &Pairing) -> Result<(Program, Program, OciSeccomp), DiffError> {
    match pairing {
        Pairing::Optimize { profile } => {
            let profile = read_profile(profile)?;
            let left = compile_profile(&profile, Optimization::Linear)?;
            let right = compile_profile(&profile, Optimization::Tree)?;
            Ok((left, right, profile))
        }
        Pairing::Normalize { profile } => {
            let profile = read_profile(profile)?;
            let left = compile_profile(&profile, Optimization::Linear)?;
            let right = compile_profile(&normalized(&profile), Optimization::Linear)?;
            Ok((left, right, profile))
        }
        Pairing::Files { left, right } => {
            let empty = OciSeccomp {
                default_action: Default::default(),
                default_errno_ret: None,
                architectures: default_architectures(),
                syscalls: None,
            };
            Ok((load_program(left)?, load_program(right)?, empty))
        }
    }
}

fn collect_inputs(
    options: &CheckOptions,
    profile: &OciSeccomp,
) -> Result<Vec<SeccompData>, DiffError> {
    let mut inputs = Vec::new();
    if options.use_seeds {
        let seed_options = SeedOptions {
            arches: seed_arches(&profile.architectures),
            max_nr: options.max_nr,
        };
        inputs.extend(generate_for_profile(profile, &seed_options));
    }
    for dir in &options.corpus {
        inputs.extend(read_corpus(dir)?);
    }
    Ok(inputs)
}

/// Run seeds and corpus files through both programs of the pairing.
///
/// The report is written before any failure is returned, so a failing run
/// still leaves its mismatches on disk.
pub fn check(options: &CheckOptions) -> Result<DiffReport, DiffError> {
    let (left, right, profile) = build_pair(&options.pairing)?;
    info!(
        "Comparing {} instructions against {} instructions",
        left.len(),
        right.len()
    );

    let inputs = collect_inputs(options, &profile)?;
    if inputs.is_empty() {
        return Err(DiffError::NoInputs);
    }
    info!("Checking {} inputs...", inputs.len());

    let mut harness = DiffHarness::new(left, right);
    let count = harness.run_all(&inputs);
    let report = harness.finish(false)?;

    info!(
        "{} executions, {} mismatches, coverage left {}/{}, right {}/{}",
        report.executions,
        count,
        report.left.covered,
        report.left.instructions,
        report.right.covered,
        report.right.instructions
    );

    if let Some(path) = &options.report {
        fs::write(path, serde_json::to_string_pretty(&report)?)?;
        info!("Report written to {}", path.display());
    }

    if !report.is_clean() {
        return Err(DiffError::Mismatches {
            count: report.mismatches.len(),
            executions: report.executions,
        });
    }
    if options.require_full_coverage {
        report.require_full_coverage()?;
    } else {
        for (side, summary) in [("left", &report.left), ("right", &report.right)] {
            if !summary.uncovered.is_empty() {
                warn!(
                    "Instructions never reached in the {} program: {:?}",
                    side, summary.uncovered
                );
            }
        }
    }

    Ok(report)
}

// ============================================================================
// DUMP
// ============================================================================

/// Compile a profile, print its disassembly and optionally save the raw
/// program.
pub fn dump(options: &DumpOptions) -> Result<Program, DiffError> {
    let profile = read_profile(&options.profile)?;
    let program = compile_profile(&profile, options.optimization)?;
    for (pc, insn) in program.instructions().iter().enumerate() {
        debug!("{:4}: {}", pc, insn);
    }
    print!("{}", program);

    if let Some(path) = &options.output {
        fs::write(path, program.to_bytes())?;
        info!(
            "Wrote {} instructions to {}",
            program.len(),
            path.display()
        );
    }
    Ok(program)
}
