//! Differential execution of two seccomp programs.
//!
//! Both programs see the same [`SeccompData`]; any difference in the
//! returned value is a [`Mismatch`]. Coverage is accumulated per program so
//! a run can end by asserting that every instruction of both was reached.

use log2::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::actions::Verdict;
use crate::bpf::Program;
use crate::coverage::{Coverage, CoverageSummary};
use crate::error::DiffError;
use crate::exec::{instrumented_exec, SeccompData};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => write!(f, "left"),
            Side::Right => write!(f, "right"),
        }
    }
}

/// An input on which the two programs disagree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mismatch {
    pub input: SeccompData,
    pub left: Verdict,
    pub right: Verdict,
}

impl Mismatch {
    /// The side whose verdict lets more through, if the actions differ.
    /// Verdicts with the same action but different data have no such side.
    pub fn more_permissive(&self) -> Option<Side> {
        let (left, right) = (self.left.action(), self.right.action());
        match left.cmp(&right) {
            std::cmp::Ordering::Less => Some(Side::Left),
            std::cmp::Ordering::Greater => Some(Side::Right),
            std::cmp::Ordering::Equal => None,
        }
    }
}

impl fmt::Display for Mismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "nr={} arch={:#010x} ip={:#x} args=[{:#x}, {:#x}, {:#x}, {:#x}, {:#x}, {:#x}]: left {} ({:#010x}), right {} ({:#010x})",
            self.input.nr,
            self.input.arch,
            self.input.instruction_pointer,
            self.input.args[0],
            self.input.args[1],
            self.input.args[2],
            self.input.args[3],
            self.input.args[4],
            self.input.args[5],
            self.left,
            self.left.0,
            self.right,
            self.right.0,
        )
    }
}

/// Outcome of a harness run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffReport {
    pub executions: u64,
    pub mismatches: Vec<Mismatch>,
    pub left: CoverageSummary,
    pub right: CoverageSummary,
}

impl DiffReport {
    pub fn is_clean(&self) -> bool {
        self.mismatches.is_empty()
    }

    /// Fail unless every instruction of both programs executed at least once.
    pub fn require_full_coverage(&self) -> Result<(), DiffError> {
        for (side, summary) in [(Side::Left, &self.left), (Side::Right, &self.right)] {
            if !summary.uncovered.is_empty() {
                return Err(DiffError::IncompleteCoverage {
                    side,
                    uncovered: summary.uncovered.clone(),
                });
            }
        }
        Ok(())
    }
}

pub struct DiffHarness {
    left: Program,
    right: Program,
    left_coverage: Coverage,
    right_coverage: Coverage,
    executions: u64,
    mismatches: Vec<Mismatch>,
    reported: usize,
}

impl DiffHarness {
    pub fn new(left: Program, right: Program) -> Self {
        debug!(
            "Differential harness: left {} instructions, right {} instructions",
            left.len(),
            right.len()
        );
        DiffHarness {
            left_coverage: Coverage::new(left.len()),
            right_coverage: Coverage::new(right.len()),
            left,
            right,
            executions: 0,
            mismatches: Vec::new(),
            reported: 0,
        }
    }

    pub fn left(&self) -> &Program {
        &self.left
    }

    pub fn right(&self) -> &Program {
        &self.right
    }

    pub fn executions(&self) -> u64 {
        self.executions
    }

    pub fn coverage(&self, side: Side) -> &Coverage {
        match side {
            Side::Left => &self.left_coverage,
            Side::Right => &self.right_coverage,
        }
    }

    /// True when either program reached an instruction it had not reached at
    /// the previous call.
    pub fn coverage_grew(&mut self) -> bool {
        let covered = self.left_coverage.covered() + self.right_coverage.covered();
        let grew = covered > self.reported;
        self.reported = covered;
        grew
    }

    /// Run both programs on `data` and compare their verdicts.
    pub fn check(&mut self, data: &SeccompData) -> Result<Verdict, DiffError> {
        let left = instrumented_exec(&self.left, data);
        let right = instrumented_exec(&self.right, data);
        self.left_coverage.merge(&left.coverage);
        self.right_coverage.merge(&right.coverage);
        self.executions += 1;

        if left.ret != right.ret {
            return Err(DiffError::Mismatch(Box::new(Mismatch {
                input: *data,
                left: Verdict(left.ret),
                right: Verdict(right.ret),
            })));
        }
        Ok(Verdict(left.ret))
    }

    /// Rebuild the record from scalar fields, then [`check`](Self::check) it.
    pub fn check_fields(
        &mut self,
        nr: i32,
        arch: u32,
        instruction_pointer: u64,
        args: [u64; 6],
    ) -> Result<Verdict, DiffError> {
        self.check(&SeccompData::from_fields(
            nr,
            arch,
            instruction_pointer,
            args,
        ))
    }

    /// Rebuild the record from a raw fuzzer buffer, then [`check`](Self::check) it.
    pub fn check_bytes(&mut self, bytes: &[u8]) -> Result<Verdict, DiffError> {
        self.check(&SeccompData::from_bytes(bytes))
    }

    /// Check every input, keeping mismatches instead of stopping at the first.
    /// Returns how many inputs disagreed.
    pub fn run_all<'a, I>(&mut self, inputs: I) -> usize
    where
        I: IntoIterator<Item = &'a SeccompData>,
    {
        let before = self.mismatches.len();
        for data in inputs {
            match self.check(data) {
                Ok(verdict) => debug!("nr={} arch={:#x}: {}", data.nr, data.arch, verdict),
                Err(DiffError::Mismatch(mismatch)) => {
                    error!("Mismatch: {}", mismatch);
                    if let Some(side) = mismatch.more_permissive() {
                        error!("The {} program is more permissive", side);
                    }
                    self.mismatches.push(*mismatch);
                }
                Err(e) => warn!("Unexpected harness error: {}", e),
            }
        }
        self.mismatches.len() - before
    }

    /// End the run. With `require_full_coverage`, every instruction of both
    /// programs must have executed at least once.
    pub fn finish(self, require_full_coverage: bool) -> Result<DiffReport, DiffError> {
        let report = DiffReport {
            executions: self.executions,
            mismatches: self.mismatches,
            left: self.left_coverage.summary(),
            right: self.right_coverage.summary(),
        };
        if require_full_coverage {
            report.require_full_coverage()?;
        }
        Ok(report)
    }
}
