use std::io;
use thiserror::Error;

use crate::bpf::BpfError;
use crate::diff::{Mismatch, Side};
use crate::filters::ProfileError;

#[derive(Error, Debug)]
pub enum DiffError {
    #[error("Programs disagree: {0}")]
    Mismatch(Box<Mismatch>),
    #[error("{count} of {executions} inputs produced different verdicts")]
    Mismatches { count: usize, executions: u64 },
    #[error("{side} program has {} uncovered instructions: {uncovered:?}", .uncovered.len())]
    IncompleteCoverage { side: Side, uncovered: Vec<usize> },
    #[error("No inputs to check")]
    NoInputs,
    #[error("Invalid BPF program '{path}': {source}")]
    Program {
        path: String,
        #[source]
        source: BpfError,
    },
    #[error("Profile operation failed: {0}")]
    Profile(#[from] ProfileError),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
