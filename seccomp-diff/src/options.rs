use std::path::PathBuf;

use crate::filters::Optimization;

/// Which two programs a check compares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pairing {
    /// One profile compiled at libseccomp optimization levels 1 and 2.
    Optimize { profile: String },
    /// One profile as written against its exploded-then-coalesced form.
    Normalize { profile: String },
    /// Two raw exported programs.
    Files { left: PathBuf, right: PathBuf },
}

/// Options for a differential check.
#[derive(Debug)]
pub struct CheckOptions {
    pub pairing: Pairing,
    pub corpus: Vec<PathBuf>,
    pub use_seeds: bool,
    pub max_nr: i32,
    pub require_full_coverage: bool,
    pub report: Option<PathBuf>,
}

/// Options for seed corpus generation.
#[derive(Debug, Clone)]
pub struct SeedOptions {
    /// `AUDIT_ARCH_*` values to enumerate.
    pub arches: Vec<u32>,
    pub max_nr: i32,
}

/// Options for dumping a compiled profile.
#[derive(Debug)]
pub struct DumpOptions {
    pub profile: String,
    pub optimization: Optimization,
    pub output: Option<PathBuf>,
}
