pub mod actions;
pub mod bpf;
pub mod commands;
pub mod coverage;
pub mod diff;
pub mod error;
pub mod exec;
pub mod filters;
pub mod options;
pub mod seeds;
