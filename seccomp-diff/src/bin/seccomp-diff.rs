use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use log2::*;
use thiserror::Error;

use seccomp_diff::commands;
use seccomp_diff::error::DiffError;
use seccomp_diff::filters::Optimization;
use seccomp_diff::options::{CheckOptions, DumpOptions, Pairing};
use seccomp_diff::seeds::DEFAULT_MAX_NR;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Diff(#[from] DiffError),
    #[error("{0}")]
    Message(String),
}

#[derive(Parser, Debug)]
#[command(author, version)]
#[command(propagate_version = true)]
struct Cli {
    /// Set log level to debug (default: info).
    #[arg(short = 'd', long)]
    debug: bool,

    /// Batch mode: only log errors.
    #[arg(short = 'b', long)]
    batch: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a seed corpus for the given profile.
    ///
    /// Every syscall number of the profile's architectures and of one
    /// foreign architecture is combined with boundary argument values and
    /// with the values the profile's conditions compare against.
    Seeds(SeedsArgs),

    /// Run two seccomp programs on the same inputs and compare their verdicts.
    ///
    /// Exits with an error on the first run that finds a mismatch, or that
    /// leaves instructions unreached when --require-full-coverage is given.
    Check(CheckArgs),

    /// Print the disassembly of a compiled profile.
    Dump(DumpArgs),
}

#[derive(Args, Debug)]
struct SeedsArgs {
    /// Path to the profile file.
    #[arg(short = 'p', long, value_name = "FILE", required = true)]
    profile: String,

    /// Directory the seed files are written to.
    #[arg(short = 'o', long, value_name = "DIR", required = true)]
    output: PathBuf,

    /// Highest syscall number to enumerate.
    #[arg(long, default_value_t = DEFAULT_MAX_NR, value_name = "NR")]
    max_nr: i32,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PairKind {
    /// Optimization level 1 against level 2.
    Optimize,
    /// The profile as written against its exploded and coalesced form.
    Normalize,
}

#[derive(Args, Debug)]
struct CheckArgs {
    /// Path to the profile file.
    #[arg(short = 'p', long, value_name = "FILE", conflicts_with_all = ["left", "right"])]
    profile: Option<String>,

    /// Which two programs to build from the profile.
    #[arg(long, value_enum, default_value_t = PairKind::Optimize)]
    pair: PairKind,

    /// Raw BPF program compared against --right instead of a profile pair.
    #[arg(long, value_name = "FILE", requires = "right")]
    left: Option<PathBuf>,

    /// Raw BPF program compared against --left.
    #[arg(long, value_name = "FILE", requires = "left")]
    right: Option<PathBuf>,

    /// Directory of extra inputs, e.g. a fuzzer corpus.
    ///
    /// Can be specified multiple times.
    #[arg(long, value_name = "DIR", action = ArgAction::Append)]
    corpus: Vec<PathBuf>,

    /// Do not generate seeds, only use --corpus inputs.
    #[arg(long)]
    no_seeds: bool,

    /// Highest syscall number to enumerate in generated seeds.
    #[arg(long, default_value_t = DEFAULT_MAX_NR, value_name = "NR")]
    max_nr: i32,

    /// Fail unless every instruction of both programs was executed.
    #[arg(long)]
    require_full_coverage: bool,

    /// Write a JSON report of the run to this file.
    #[arg(long, value_name = "FILE")]
    report: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct DumpArgs {
    /// Path to the profile file.
    #[arg(short = 'p', long, value_name = "FILE", required = true)]
    profile: String,

    /// libseccomp optimization level (1: linear, 2: binary tree).
    #[arg(long = "optimize", default_value_t = 1, value_parser = clap::value_parser!(u8).range(1..=2))]
    optimize: u8,

    /// Also write the raw BPF program to this file.
    #[arg(short = 'o', long, value_name = "FILE")]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let mut logger = log2::stdout()
        .module(cli.debug)
        .level(if cli.debug {
            "debug"
        } else if cli.batch {
            "error"
        } else {
            "info"
        })
        .start();

    if let Err(e) = run(cli) {
        error!("Error: {}", e);
        // exit() skips destructors; flush the logger first.
        logger.stop();
        std::process::exit(1);
    }
}

fn pairing(args: &CheckArgs) -> Result<Pairing, AppError> {
    match (&args.profile, &args.left, &args.right) {
        (Some(profile), None, None) => Ok(match args.pair {
            PairKind::Optimize => Pairing::Optimize {
                profile: profile.clone(),
            },
            PairKind::Normalize => Pairing::Normalize {
                profile: profile.clone(),
            },
        }),
        (None, Some(left), Some(right)) => Ok(Pairing::Files {
            left: left.clone(),
            right: right.clone(),
        }),
        _ => Err(AppError::Message(
            "Either --profile or both --left and --right are required".to_string(),
        )),
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Commands::Seeds(seeds_args) => {
            info!("Generating seed corpus...");
            debug!("Profile: {}", seeds_args.profile);
            let count =
                commands::write_seeds(&seeds_args.profile, &seeds_args.output, seeds_args.max_nr)?;
            info!("Seed generation finished: {} files.", count);
        }
        Commands::Check(check_args) => {
            let options = CheckOptions {
                pairing: pairing(&check_args)?,
                corpus: check_args.corpus,
                use_seeds: !check_args.no_seeds,
                max_nr: check_args.max_nr,
                require_full_coverage: check_args.require_full_coverage,
                report: check_args.report,
            };
            debug!("Check options: {:?}", options);
            commands::check(&options)?;
            info!("No mismatches found.");
        }
        Commands::Dump(dump_args) => {
            let optimization = if dump_args.optimize == 2 {
                Optimization::Tree
            } else {
                Optimization::Linear
            };
            let options = DumpOptions {
                profile: dump_args.profile,
                optimization,
                output: dump_args.output,
            };
            commands::dump(&options)?;
        }
    }

    Ok(())
}
