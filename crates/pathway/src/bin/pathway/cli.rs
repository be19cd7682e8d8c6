//! pathway cli interface

use clap::{Parser, Subcommand, ValueEnum};
use std::fmt::Formatter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Change the work directory
    ///
    /// Can be specified multiple times. Note that all
    /// paths on the way to the final path must exist.
    ///
    /// This is equivalent to running { cd <directory>; pathway ... }
    #[clap(short = 'C', long = "directory", global(true))]
    pub directory: Vec<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the execution order without touching any backend
    Plan(PlanCommand),

    /// Provision the whole stack against the in-memory backend
    ///
    /// Ctrl-C stops new resources from starting. Resources already in flight still finish.
    Rehearse(RehearseCommand),
}

#[derive(Parser, Debug)]
pub struct PlanCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,
}

#[derive(Parser, Debug)]
pub struct RehearseCommand {
    #[clap(flatten)]
    pub input: InputArgs,

    #[clap(flatten)]
    pub output: OutputArgs,

    /// Resources provisioned at the same time
    #[arg(long, default_value_t = 4, value_parser = clap::value_parser!(u64).range(1..))]
    pub concurrency: u64,

    /// Describe rounds before a discovery gives up
    #[arg(long, default_value_t = 12)]
    pub max_attempts: u32,

    /// Base delay between describe rounds, doubled each round
    #[arg(long, default_value_t = 500)]
    pub backoff_ms: u64,

    /// Upper bound for the delay between describe rounds
    #[arg(long, default_value_t = 15_000)]
    pub backoff_max_ms: u64,

    /// Upper bound for a single describe call
    #[arg(long, default_value_t = 10_000)]
    pub query_timeout_ms: u64,

    /// Describe rounds before the in-memory backend assigns late attributes
    #[arg(long, default_value_t = 2)]
    pub discovery_lag: u32,
}

#[derive(Parser, Debug)]
pub struct InputArgs {
    /// Configuration file
    #[clap(short = 'e', long = "env-file", default_value = ".env")]
    pub env_file: PathBuf,
}

#[derive(Parser, Debug)]
pub struct OutputArgs {
    #[arg(short = 'F', long = "output-format", default_value_t)]
    pub format: OutputFormat,
}

#[derive(ValueEnum, Clone, Default, Debug)]
pub enum OutputFormat {
    Json,
    #[default]
    Yaml,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Json => f.write_str("json"),
            OutputFormat::Yaml => f.write_str("yaml"),
        }
    }
}
