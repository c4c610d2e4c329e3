use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "veristep",
    version,
    about = "Sequential step judgment against standard sequences, with self-optimizing judging rules"
)]
pub struct Cli {
    /// YAML configuration file; built-in defaults apply when absent
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Judge one case against its standard sequence
    Check(CheckArgs),
    /// Rewrite judging rules until a human-corrected outcome is reproduced
    Optimize(OptimizeArgs),
    /// Judge many independent cases concurrently
    Batch(BatchArgs),
}

#[derive(clap::Args, Debug)]
pub struct CheckArgs {
    /// JSON case file with `standard` and `actual` step arrays
    pub case: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct OptimizeArgs {
    /// JSON case file with `standard` and `actual` step arrays
    pub case: PathBuf,

    /// Human-corrected final result: Correct, Incorrect, Spam or NeedDiscussion
    #[arg(long)]
    pub label: String,

    /// Human explanation; an explicit "Step Number: N" pins the divergence step
    #[arg(long, default_value = "")]
    pub reason: String,
}

#[derive(clap::Args, Debug)]
pub struct BatchArgs {
    /// JSON file holding an array of batch cases
    pub cases: PathBuf,

    /// Override the configured case-level parallelism
    #[arg(long)]
    pub parallel: Option<usize>,
}
