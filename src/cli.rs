use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// leaklint CLI options.
#[derive(Debug, Parser)]
#[command(
    name = "leaklint",
    version,
    about = "Detect unreleased resources in C-like programs",
    args_conflicts_with_subcommands = true,
    subcommand_precedence_over_arg = true
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub analyze: AnalyzeArgs,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Analyze program files or directories.
    Analyze(AnalyzeArgs),

    /// List the configured resource kinds and their call rules.
    ListKinds {
        /// Config file to read the kinds from.
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, ClapArgs)]
pub struct AnalyzeArgs {
    /// Program files/directories to analyze. Defaults to stdin when absent.
    #[arg(value_name = "PATH")]
    pub paths: Vec<PathBuf>,

    /// Output format.
    #[arg(long, value_enum, default_value_t = OutputFormat::Pretty)]
    pub format: OutputFormat,

    /// Config file path (default: nearest leaklint.toml).
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Per-function analysis deadline in milliseconds (overrides config).
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Exit with code 1 if any findings are emitted.
    #[arg(long)]
    pub deny_findings: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Pretty,
    Json,
    Github,
}
