use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "tapgate",
    version,
    about = "Generate, run and triage SQL tests for a candidate schema"
)]
pub struct Cli {
    #[command(subcommand)]
    pub cmd: Command,

    /// Emit logs as JSON lines on stderr (filter with TAPGATE_LOG)
    #[arg(long, global = true)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Command {
    /// Generate and execute tests for every requirement, then triage failures
    Run(RunArgs),
    /// Write a sample config, schema and fixture file
    Init(InitArgs),
    /// Check a candidate SQL file the way generated candidates are checked
    Validate(ValidateArgs),
    /// Parse TAP output and print the summary as JSON
    Parse(ParseArgs),
    /// Classify a database error message
    Classify(ClassifyArgs),
    Version,
}

#[derive(Parser, Clone, Debug)]
pub struct RunArgs {
    #[arg(long, default_value = "tapgate.yaml")]
    pub config: PathBuf,

    /// Reject unknown config keys
    #[arg(long)]
    pub strict: bool,

    /// text | json
    #[arg(long, default_value = "text")]
    pub format: String,

    /// Write the resulting plan (SQL and result history) as JSON
    #[arg(long)]
    pub out: Option<PathBuf>,

    /// Override settings.parallel
    #[arg(long, env = "TAPGATE_PARALLEL")]
    pub parallel: Option<usize>,
}

#[derive(Parser, Clone, Debug)]
pub struct InitArgs {
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,
}

#[derive(Parser, Clone, Debug)]
pub struct ValidateArgs {
    /// SQL file to check
    pub file: PathBuf,

    /// sqlite | postgres
    #[arg(long, default_value = "sqlite")]
    pub dialect: String,
}

#[derive(Parser, Clone, Debug)]
pub struct ParseArgs {
    /// TAP file; reads stdin when omitted or "-"
    pub file: Option<PathBuf>,
}

#[derive(Parser, Clone, Debug)]
pub struct ClassifyArgs {
    pub message: String,
}
