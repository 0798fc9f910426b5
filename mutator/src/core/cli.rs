use clap::{Args, Parser, Subcommand};

use std::path::PathBuf;

use super::constants::{ENV_CONFIG, ENV_MAX_SERIES, ENV_NO_LIMITER};

#[derive(Parser)]
#[command(name = "otel-mutator")]
#[command(
    version,
    about = "Resolve, normalize, filter and cardinality-limit OTLP attributes",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Distinct series admitted per metric name per rotation window
    #[arg(long, global = true, env = ENV_MAX_SERIES)]
    pub max_series: Option<usize>,

    /// Disable the cardinality limiter
    #[arg(long, global = true, env = ENV_NO_LIMITER)]
    pub no_limiter: bool,
}

/// Encoding of an OTLP export request on disk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputFormat {
    #[default]
    Json,
    Proto,
}

/// Parse input format from CLI string
fn parse_input_format(s: &str) -> Result<InputFormat, String> {
    match s.to_lowercase().as_str() {
        "json" => Ok(InputFormat::Json),
        "proto" | "protobuf" => Ok(InputFormat::Proto),
        _ => Err(format!(
            "Invalid input format '{}'. Valid options: json, proto",
            s
        )),
    }
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Process an OTLP metrics export request
    Metrics(ProcessArgs),
    /// Process an OTLP traces export request
    Traces(ProcessArgs),
    /// Load and validate the configuration, then print a summary
    CheckConfig,
}

#[derive(Args, Clone, Debug)]
pub struct ProcessArgs {
    /// Input file, or "-" for stdin
    pub input: PathBuf,

    /// Output file for the processed request as JSON (stdout when omitted)
    #[arg(long, short = 'o')]
    pub output: Option<PathBuf>,

    /// Input encoding (json or proto)
    #[arg(long, short = 'f', default_value = "json", value_parser = parse_input_format)]
    pub format: InputFormat,
}

impl ProcessArgs {
    pub fn reads_stdin(&self) -> bool {
        self.input.as_os_str() == "-"
    }
}

/// Configuration derived from CLI arguments
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub max_series: Option<usize>,
    pub no_limiter: bool,
}

impl From<&Cli> for CliConfig {
    fn from(cli: &Cli) -> Self {
        Self {
            config: cli.config.clone(),
            max_series: cli.max_series,
            no_limiter: cli.no_limiter,
        }
    }
}

/// Parse CLI arguments and return config with command
pub fn parse() -> (CliConfig, Commands) {
    let cli = Cli::parse();
    (CliConfig::from(&cli), cli.command)
}
