//! Command-line application

use std::path::Path;

use anyhow::{Context, Result};
use opentelemetry_proto::tonic::collector::{
    metrics::v1::ExportMetricsServiceRequest, trace::v1::ExportTraceServiceRequest,
};
use prost::Message;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::core::cli::{self, Commands, InputFormat, ProcessArgs};
use crate::core::config::ProcessorConfig;
use crate::core::constants::{APP_NAME, ENV_LOG};
use crate::domain::pipeline::BatchStats;
use crate::domain::processor::Processor;
use crate::domain::resolver::ResolverConfig;

pub struct MutatorApp;

impl MutatorApp {
    /// Run the application with CLI argument parsing
    pub async fn run() -> Result<()> {
        dotenvy::dotenv().ok();
        Self::init_logging();

        tracing::debug!("Application starting");

        let (cli_config, command) = cli::parse();
        tracing::trace!(command = ?command, "Parsed command");

        let config = ProcessorConfig::load(&cli_config)?;

        match command {
            Commands::Metrics(args) => Self::process_metrics(config, &args).await,
            Commands::Traces(args) => Self::process_traces(config, &args).await,
            Commands::CheckConfig => {
                Self::print_summary(&config);
                Ok(())
            }
        }
    }

    fn init_logging() {
        let default_filter = format!("info,{}=info", APP_NAME.replace('-', "_"));

        let filter = std::env::var(ENV_LOG)
            .or_else(|_| std::env::var("RUST_LOG"))
            .unwrap_or(default_filter);

        // Logs go to stderr so stdout stays clean for processed output
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_level(true)
            .with_ansi(true)
            .compact()
            .with_env_filter(filter)
            .init();
    }

    async fn process_metrics(config: ProcessorConfig, args: &ProcessArgs) -> Result<()> {
        let request: ExportMetricsServiceRequest = read_request(args).await?;
        let processor = Processor::new(config).context("Failed to build processor")?;

        let ctx = CancellationToken::new();
        processor.start_metrics(&ctx);

        let outcome = processor.process_metrics(request);
        // Stop background tasks whatever the outcome
        Self::shutdown(&processor, &ctx).await;

        let result = outcome?;
        log_stats("metrics", &result.stats);
        write_output(&result.batch, args.output.as_deref()).await
    }

    async fn process_traces(config: ProcessorConfig, args: &ProcessArgs) -> Result<()> {
        let request: ExportTraceServiceRequest = read_request(args).await?;
        let processor = Processor::new(config).context("Failed to build processor")?;

        let ctx = CancellationToken::new();
        processor.start_traces(&ctx);

        let outcome = processor.process_traces(request);
        Self::shutdown(&processor, &ctx).await;

        let result = outcome?;
        log_stats("traces", &result.stats);
        write_output(&result.batch, args.output.as_deref()).await
    }

    async fn shutdown(processor: &Processor, ctx: &CancellationToken) {
        let errors = processor.shutdown(&CancellationToken::new()).await;
        if !errors.is_empty() {
            tracing::warn!(failed = errors.len(), "Shutdown completed with errors");
        }
        ctx.cancel();
    }

    fn print_summary(config: &ProcessorConfig) {
        println!("Configuration OK");
        println!();

        println!("Resolvers: {}", config.resolvers.len());
        for resolver in &config.resolvers {
            match resolver {
                ResolverConfig::Endpoint(c) => {
                    let source = match &c.path {
                        Some(path) => format!(
                            "{} (every {})",
                            path.display(),
                            humantime::format_duration(c.refresh_interval)
                        ),
                        None => "inline".to_string(),
                    };
                    println!(
                        "  endpoint     {} -> {}, {} entries, {}",
                        c.source_keys.join("|"),
                        c.target_key,
                        c.entries.len(),
                        source
                    );
                }
                ResolverConfig::Environment(c) => {
                    println!("  environment  -> {} (default {})", c.target_key, c.default);
                }
            }
        }

        println!("Rules:     {}", config.rules.len());
        println!(
            "Normalizer: {} renames, {} lowercase patterns, values up to {} chars",
            config.normalizer.rename.len(),
            config.normalizer.lowercase_keys.len(),
            config.normalizer.max_value_length
        );

        if config.limiter.disabled {
            println!("Limiter:   disabled");
        } else {
            println!(
                "Limiter:   {} series per metric, rotated every {}, on limit: {}",
                config.limiter.max_series,
                humantime::format_duration(config.limiter.rotation_interval),
                config.limiter.on_limit.as_str()
            );
        }
    }
}

/// Decode an OTLP export request from a file or stdin
async fn read_request<T>(args: &ProcessArgs) -> Result<T>
where
    T: Message + Default + DeserializeOwned,
{
    let bytes = if args.reads_stdin() {
        let mut buf = Vec::new();
        tokio::io::stdin()
            .read_to_end(&mut buf)
            .await
            .context("Failed to read request from stdin")?;
        buf
    } else {
        tokio::fs::read(&args.input)
            .await
            .with_context(|| format!("Failed to read input file: {}", args.input.display()))?
    };

    decode_request(&bytes, args.format)
}

fn decode_request<T>(bytes: &[u8], format: InputFormat) -> Result<T>
where
    T: Message + Default + DeserializeOwned,
{
    match format {
        InputFormat::Proto => T::decode(bytes).context("Failed to decode protobuf request"),
        InputFormat::Json => serde_json::from_slice(bytes).context("Failed to decode JSON request"),
    }
}

async fn write_output<T: Serialize>(batch: &T, output: Option<&Path>) -> Result<()> {
    let mut json = serde_json::to_vec_pretty(batch).context("Failed to encode output")?;
    json.push(b'\n');

    match output {
        Some(path) => tokio::fs::write(path, &json)
            .await
            .with_context(|| format!("Failed to write output file: {}", path.display())),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(&json).await?;
            stdout.flush().await?;
            Ok(())
        }
    }
}

fn log_stats(kind: &'static str, stats: &BatchStats) {
    tracing::info!(
        kind,
        seen = stats.seen,
        retained = stats.retained(),
        dropped_by_rules = stats.dropped_by_rules,
        rejected = stats.rejected,
        dropped_by_limiter = stats.dropped_by_limiter,
        reserved = stats.reserved,
        failed_open = stats.failed_open,
        errors = stats.errors,
        "Batch processed"
    );
}
