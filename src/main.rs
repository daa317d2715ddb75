//! tracedistill CLI - Reasoning-trace distillation and validation.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracedistill::client::HealthStatus;
use tracedistill::{
    filter_dataset, revalidate_dataset, CheckpointManager, Config, DistillPipeline, JsonlCorpus,
    LlmClient, TraceValidator,
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "tracedistill")]
#[command(version)]
#[command(about = "Distill verified reasoning traces from a hosted reasoning model")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and validate reasoning traces for a corpus split
    Distill {
        /// Corpus name (directory under dataset.root)
        #[arg(long)]
        corpus: String,

        /// Split name (file inside the corpus directory)
        #[arg(long)]
        split: String,

        /// Intermediate JSONL file with every trace (defaults to output.path)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only process the first N records
        #[arg(long)]
        limit: Option<usize>,

        /// Traces to sample per record (defaults to generation.samples_per_problem)
        #[arg(long)]
        samples: Option<usize>,

        /// Checkpoint directory for resumable runs (defaults to output.checkpoint_dir)
        #[arg(long)]
        checkpoint: Option<PathBuf>,

        /// Also write the filtered final dataset here (defaults to output.filtered_path)
        #[arg(long = "final")]
        final_path: Option<PathBuf>,
    },

    /// Keep only traces with filtered == false
    Filter {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Recompute verdicts of an existing trace file
    Revalidate {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,
    },

    /// Validate configuration file
    Validate {
        /// Also check that the inference endpoint answers
        #[arg(long)]
        check_endpoint: bool,
    },

    /// Show example configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let level = if verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn load_config(path: &Path) -> Result<Config> {
    Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))
}

fn print_example_config() {
    let example = r#"# tracedistill configuration file

[endpoint]
# OpenAI-compatible chat completions endpoint
base_url = "https://integrate.api.nvidia.com/v1"
# API key (can also use the env var named by api_key_env; omit for local servers)
# api_key = "${NVIDIA_API_KEY}"
api_key_env = "NVIDIA_API_KEY"
timeout_secs = 1800
connect_timeout_secs = 30
max_retries = 3

[endpoint.headers]
# X-Request-Source = "tracedistill"

[model]
id = "deepseek-ai/deepseek-r1"
temperature = 0.6
top_p = 0.7
max_tokens = 32768

[workers]
size = 4
# Abort a record's stream after this many seconds (kept as truncated)
# record_timeout_secs = 1200

[generation]
prompt_template = "{problem}\n\nPlease reason step by step, and put your final answer within \\boxed{}."
samples_per_problem = 1

[dataset]
# Records are read from <root>/<corpus>/<split>.jsonl
root = "data"
problem_field = "problem"
answer_field = "answer"

[output]
path = "output/traces.jsonl"
filtered_path = "output/final.jsonl"
# checkpoint_dir = "checkpoints/"
"#;
    println!("{example}");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate { check_endpoint } => {
            let config = load_config(&cli.config)?;

            if config.resolve_api_key().is_none() {
                warn!(
                    env_var = %config.endpoint.api_key_env,
                    "No API key configured; requests will be sent without auth"
                );
            }

            info!("Configuration is valid");
            info!("  Endpoint: {}", config.endpoint.base_url);
            info!(
                "  Model: {} (temperature {}, top_p {}, max_tokens {})",
                config.model.id, config.model.temperature, config.model.top_p, config.model.max_tokens
            );
            info!("  Workers: {}", config.workers.size);
            info!("  Samples per problem: {}", config.generation.samples_per_problem);

            if check_endpoint {
                let client = LlmClient::from_config(&config)?;
                let health = client.health_check().await;
                match health.status {
                    HealthStatus::Healthy => info!(
                        latency_ms = health.latency_ms.unwrap_or_default(),
                        "Endpoint {} is {}",
                        health.endpoint,
                        health.status
                    ),
                    _ => bail!(
                        "Endpoint {} is {}: {}",
                        health.endpoint,
                        health.status,
                        health.error.unwrap_or_default()
                    ),
                }
            }
            return Ok(());
        }

        Commands::Filter { input, output } => {
            let stats = filter_dataset(&input, &output)
                .with_context(|| format!("Failed to filter {input:?}"))?;

            println!("\n=== Filter Complete ===");
            println!("Rows:        {}", stats.total);
            println!("Kept:        {}", stats.kept);
            println!("Format:      {}", stats.invalid_format);
            println!("Answer:      {}", stats.incorrect_answer);
            println!("Output:      {output:?}");
        }

        Commands::Revalidate { input, output } => {
            let stats = revalidate_dataset(&input, &output, &TraceValidator::default())
                .with_context(|| format!("Failed to revalidate {input:?}"))?;

            println!("\n=== Revalidation Complete ===");
            println!("Rows:        {}", stats.total);
            println!("Valid:       {}", stats.valid);
            println!("Format:      {}", stats.invalid_format);
            println!("Answer:      {}", stats.incorrect_answer);
            println!("Changed:     {}", stats.changed);
            println!("Output:      {output:?}");
        }

        Commands::Distill {
            corpus,
            split,
            output,
            limit,
            samples,
            checkpoint,
            final_path,
        } => {
            let config = load_config(&cli.config)?;

            let Some(output) = output.or_else(|| config.output.path.clone()) else {
                bail!("No output path: pass --output or set output.path in config");
            };
            if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {parent:?}"))?;
            }

            let client = Arc::new(LlmClient::from_config(&config)?);
            let mut pipeline = DistillPipeline::from_config(client.clone(), &config)?;
            if let Some(samples) = samples {
                pipeline = pipeline.with_samples(samples);
            }

            let source = JsonlCorpus::from_config(&config.dataset).with_limit(limit);

            let checkpoint_mgr = match checkpoint.or_else(|| config.output.checkpoint_dir.clone()) {
                Some(dir) => Some(
                    CheckpointManager::for_output(&dir, &output)
                        .context("Failed to create checkpoint manager")?,
                ),
                None => None,
            };

            let stats = pipeline
                .distill(&source, &corpus, &split, &output, checkpoint_mgr)
                .await
                .with_context(|| format!("Distillation of {corpus}/{split} failed"))?;

            println!("\n=== Distillation Complete ===");
            println!("Records:     {}", stats.total_records);
            println!("Traces:      {}", stats.total_traces);
            println!("Valid:       {}", stats.valid);
            println!("Format:      {}", stats.invalid_format);
            println!("Answer:      {}", stats.incorrect_answer);
            println!("Truncated:   {}", stats.truncated);
            println!("Acceptance:  {:.1}%", stats.acceptance_rate * 100.0);
            println!("Throughput:  {:.0}/hr", stats.throughput_per_hour);
            println!("Runtime:     {:.1}s", stats.runtime_secs);

            let limits = client.rate_limiter().stats();
            println!(
                "Requests:    {} ({} rate limited, {:.1}s waited)",
                limits.total_requests, limits.total_429s, limits.total_wait_secs
            );
            println!("Output:      {output:?}");

            if let Some(final_path) = final_path.or_else(|| config.output.filtered_path.clone()) {
                let filtered = filter_dataset(&output, &final_path)
                    .with_context(|| format!("Failed to write final dataset {final_path:?}"))?;
                println!("Final:       {final_path:?} ({} rows)", filtered.kept);
            }
        }
    }

    Ok(())
}
