//! Operator Conductor - Command-Line Front End
//!
//! Loads configuration, builds the provider registry and drives the
//! orchestration core from the shell. Results are printed to stdout as JSON;
//! logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! # Ask a question, domain classified from the prompt
//! operator-conductor ask "Should I refinance my mortgage?"
//!
//! # Fan out to two providers and keep both answers
//! operator-conductor ask --domain financial --mode multi \
//!     --provider claude --provider grok "Outlook for AAPL?"
//!
//! # Show providers, chains and health
//! operator-conductor providers
//!
//! # Validate the configuration file
//! operator-conductor --config ./conductor.toml check-config
//!
//! # Verbose logging
//! RUST_LOG=operator_conductor=debug operator-conductor ask "..."
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use operator_conductor::{
    default_config_path, load_config_from_path, ConductorConfig, ConfigOverrides, Domain,
    ExecutionMode, HealthSnapshot, Orchestrator, ProviderId, TaskFailure, TaskRequest,
};

/// Operator Conductor - multi-provider task orchestration
#[derive(Parser, Debug)]
#[command(name = "operator-conductor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "OPERATOR_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Worker pool size
    #[arg(short = 'w', long, global = true, value_name = "N")]
    workers: Option<usize>,

    /// Per-call provider timeout in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    call_timeout_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, global = true, env = "OPERATOR_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit one task, wait for it and print the result
    Ask {
        /// Analysis domain (classified from the prompt if omitted)
        #[arg(short, long)]
        domain: Option<Domain>,

        /// Priority, higher runs first
        #[arg(short, long, default_value_t = 0, allow_hyphen_values = true)]
        priority: i32,

        /// single (first healthy provider) or multi (all providers)
        #[arg(short, long, default_value = "single")]
        mode: ExecutionMode,

        /// Provider to invoke, in order (repeatable); overrides the domain chain
        #[arg(long = "provider", value_name = "ID")]
        providers: Vec<String>,

        /// Give up after this many seconds
        #[arg(short, long, value_name = "SECS")]
        timeout_secs: Option<u64>,

        /// Optional system prompt
        #[arg(long)]
        system: Option<String>,

        /// Prompt text
        #[arg(required = true, num_args = 1..)]
        prompt: Vec<String>,
    },

    /// Print configured providers, domain chains and health
    Providers,

    /// Load and validate configuration, print the effective values
    CheckConfig,
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "operator_conductor={level},operator_conductor_daemon={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn load(args: &Args) -> Result<ConductorConfig> {
    let path = match args.config {
        Some(ref path) => {
            if !path.exists() {
                anyhow::bail!("Config file not found: {}", path.display());
            }
            Some(path.clone())
        }
        None => default_config_path(),
    };

    let mut config = load_config_from_path(path).context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(workers) = args.workers {
        overrides = overrides.with_workers(workers);
    }
    if let Some(ms) = args.call_timeout_ms {
        overrides = overrides.with_call_timeout_ms(ms);
    }
    overrides
        .apply(&mut config)
        .context("Invalid command-line override")?;

    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config = load(&args)?;
    info!(
        source = %config.source(),
        path = ?config.config_file_path,
        "Configuration loaded"
    );

    match args.command {
        Command::Ask {
            domain,
            priority,
            mode,
            providers,
            timeout_secs,
            system,
            prompt,
        } => {
            let mut request = TaskRequest::new(prompt.join(" "))
                .with_priority(priority)
                .with_mode(mode);
            if let Some(domain) = domain {
                request = request.with_domain(domain);
            }
            if let Some(system) = system {
                request.payload = request.payload.with_system(system);
            }
            for provider in providers {
                request = request.with_provider(provider);
            }
            if let Some(secs) = timeout_secs {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            ask(&config, request).await
        }
        Command::Providers => {
            providers(&config)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::CheckConfig => {
            check_config(&config)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

// ============================================================================
// Commands
// ============================================================================

#[derive(Serialize)]
struct FailureReport<'a> {
    task_id: &'a str,
    state: &'static str,
    error: String,
    temporarily_unavailable: bool,
    failure: &'a TaskFailure,
}

async fn ask(config: &ConductorConfig, request: TaskRequest) -> Result<ExitCode> {
    let registry = config.build_registry()?;
    if registry.is_empty() {
        anyhow::bail!(
            "No provider is available. Set an API key (e.g. ANTHROPIC_API_KEY) \
             or configure a provider with kind = \"echo\"."
        );
    }

    let orchestrator = Orchestrator::new(config.orchestrator.clone(), registry);
    orchestrator.start();

    let handle = orchestrator
        .submit(request)
        .context("Task was not accepted")?;
    info!(task_id = %handle.id(), domain = %handle.domain(), "Waiting for result");

    let outcome = tokio::select! {
        outcome = handle.wait() => outcome,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling task");
            if let Err(e) = orchestrator.cancel(handle.id()) {
                warn!(error = %e, "Cancel failed");
            }
            handle.wait().await
        }
    };

    orchestrator.shutdown().await;

    match outcome {
        Ok(result) => {
            print_json(&*result)?;
            Ok(ExitCode::SUCCESS)
        }
        Err(failure) => {
            print_json(&FailureReport {
                task_id: handle.id().as_str(),
                state: failure.terminal_state().label(),
                error: failure.to_string(),
                temporarily_unavailable: failure.is_transient(),
                failure: &failure,
            })?;
            Ok(ExitCode::FAILURE)
        }
    }
}

#[derive(Serialize)]
struct ProviderEntry<'a> {
    id: &'a ProviderId,
    kind: &'static str,
    model: &'a str,
}

#[derive(Serialize)]
struct ProvidersReport<'a> {
    providers: Vec<ProviderEntry<'a>>,
    chains: Vec<(Domain, Vec<ProviderId>)>,
    health: Vec<HealthSnapshot>,
}

fn providers(config: &ConductorConfig) -> Result<()> {
    let registry = config.build_registry()?;

    let chains = Domain::ALL
        .iter()
        .map(|&domain| (domain, registry.chain(domain).to_vec()))
        .collect();
    let report = ProvidersReport {
        providers: registry
            .providers()
            .map(|p| ProviderEntry {
                id: p.id(),
                kind: p.kind(),
                model: p.model(),
            })
            .collect(),
        chains,
        health: registry.health().snapshots(),
    };
    print_json(&report)
}

fn check_config(config: &ConductorConfig) -> Result<()> {
    let pool = &config.orchestrator;
    let retry = &pool.policy.retry;
    let health = &config.health;

    let report = serde_json::json!({
        "source": config.source().to_string(),
        "path": config.config_file_path,
        "pool": {
            "workers": pool.workers,
            "queue_capacity": pool.queue_capacity,
            "fan_out_limit": pool.policy.fan_out_limit,
            "call_timeout_ms": pool.policy.call_timeout.as_millis() as u64,
        },
        "retry": retry,
        "health": {
            "window_size": health.window_size,
            "window_secs": health.window.as_secs(),
            "failure_threshold": health.failure_threshold,
            "failure_rate_threshold": health.failure_rate_threshold,
            "min_samples": health.min_samples,
            "cooldown_secs": health.cooldown.as_secs(),
        },
        "providers": config.providers,
        "chains": config.chains,
    });
    print_json(&report)
}
