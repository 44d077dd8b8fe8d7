//! guestbox CLI entry point.
//!
//! Evaluates one script in the sandbox and prints the result to stdout.
//! Logs go to stderr.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use guestbox_common::{Backend, ConfigFile, LoggingConfig};
use guestbox_runtime::{EvalOptions, create_runtime};

#[derive(Debug, Parser)]
#[command(name = "guestbox", version, about = "Evaluate a script in a WebAssembly sandbox")]
struct Args {
    /// Script file to evaluate. Reads stdin when neither this nor `--eval`
    /// is given.
    script: Option<PathBuf>,

    /// Evaluate this code instead of a file.
    #[arg(short, long, conflicts_with = "script")]
    eval: Option<String>,

    /// TOML configuration file.
    #[arg(short, long, env = "GUESTBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Guest module to load instead of the embedded one.
    #[arg(long, env = "GUESTBOX_GUEST")]
    guest: Option<String>,

    /// Per-evaluation timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Use the in-process mock backend.
    #[arg(long)]
    mock: bool,

    /// Emit JSON log lines.
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(logging: &LoggingConfig, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .init();
}

fn read_script(args: &Args) -> anyhow::Result<String> {
    if let Some(code) = &args.eval {
        return Ok(code.clone());
    }
    match &args.script {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read script '{}'", path.display())),
        None => std::io::read_to_string(std::io::stdin()).context("Failed to read script from stdin"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_file = match &args.config {
        Some(path) => ConfigFile::from_file(path)?,
        None => ConfigFile::default(),
    };
    init_tracing(&config_file.logging, args.json_logs || config_file.logging.json);

    let mut config = config_file.runtime;
    if args.mock {
        config.backend = Backend::Mock;
    }
    if let Some(guest) = &args.guest {
        config.guest.path = Some(guest.clone());
    }

    let code = read_script(&args)?;
    debug!(bytes = code.len(), backend = ?config.backend, "Script loaded");

    let runtime = create_runtime(&config)?;
    runtime.init().await?;

    let mut options = EvalOptions::new();
    if let Some(ms) = args.timeout_ms {
        options = options.with_timeout(Duration::from_millis(ms));
    }

    let outcome = runtime.eval_with(&code, options).await;
    runtime.close().await?;

    let result = outcome?;
    info!(
        fuel_consumed = result.metrics.fuel_consumed,
        host_calls = result.metrics.host_calls,
        "Evaluation finished"
    );
    println!("{result}");

    Ok(())
}
