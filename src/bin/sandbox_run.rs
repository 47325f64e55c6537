//! Run one source file through the sandbox and print the result as JSON.
//!
//! Configuration comes from the environment (`PYTHON_DOCKER_IMAGE`,
//! `SANDBOX_RUNTIME`, ...); flags override the timeout.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use code_sandbox::prelude::*;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "sandbox-run", about = "Execute a file in the code sandbox")]
struct Args {
    /// Source file to execute.
    file: PathBuf,

    /// Language of the file (python, javascript).
    #[arg(short, long, default_value = "python")]
    language: String,

    /// Caller id used to namespace the workspace.
    #[arg(long, default_value = "cli")]
    caller: String,

    /// Wall-clock timeout in seconds.
    #[arg(long, env = "SANDBOX_TIMEOUT_SECS")]
    timeout: Option<u64>,

    /// Print the chat tool-result envelope instead of the full result.
    #[arg(long)]
    payload: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let source = std::fs::read_to_string(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;

    let mut config = SandboxConfig::from_env().context("invalid sandbox configuration")?;
    if let Some(secs) = args.timeout {
        config.timeout = Duration::from_secs(secs);
    }

    let manager = SandboxManager::new(config).context("failed to start sandbox manager")?;
    if let Err(e) = manager.check_runtime().await {
        tracing::warn!(error = %e, "isolation runtime health check failed");
    }

    let request_id = code_sandbox::RequestId::generate();
    let result = manager
        .execute_raw(request_id, &args.language, &source, &args.caller)
        .await;

    let output = if args.payload {
        result.to_tool_payload()
    } else {
        serde_json::to_value(&result)?
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    if result.is_success() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
