use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use trellis_core::config::{
    default_config_path, default_data_dir, resolve_relative_to, AppConfig,
};
use trellis_core::logging::{init_logging, LoggingOptions};
use trellis_core::server::{app_router, AppState};
use trellis_core::{build_default_registry, execute, ExecutorOptions, RunStatus, WorkflowGraph};

#[derive(Parser)]
#[command(name = "trellis", version, about = "Typed DAG workflow engine")]
struct Cli {
    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Explicit tracing filter, e.g. "trellis_core=debug".
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the HTTP service.
    Serve {
        /// Bind host, overrides the config file.
        #[arg(long)]
        host: Option<String>,

        /// Bind port, overrides the config file.
        #[arg(long)]
        port: Option<u16>,

        /// Path to config.toml.
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Execute a workflow JSON file and print its result store.
    Run {
        /// Workflow JSON file (bare graph or {"workflow": ...} envelope).
        file: PathBuf,

        /// Pretty-print the result JSON.
        #[arg(long)]
        pretty: bool,
    },

    /// Validate a workflow JSON file against the node registry.
    Validate {
        /// Workflow JSON file.
        file: PathBuf,
    },
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let logging = LoggingOptions {
        verbose: cli.verbose,
        log_filter: cli.log_filter.clone(),
        log_dir: None,
    };

    match cli.command {
        Command::Serve { host, port, config } => serve(logging, host, port, config).await,
        Command::Run { file, pretty } => {
            let _guard = init_logging(&logging);
            run_workflow_file(&file, pretty).await
        }
        Command::Validate { file } => {
            let _guard = init_logging(&logging);
            validate_workflow_file(&file)
        }
    }
}

async fn serve(
    mut logging: LoggingOptions,
    host: Option<String>,
    port: Option<u16>,
    config_path: Option<PathBuf>,
) -> Result<()> {
    let data_dir = default_data_dir();
    let config_path = config_path.unwrap_or_else(|| default_config_path(&data_dir));
    let mut config = AppConfig::load_from_path(&config_path)?;

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    logging.log_dir = Some(resolve_relative_to(&data_dir, &config.paths.logs_dir));
    let _guard = init_logging(&logging);

    let workflows_dir = resolve_relative_to(&data_dir, &config.paths.workflows_dir);
    let registry = Arc::new(build_default_registry());
    let state = AppState::new(registry, config.clone(), workflows_dir);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, "trellis service listening");

    axum::serve(listener, app_router(state))
        .await
        .context("server error")?;
    Ok(())
}

fn load_graph(file: &PathBuf) -> Result<WorkflowGraph> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", file.display()))?;

    // Accept the saved-workflow envelope as well as a bare graph.
    let value = match value.get("workflow") {
        Some(inner) if inner.get("nodes").is_some() => inner.clone(),
        _ => value,
    };

    serde_json::from_value(value).with_context(|| format!("invalid workflow in {}", file.display()))
}

async fn run_workflow_file(file: &PathBuf, pretty: bool) -> Result<()> {
    let graph = load_graph(file)?;
    let registry = Arc::new(build_default_registry());

    let report = execute(&graph, registry, ExecutorOptions::default()).await?;

    let output = serde_json::json!({
        "run_id": report.run_id,
        "status": report.status,
        "result": report.results,
        "error": report.error,
    });
    let rendered = if pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{rendered}");

    if report.status != RunStatus::Completed {
        bail!("run finished with status {:?}", report.status);
    }
    Ok(())
}

fn validate_workflow_file(file: &PathBuf) -> Result<()> {
    let graph = load_graph(file)?;
    let registry = build_default_registry();

    graph
        .validate(&registry)
        .with_context(|| format!("workflow {} is invalid", file.display()))?;

    println!("workflow is valid ({} nodes)", graph.node_count());
    Ok(())
}
