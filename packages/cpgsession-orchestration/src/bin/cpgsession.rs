//! cpgsession: code-analysis session service
//!
//! Usage:
//!   cpgsession serve [--config cpgsession.yaml]
//!   cpgsession check-config [--config cpgsession.yaml]
//!
//! `serve` reads one JSON request per line on stdin and writes one JSON
//! response per line on stdout. Logs go to stderr.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cpgsession_orchestration::config::AppConfig;
use cpgsession_orchestration::operations::handle_line;
use cpgsession_orchestration::service::ServiceBuilder;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cpgsession", version, about = "Code property graph analysis sessions")]
struct Cli {
    /// YAML config file (schema version 1)
    #[arg(long, short, global = true, env = "CPGSESSION_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Serve JSON-lines requests on stdin/stdout
    Serve,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let service = Arc::new(
        ServiceBuilder::new(config)
            .build()
            .await
            .context("failed to start analysis service")?,
    );
    service.start_reaper();

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            if stdout.write_all(line.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut in_flight = tokio::task::JoinSet::new();
    loop {
        while in_flight.try_join_next().is_some() {}
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let service = Arc::clone(&service);
                let tx = tx.clone();
                in_flight.spawn(async move {
                    let response = handle_line(&service, &line).await;
                    match serde_json::to_string(&response) {
                        Ok(mut json) => {
                            json.push('\n');
                            let _ = tx.send(json);
                        }
                        Err(e) => tracing::error!(error = %e, "failed to encode response"),
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt received");
                break;
            }
        }
    }

    while in_flight.join_next().await.is_some() {}
    drop(tx);
    let _ = writer.await;
    service.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("invalid configuration")?;
    init_tracing(&config.logging.level);

    match cli.command {
        Command::Serve => serve(config).await,
        Command::CheckConfig => {
            print!("{}", config.to_yaml()?);
            Ok(())
        }
    }
}
