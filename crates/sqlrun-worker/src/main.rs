//! sqlrun worker
//!
//! One process per editor session. Speaks newline-delimited JSON on
//! stdin/stdout and keeps a single DuckDB connection open between
//! statements, so temporary tables survive for the life of the process.
//! Logs go to stderr; stdout carries nothing but protocol lines.

mod errors;
mod executor;
mod service;

use crate::executor::{ExecutorConfig, Mode, SqlExecutor};
use clap::Parser;
use std::io::{self, BufWriter};
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sqlrun-worker")]
#[command(about = "sqlrun worker process (line-delimited JSON over stdio)")]
struct Args {
    /// Database backend
    #[arg(long, env = "SQLRUN_WORKER_BACKEND", value_enum, default_value = "mock")]
    backend: Mode,

    /// Log level
    #[arg(long, env = "SQLRUN_WORKER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Delay before answering CONNECT, in milliseconds
    #[arg(long, env = "SQLRUN_WORKER_CONNECT_DELAY_MS", default_value = "0")]
    connect_delay_ms: u64,

    /// Sleep for mock statements containing SLOW_QUERY, in milliseconds
    #[arg(long, env = "SQLRUN_WORKER_SLOW_QUERY_MS", default_value = "10000")]
    slow_query_ms: u64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // stdout is the protocol channel
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(io::stderr)
        .with_ansi(false)
        .init();

    info!(backend = ?args.backend, pid = std::process::id(), "Starting sqlrun worker");

    let mut executor = SqlExecutor::new(ExecutorConfig {
        mode: args.backend,
        connect_delay: Duration::from_millis(args.connect_delay_ms),
        slow_query: Duration::from_millis(args.slow_query_ms),
    });

    let stdin = io::stdin();
    let stdout = io::stdout();
    service::serve(stdin.lock(), BufWriter::new(stdout.lock()), &mut executor)?;

    info!("Worker exiting");
    Ok(())
}
