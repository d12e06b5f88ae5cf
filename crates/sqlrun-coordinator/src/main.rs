//! sqlrun
//!
//! Executes SQL files, or statements typed at a prompt, through a worker
//! session per file. Temp tables live as long as the file's session.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sqlrun_common::{AppConfig, Backend};
use sqlrun_coordinator::{
    telemetry, ConsolePresenter, OutputFormat, ParsedStatement, ProcessLauncher, RunCoordinator,
    RunStatus, RunSummary, SemicolonSplitter, SessionOptions, SessionRegistry, StatementParser,
};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "sqlrun")]
#[command(about = "Run SQL through per-file worker sessions")]
struct Cli {
    /// Configuration file (default: sqlrun.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Worker executable
    #[arg(long, global = true)]
    worker: Option<PathBuf>,

    /// Worker backend: mock, duckdb or external
    #[arg(long, global = true)]
    backend: Option<Backend>,

    /// Data source passed to the worker on connect
    #[arg(long, global = true)]
    dsn: Option<String>,

    /// Row cap for every result
    #[arg(long, global = true)]
    max_rows: Option<usize>,

    /// Print events as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// Log level
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a SQL file as one run
    Exec {
        file: PathBuf,

        /// Byte range to execute, e.g. 120..180
        #[arg(long, value_parser = parse_selection)]
        selection: Option<Range<usize>>,
    },
    /// Read statements from stdin; each `;`-terminated chunk is one run
    Repl {
        /// Session key shared by every statement typed
        #[arg(long, default_value = "repl")]
        file_key: String,
    },
}

impl Cli {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(worker) = &self.worker {
            config.worker.program = Some(worker.clone());
        }
        if let Some(backend) = self.backend {
            config.worker.backend = backend;
        }
        if let Some(dsn) = &self.dsn {
            config.dsn = dsn.clone();
        }
        if let Some(max_rows) = self.max_rows {
            config.max_rows = Some(max_rows);
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
    }
}

fn parse_selection(s: &str) -> std::result::Result<Range<usize>, String> {
    let (start, end) = s
        .split_once("..")
        .ok_or_else(|| format!("expected START..END, got '{}'", s))?;
    let start: usize = start.trim().parse().map_err(|e| format!("bad start: {}", e))?;
    let end: usize = end.trim().parse().map_err(|e| format!("bad end: {}", e))?;
    if end < start {
        return Err(format!("selection end {} is before start {}", end, start));
    }
    Ok(start..end)
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let mut config = AppConfig::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;

    telemetry::init(&config.log_level, config.json_logs)?;

    let launcher = ProcessLauncher::from_settings(&config.worker);
    info!(
        worker = %launcher.program().display(),
        backend = %config.worker.backend,
        max_sessions = config.max_sessions,
        "Starting sqlrun"
    );

    let registry = SessionRegistry::new(
        Arc::new(launcher),
        SessionOptions {
            dsn: config.dsn.clone(),
            max_rows: config.max_rows,
        },
        config.max_sessions,
    );
    let (coordinator, events) = RunCoordinator::new(registry.clone());

    let format = if cli.json {
        OutputFormat::JsonLines
    } else {
        OutputFormat::Table
    };
    let presenter = tokio::spawn(ConsolePresenter::new(std::io::stdout(), format).run(events));

    let outcome = match &cli.command {
        Commands::Exec { file, selection } => exec(&coordinator, file, selection.clone()).await,
        Commands::Repl { file_key } => repl(&coordinator, file_key).await,
    };

    registry.close_all().await;
    // Last sender gone: the presenter drains and stops
    drop(coordinator);
    presenter.await?.context("writing output")?;

    let status = outcome?;
    Ok(if status == RunStatus::Completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn exec(
    coordinator: &RunCoordinator,
    file: &Path,
    selection: Option<Range<usize>>,
) -> Result<RunStatus> {
    let document = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let statements = SemicolonSplitter::new().parse(&document, selection);
    let file_key = file
        .canonicalize()
        .unwrap_or_else(|_| file.to_path_buf())
        .display()
        .to_string();

    let summary = run_interruptible(coordinator, &file_key, statements).await?;
    Ok(summary.status)
}

async fn repl(coordinator: &RunCoordinator, file_key: &str) -> Result<RunStatus> {
    let splitter = SemicolonSplitter::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut buffer = String::new();
    let mut last = RunStatus::Completed;

    info!(session = %file_key, "Reading statements; \\reconnect to reconnect, \\q to quit");

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };
        if buffer.trim().is_empty() {
            match line.trim() {
                "\\q" | "\\quit" => break,
                "\\reconnect" => {
                    match coordinator.reconnect(file_key).await {
                        Ok(result) => info!(
                            session = %file_key,
                            message = result.message.as_deref().unwrap_or("Reconnected"),
                            "Reconnect finished"
                        ),
                        Err(e) => warn!(session = %file_key, error = %e, "Reconnect failed"),
                    }
                    continue;
                }
                _ => {}
            }
        }

        buffer.push_str(&line);
        buffer.push('\n');
        if !buffer.trim_end().ends_with(';') {
            continue;
        }

        let statements = splitter.parse(&buffer, None);
        buffer.clear();
        last = run_interruptible(coordinator, file_key, statements).await?.status;
    }

    Ok(last)
}

/// Run to completion; Ctrl-C cancels the run and its session
async fn run_interruptible(
    coordinator: &RunCoordinator,
    file_key: &str,
    statements: Vec<ParsedStatement>,
) -> Result<RunSummary> {
    let (run_id, mut task) = coordinator.spawn_run(file_key, statements);
    tokio::select! {
        summary = &mut task => Ok(summary?),
        _ = tokio::signal::ctrl_c() => {
            warn!(run_id = %run_id, "Interrupted; cancelling run");
            coordinator.cancel_run(&run_id);
            Ok(task.await?)
        }
    }
}
