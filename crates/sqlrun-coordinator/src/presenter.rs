//! Console rendering of run events

use serde_json::Value;
use sqlrun_common::{ColumnInfo, ErrorDetails, Row};
use std::collections::HashMap;
use std::io::{self, Write};
use tokio::sync::mpsc;

use crate::run::{CancelReason, MessageResult, RunEvent};

/// Cell text is cut to this many characters
const MAX_CELL_WIDTH: usize = 40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable tables
    Table,
    /// One serialized event per line
    JsonLines,
}

#[derive(Default)]
struct ResultView {
    statement_index: usize,
    sql: String,
    columns: Vec<ColumnInfo>,
}

/// Writes run events to a terminal or pipe
pub struct ConsolePresenter<W: Write> {
    out: W,
    format: OutputFormat,
    results: HashMap<String, ResultView>,
}

impl<W: Write> ConsolePresenter<W> {
    pub fn new(out: W, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            results: HashMap::new(),
        }
    }

    /// Render events until every sender is gone
    pub async fn run(mut self, mut events: mpsc::UnboundedReceiver<RunEvent>) -> io::Result<W> {
        while let Some(event) = events.recv().await {
            self.present(&event)?;
        }
        Ok(self.out)
    }

    pub fn present(&mut self, event: &RunEvent) -> io::Result<()> {
        match self.format {
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut self.out, event)?;
                writeln!(self.out)?;
            }
            OutputFormat::Table => self.render(event)?,
        }
        self.out.flush()
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn render(&mut self, event: &RunEvent) -> io::Result<()> {
        match event {
            RunEvent::RunStarted {
                statement_count, ..
            } => {
                if *statement_count == 0 {
                    writeln!(self.out, "Nothing to execute")?;
                }
            }
            RunEvent::ResultPending {
                result_handle,
                statement_index,
                sql,
                ..
            } => {
                self.results.insert(
                    result_handle.clone(),
                    ResultView {
                        statement_index: *statement_index,
                        sql: sql.clone(),
                        columns: Vec::new(),
                    },
                );
            }
            RunEvent::ResultStarted { result_handle, .. } => {
                if let Some(view) = self.results.get(result_handle) {
                    writeln!(
                        self.out,
                        "[{}] {}",
                        view.statement_index,
                        first_line(&view.sql)
                    )?;
                }
            }
            RunEvent::ResultSchema {
                result_handle,
                columns,
                ..
            } => {
                if let Some(view) = self.results.get_mut(result_handle) {
                    view.columns = columns.clone();
                }
            }
            RunEvent::ResultRows {
                result_handle,
                rows,
                truncated,
                ..
            } => {
                let columns = self
                    .results
                    .get(result_handle)
                    .map(|view| view.columns.clone())
                    .unwrap_or_default();
                write_table(&mut self.out, &columns, rows)?;
                if *truncated {
                    writeln!(self.out, "(result truncated)")?;
                }
            }
            RunEvent::ResultComplete {
                result_handle,
                row_count,
                execution_time_ms,
                message,
                ..
            } => {
                self.results.remove(result_handle);
                match message {
                    Some(MessageResult { rows, .. }) => {
                        let text = rows
                            .first()
                            .and_then(|row| row.get("message"))
                            .map(cell_text)
                            .unwrap_or_default();
                        writeln!(self.out, "{}{}", text, timing(*execution_time_ms))?;
                    }
                    None => {
                        let rows = row_count.unwrap_or(0);
                        let noun = if rows == 1 { "row" } else { "rows" };
                        writeln!(self.out, "({} {}{})", rows, noun, timing(*execution_time_ms))?;
                    }
                }
                writeln!(self.out)?;
            }
            RunEvent::ResultError {
                result_handle,
                message,
                error_type,
                details,
                ..
            } => {
                self.results.remove(result_handle);
                match error_type {
                    Some(kind) => writeln!(self.out, "ERROR ({}): {}", kind, message)?,
                    None => writeln!(self.out, "ERROR: {}", message)?,
                }
                if let Some(details) = details {
                    write_details(&mut self.out, details)?;
                }
                writeln!(self.out)?;
            }
            RunEvent::ResultCancelled {
                result_handle,
                statement_index,
                reason,
                ..
            } => {
                self.results.remove(result_handle);
                let why = match reason {
                    CancelReason::BatchAborted => "skipped after an earlier error",
                    CancelReason::RunCancelled => "cancelled",
                    CancelReason::SessionUnavailable => "not run, no session",
                };
                writeln!(self.out, "[{}] {}", statement_index, why)?;
            }
            RunEvent::RunComplete {
                succeeded,
                failed,
                cancelled,
                ..
            } => {
                if *failed > 0 || *cancelled > 0 {
                    writeln!(
                        self.out,
                        "{} succeeded, {} failed, {} skipped",
                        succeeded, failed, cancelled
                    )?;
                }
            }
            RunEvent::RunError { message, .. } => {
                writeln!(self.out, "Run failed: {}", message)?;
            }
            RunEvent::RunCancelled {
                session_state_lost, ..
            } => {
                if *session_state_lost {
                    writeln!(
                        self.out,
                        "Run cancelled. The session was restarted and its temporary tables are gone."
                    )?;
                } else {
                    writeln!(self.out, "Run cancelled.")?;
                }
            }
        }
        Ok(())
    }
}

fn first_line(sql: &str) -> String {
    let line = sql.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    if sql.trim().lines().count() > 1 {
        format!("{} ...", line)
    } else {
        line.to_string()
    }
}

fn timing(execution_time_ms: Option<u64>) -> String {
    execution_time_ms
        .map(|ms| format!(", {} ms", ms))
        .unwrap_or_default()
}

fn cell_text(value: &Value) -> String {
    let text = match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() > MAX_CELL_WIDTH {
        let cut: String = text.chars().take(MAX_CELL_WIDTH - 3).collect();
        format!("{}...", cut)
    } else {
        text
    }
}

fn write_table<W: Write>(out: &mut W, columns: &[ColumnInfo], rows: &[Row]) -> io::Result<()> {
    let names: Vec<String> = if columns.is_empty() {
        rows.first()
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    } else {
        columns.iter().map(|c| c.name.clone()).collect()
    };
    if names.is_empty() {
        return Ok(());
    }

    let cells: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            names
                .iter()
                .map(|name| row.get(name).map(cell_text).unwrap_or_default())
                .collect()
        })
        .collect();

    let widths: Vec<usize> = names
        .iter()
        .enumerate()
        .map(|(i, name)| {
            cells
                .iter()
                .map(|row| row[i].chars().count())
                .chain(std::iter::once(name.chars().count()))
                .max()
                .unwrap_or(0)
        })
        .collect();

    let line = |values: &[String]| -> String {
        values
            .iter()
            .zip(&widths)
            .map(|(value, width)| format!(" {:<width$} ", value, width = *width))
            .collect::<Vec<_>>()
            .join("|")
            .trim_end()
            .to_string()
    };

    writeln!(out, "{}", line(&names))?;
    writeln!(
        out,
        "{}",
        widths
            .iter()
            .map(|w| "-".repeat(w + 2))
            .collect::<Vec<_>>()
            .join("+")
    )?;
    for row in &cells {
        writeln!(out, "{}", line(row))?;
    }
    Ok(())
}

fn write_details<W: Write>(out: &mut W, details: &ErrorDetails) -> io::Result<()> {
    if let Some(line) = details.line {
        match details.position {
            Some(position) => writeln!(out, "  at line {}, position {}", line, position)?,
            None => writeln!(out, "  at line {}", line)?,
        }
    }
    if let Some(snippet) = &details.sql_snippet {
        writeln!(out, "  {}", snippet)?;
        if let Some(position) = details.position.filter(|p| *p > 0) {
            writeln!(out, "  {}^", " ".repeat(position as usize - 1))?;
        }
    }
    if let Some(table) = &details.table_name {
        writeln!(out, "  table: {}", table)?;
    }
    if let Some(column) = &details.column_name {
        writeln!(out, "  column: {}", column)?;
    }
    if let Some(suggestions) = details.suggestions.as_ref().filter(|s| !s.is_empty()) {
        writeln!(out, "  did you mean: {}", suggestions.join(", "))?;
    }
    Ok(())
}
