//! Engine error parsing
//!
//! Turns the engine's free-form error text into a short message, a coarse
//! error type and structured `ErrorDetails` (location, offending object,
//! suggestions) that the editor can highlight.

use once_cell::sync::Lazy;
use regex::Regex;
use sqlrun_common::ErrorDetails;
use std::fmt;

/// Coarse error classification reported as `errorType`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Syntax,
    TableNotFound,
    ColumnNotFound,
    FunctionNotFound,
    AmbiguousColumn,
    TypeMismatch,
    Constraint,
    Resource,
    Transaction,
    Permission,
    Io,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Syntax => write!(f, "syntax_error"),
            ErrorKind::TableNotFound => write!(f, "table_not_found"),
            ErrorKind::ColumnNotFound => write!(f, "column_not_found"),
            ErrorKind::FunctionNotFound => write!(f, "function_not_found"),
            ErrorKind::AmbiguousColumn => write!(f, "ambiguous_column"),
            ErrorKind::TypeMismatch => write!(f, "type_mismatch"),
            ErrorKind::Constraint => write!(f, "constraint_violation"),
            ErrorKind::Resource => write!(f, "resource_exhausted"),
            ErrorKind::Transaction => write!(f, "transaction_error"),
            ErrorKind::Permission => write!(f, "permission_denied"),
            ErrorKind::Io => write!(f, "io_error"),
            ErrorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// A parsed engine error
#[derive(Debug, Clone)]
pub struct ParsedError {
    /// First line of the engine message, without the location pointer
    pub message: String,
    pub kind: ErrorKind,
    pub details: ErrorDetails,
    /// Optional hint for the user
    pub hint: Option<String>,
}

static LINE_POINTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(LINE (\d+):\s?)(.*)$").expect("valid regex"));
static QUOTED: Lazy<Regex> = Lazy::new(|| Regex::new(r#""([^"]+)""#).expect("valid regex"));
static TABLE_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:table with name ["']?([\w.]+)["']? does not exist|table ["']([^"']+)["'] does not exist|referenced table ["']([^"']+)["'] not found|view with name ["']?([\w.]+)["']? does not exist)"#,
    )
    .expect("valid regex")
});
static COLUMN_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)(?:referenced column ["']([^"']+)["'] not found|column with name ["']?([\w.]+)["']? does not exist|ambiguous reference to column name ["']([^"']+)["'])"#,
    )
    .expect("valid regex")
});

/// Parse a raw engine error against the SQL that produced it
pub fn parse_error(raw_error: &str, sql: &str) -> ParsedError {
    let lower = raw_error.to_lowercase();
    let mut details = ErrorDetails::default();

    if let Some((line, position, snippet)) = locate(raw_error) {
        details.line = Some(line);
        details.position = position;
        details.sql_snippet = Some(snippet);
    } else if let Some(snippet) = sql.lines().find(|l| !l.trim().is_empty()) {
        details.sql_snippet = Some(snippet.trim().to_string());
    }

    details.table_name = first_capture(&TABLE_NAME, raw_error);
    details.column_name = first_capture(&COLUMN_NAME, raw_error);

    let suggestions = suggestions(raw_error);
    if !suggestions.is_empty() {
        details.suggestions = Some(suggestions);
    }

    let (kind, hint) = classify(&lower, &details);

    ParsedError {
        message: core_message(raw_error),
        kind,
        details,
        hint: hint.map(str::to_string),
    }
}

fn classify(lower: &str, details: &ErrorDetails) -> (ErrorKind, Option<&'static str>) {
    if lower.contains("parser error") || lower.contains("syntax error") {
        return (
            ErrorKind::Syntax,
            Some("Check SQL syntax. Use single quotes for strings, double quotes for identifiers."),
        );
    }
    if lower.contains("ambiguous reference") {
        return (
            ErrorKind::AmbiguousColumn,
            Some("Qualify the column with its table name or alias."),
        );
    }
    if details.table_name.is_some()
        || (lower.contains("catalog error")
            && (lower.contains("table") || lower.contains("view"))
            && lower.contains("does not exist"))
    {
        return (
            ErrorKind::TableNotFound,
            Some("Verify the table name and schema. Use SHOW TABLES to list available tables."),
        );
    }
    if details.column_name.is_some() {
        return (
            ErrorKind::ColumnNotFound,
            Some("Verify column name. Use DESCRIBE table_name to see available columns."),
        );
    }
    if lower.contains("function") && (lower.contains("does not exist") || lower.contains("no function matches")) {
        return (
            ErrorKind::FunctionNotFound,
            Some("Check the function name and argument types."),
        );
    }
    if lower.contains("conversion error")
        || lower.contains("could not convert")
        || lower.contains("type mismatch")
        || lower.contains("binder error")
    {
        return (
            ErrorKind::TypeMismatch,
            Some("Use explicit CAST(value AS type) to convert between types."),
        );
    }
    if lower.contains("constraint error") || lower.contains("violates") || lower.contains("duplicate key") {
        return (ErrorKind::Constraint, None);
    }
    if lower.contains("out of memory") || lower.contains("memory limit") {
        return (
            ErrorKind::Resource,
            Some("Reduce result size with LIMIT or add filters in the WHERE clause."),
        );
    }
    if lower.contains("transaction") {
        return (
            ErrorKind::Transaction,
            Some("Transaction was aborted. Use ROLLBACK to clear state."),
        );
    }
    if lower.contains("permission denied") || lower.contains("access denied") {
        return (ErrorKind::Permission, None);
    }
    if lower.contains("io error") {
        return (
            ErrorKind::Io,
            Some("Check if the data path exists and you have access permissions."),
        );
    }
    (ErrorKind::Unknown, None)
}

/// Find `LINE n: <sql>` followed by a caret line.
///
/// Returns the line number, the 1-based column of the caret within the
/// echoed SQL and the echoed SQL itself.
fn locate(raw_error: &str) -> Option<(u32, Option<u32>, String)> {
    let caps = LINE_POINTER.captures(raw_error)?;
    let whole = caps.get(0)?;
    let prefix_len = caps.get(1)?.as_str().chars().count();
    let line: u32 = caps.get(2)?.as_str().parse().ok()?;
    let snippet = caps.get(3)?.as_str().trim_end().to_string();

    let position = raw_error[whole.end()..]
        .lines()
        .nth(1)
        .and_then(|caret_line| caret_line.find('^'))
        .and_then(|caret| caret.checked_sub(prefix_len))
        .map(|col| col as u32 + 1);

    Some((line, position, snippet))
}

fn first_capture(re: &Regex, text: &str) -> Option<String> {
    let caps = re.captures(text)?;
    caps.iter()
        .skip(1)
        .flatten()
        .next()
        .map(|m| m.as_str().trim_end_matches('!').to_string())
}

fn suggestions(raw_error: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for line in raw_error.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("Did you mean") || trimmed.starts_with("Candidate bindings") {
            for caps in QUOTED.captures_iter(trimmed) {
                let name = caps[1].to_string();
                if !found.contains(&name) {
                    found.push(name);
                }
            }
        }
    }
    found
}

/// Extract the core message from a verbose error string
fn core_message(raw_error: &str) -> String {
    let mut msg = raw_error.trim().to_string();

    // Keep the error, not the pointer or the hints
    for marker in ["\n\nLINE", "\nLINE", "\nDid you mean", "\nCandidate bindings"] {
        if let Some(pos) = msg.find(marker) {
            msg.truncate(pos);
        }
    }
    let msg = msg.trim().to_string();

    if msg.chars().count() > 500 {
        let cut: String = msg.chars().take(497).collect();
        return format!("{}...", cut);
    }
    msg
}
