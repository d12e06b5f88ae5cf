//! DuckDB statement executor
//!
//! Owns the worker's single database connection. Every method answers with
//! a protocol payload instead of an error so the command loop can always
//! reply to the coordinator.

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime};
use duckdb::arrow::datatypes::DataType;
use duckdb::types::{TimeUnit, Value};
use duckdb::{params, Connection};
use serde_json::{json, Value as JsonValue};
use sqlrun_common::{ColumnInfo, ConnectResult, ExecuteResult, ReconnectResult, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::errors::parse_error;

/// Which database the worker opens on CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// In-memory database seeded with sample tables; the DSN is ignored
    Mock,
    /// DSN is a DuckDB database path (`:memory:` for in-memory)
    Duckdb,
}

/// Executor configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub mode: Mode,
    /// Artificial delay before CONNECT answers
    pub connect_delay: Duration,
    /// Sleep applied to mock statements containing `SLOW_QUERY`
    pub slow_query: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Mock,
            connect_delay: Duration::ZERO,
            slow_query: Duration::from_secs(10),
        }
    }
}

/// First keywords of statements that produce a row set
const ROW_RETURNING: &[&str] = &[
    "SELECT", "WITH", "VALUES", "FROM", "TABLE", "SHOW", "DESCRIBE", "DESC", "SUMMARIZE",
    "EXPLAIN", "PRAGMA", "CALL",
];

const MOCK_SEED: &str = r#"
CREATE TABLE people (
    id INTEGER PRIMARY KEY,
    name VARCHAR NOT NULL,
    age INTEGER,
    email VARCHAR,
    department VARCHAR
);
INSERT INTO people VALUES
    (1, 'Alice', 30, 'alice@example.com', 'Engineering'),
    (2, 'Bob', 25, 'bob@example.com', 'Sales'),
    (3, 'Charlie', 35, 'charlie@example.com', 'Engineering'),
    (4, 'Diana', 28, 'diana@example.com', 'Marketing'),
    (5, 'Eve', 32, 'eve@example.com', 'Engineering'),
    (6, 'Frank', 29, 'frank@example.com', 'Sales'),
    (7, 'Grace', 26, 'grace@example.com', 'HR'),
    (8, 'Henry', 31, 'henry@example.com', 'Engineering'),
    (9, 'Ivy', 27, 'ivy@example.com', 'Marketing'),
    (10, 'Jack', 33, 'jack@example.com', 'Sales');

CREATE TABLE products (
    id INTEGER PRIMARY KEY,
    name VARCHAR NOT NULL,
    category VARCHAR,
    price DOUBLE,
    stock INTEGER
);
INSERT INTO products VALUES
    (1, 'Laptop', 'Electronics', 999.99, 50),
    (2, 'Mouse', 'Electronics', 29.99, 200),
    (3, 'Keyboard', 'Electronics', 79.99, 150),
    (4, 'Monitor', 'Electronics', 299.99, 75),
    (5, 'Desk Chair', 'Furniture', 249.99, 30),
    (6, 'Desk', 'Furniture', 399.99, 20),
    (7, 'Notebook', 'Stationery', 4.99, 500),
    (8, 'Pen Set', 'Stationery', 12.99, 300),
    (9, 'Water Bottle', 'Accessories', 19.99, 100),
    (10, 'Backpack', 'Accessories', 49.99, 80);

CREATE TABLE sales (
    id INTEGER PRIMARY KEY,
    product_id INTEGER REFERENCES products(id),
    quantity INTEGER,
    sale_date DATE,
    revenue DOUBLE
);
INSERT INTO sales VALUES
    (1, 1, 5, DATE '2024-01-15', 4999.95),
    (2, 2, 20, DATE '2024-01-16', 599.80),
    (3, 3, 10, DATE '2024-01-17', 799.90),
    (4, 1, 3, DATE '2024-01-18', 2999.97),
    (5, 5, 2, DATE '2024-01-19', 499.98),
    (6, 7, 50, DATE '2024-01-20', 249.50),
    (7, 8, 30, DATE '2024-01-21', 389.70),
    (8, 4, 5, DATE '2024-01-22', 1499.95),
    (9, 6, 1, DATE '2024-01-23', 399.99),
    (10, 9, 10, DATE '2024-01-24', 199.90);

CREATE TABLE DW_SITES (
    site_id INTEGER PRIMARY KEY,
    site_name VARCHAR NOT NULL,
    region VARCHAR,
    active BOOLEAN DEFAULT true
);
INSERT INTO DW_SITES VALUES
    (1, 'Site A', 'North', true),
    (2, 'Site B', 'South', true),
    (3, 'Site C', 'East', false),
    (4, 'Site D', 'West', true),
    (5, 'Site E', 'North', true);

CREATE VIEW active_sites AS SELECT * FROM DW_SITES WHERE active;
"#;

/// Single-connection statement executor
pub struct SqlExecutor {
    config: ExecutorConfig,
    connection: Option<Connection>,
    /// DSN of the last successful CONNECT, reused by RECONNECT
    dsn: Option<String>,
}

impl SqlExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self {
            config,
            connection: None,
            dsn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Open (or reopen) the database for `dsn`
    #[instrument(skip(self))]
    pub fn connect(&mut self, dsn: &str) -> ConnectResult {
        if !self.config.connect_delay.is_zero() {
            info!(delay_ms = self.config.connect_delay.as_millis() as u64, "Delaying connect");
            std::thread::sleep(self.config.connect_delay);
        }

        match self.open(dsn) {
            Ok(connection) => {
                self.connection = Some(connection);
                self.dsn = Some(dsn.to_string());
                let message = match self.config.mode {
                    Mode::Mock => "Connected to mock database (in-memory DuckDB)".to_string(),
                    Mode::Duckdb => format!("Connected to {}", dsn),
                };
                info!("{}", message);
                ConnectResult {
                    success: true,
                    message: Some(message),
                    ..Default::default()
                }
            }
            Err(e) => {
                warn!(error = %e, "Connect failed");
                ConnectResult {
                    success: false,
                    error: Some(e.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    fn open(&self, dsn: &str) -> duckdb::Result<Connection> {
        match self.config.mode {
            Mode::Mock => {
                let connection = Connection::open_in_memory()?;
                connection.execute_batch(MOCK_SEED)?;
                debug!("Seeded mock tables");
                Ok(connection)
            }
            Mode::Duckdb => {
                if dsn.is_empty() || dsn == ":memory:" {
                    Connection::open_in_memory()
                } else {
                    Connection::open(dsn)
                }
            }
        }
    }

    /// Execute one statement and build the EXECUTE_RESULT payload
    #[instrument(skip(self, sql), fields(sql_len = sql.len()))]
    pub fn execute(
        &mut self,
        sql: &str,
        result_set_id: &str,
        max_rows: Option<usize>,
    ) -> ExecuteResult {
        let Some(connection) = self.connection.as_ref() else {
            return ExecuteResult::failure(result_set_id, "Not connected");
        };

        let start = Instant::now();
        if self.config.mode == Mode::Mock && sql.to_uppercase().contains("SLOW_QUERY") {
            info!(sleep_ms = self.config.slow_query.as_millis() as u64, "Simulating slow query");
            std::thread::sleep(self.config.slow_query);
        }

        let outcome = if returns_rows(sql) {
            fetch(connection, sql, result_set_id, max_rows)
        } else {
            connection
                .execute(sql, params![])
                .map(|affected| ExecuteResult::statement_done(result_set_id, affected as u64))
        };

        let mut result = match outcome {
            Ok(result) => result,
            Err(e) => {
                let raw = e.to_string();
                let parsed = parse_error(&raw, sql);
                debug!(error_type = %parsed.kind, "Statement failed");
                ExecuteResult {
                    success: false,
                    result_set_id: result_set_id.to_string(),
                    error: Some(parsed.message),
                    message: parsed.hint,
                    error_type: Some(parsed.kind.to_string()),
                    error_details: (!parsed.details.is_empty()).then_some(parsed.details),
                    raw_error: Some(raw),
                    ..Default::default()
                }
            }
        };
        result.execution_time_ms = Some(start.elapsed().as_millis() as u64);
        result
    }

    /// Probe the connection, reopening it when the probe fails
    #[instrument(skip(self))]
    pub fn reconnect(&mut self) -> ReconnectResult {
        let alive = self
            .connection
            .as_ref()
            .map(|c| c.query_row("SELECT 1", [], |row| row.get::<_, i32>(0)).is_ok())
            .unwrap_or(false);
        if alive {
            return ReconnectResult {
                success: true,
                message: Some("Connection is alive".into()),
                error: None,
            };
        }

        let Some(dsn) = self.dsn.clone() else {
            return ReconnectResult {
                success: false,
                message: None,
                error: Some("Not connected".into()),
            };
        };
        self.close();
        match self.open(&dsn) {
            Ok(connection) => {
                info!("Reconnected");
                self.connection = Some(connection);
                ReconnectResult {
                    success: true,
                    message: Some("Reconnected".into()),
                    error: None,
                }
            }
            Err(e) => ReconnectResult {
                success: false,
                message: None,
                error: Some(e.to_string()),
            },
        }
    }

    pub fn close(&mut self) {
        if let Some(connection) = self.connection.take() {
            if let Err((_, e)) = connection.close() {
                warn!(error = %e, "Error closing connection");
            }
        }
    }
}

/// Whether a statement yields a row set, judged by its first keyword
pub fn returns_rows(sql: &str) -> bool {
    let body = skip_leading_comments(sql);
    if body.starts_with('(') {
        return true;
    }
    let keyword: String = body
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect::<String>()
        .to_ascii_uppercase();
    ROW_RETURNING.contains(&keyword.as_str())
}

fn skip_leading_comments(sql: &str) -> &str {
    let mut rest = sql.trim_start();
    loop {
        if let Some(line_comment) = rest.strip_prefix("--") {
            rest = match line_comment.find('\n') {
                Some(end) => line_comment[end + 1..].trim_start(),
                None => "",
            };
        } else if let Some(block) = rest.strip_prefix("/*") {
            rest = match block.find("*/") {
                Some(end) => block[end + 2..].trim_start(),
                None => "",
            };
        } else {
            return rest;
        }
    }
}

fn fetch(
    connection: &Connection,
    sql: &str,
    result_set_id: &str,
    max_rows: Option<usize>,
) -> duckdb::Result<ExecuteResult> {
    let mut stmt = connection.prepare(sql)?;
    let mut rows = stmt.query([])?;

    let columns: Vec<ColumnInfo> = match rows.as_ref() {
        Some(stmt) => stmt
            .column_names()
            .into_iter()
            .enumerate()
            .map(|(i, name)| ColumnInfo::new(name, display_type(&stmt.column_type(i))))
            .collect(),
        None => Vec::new(),
    };

    let mut out: Vec<Row> = Vec::new();
    let mut truncated = false;
    while let Some(row) = rows.next()? {
        if max_rows.is_some_and(|max| out.len() >= max) {
            truncated = true;
            break;
        }
        let mut record = Row::new();
        for (i, column) in columns.iter().enumerate() {
            let value: Value = row.get(i)?;
            record.insert(column.name.clone(), to_json(value));
        }
        out.push(record);
    }

    let mut result = ExecuteResult::with_rows(result_set_id, columns, out);
    if truncated {
        result.truncated = Some(true);
    }
    Ok(result)
}

/// Map an engine column type onto the display types the editor knows
fn display_type(data_type: &DataType) -> &'static str {
    match data_type {
        DataType::Int8
        | DataType::Int16
        | DataType::Int32
        | DataType::Int64
        | DataType::UInt8
        | DataType::UInt16
        | DataType::UInt32
        | DataType::UInt64
        | DataType::Float16
        | DataType::Float32
        | DataType::Float64
        | DataType::Decimal128(_, _)
        | DataType::Decimal256(_, _) => "number",
        DataType::Boolean => "boolean",
        DataType::Date32
        | DataType::Date64
        | DataType::Timestamp(_, _)
        | DataType::Time32(_)
        | DataType::Time64(_) => "date",
        _ => "string",
    }
}

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn to_json(value: Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Boolean(b) => json!(b),
        Value::TinyInt(v) => json!(v),
        Value::SmallInt(v) => json!(v),
        Value::Int(v) => json!(v),
        Value::BigInt(v) => json!(v),
        Value::UTinyInt(v) => json!(v),
        Value::USmallInt(v) => json!(v),
        Value::UInt(v) => json!(v),
        Value::UBigInt(v) => json!(v),
        // Outside the f64-safe range JSON consumers would lose precision
        Value::HugeInt(v) => match i64::try_from(v) {
            Ok(small) => json!(small),
            Err(_) => json!(v.to_string()),
        },
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        Value::Decimal(d) => {
            let text = d.to_string();
            text.parse::<f64>().map(|f| json!(f)).unwrap_or_else(|_| json!(text))
        }
        Value::Text(s) => json!(s),
        Value::Enum(s) => json!(s),
        Value::Blob(bytes) => json!(String::from_utf8_lossy(&bytes)),
        Value::Date32(days) => NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(ChronoDuration::days(days as i64)))
            .map(|d| json!(d.format("%Y-%m-%d").to_string()))
            .unwrap_or(JsonValue::Null),
        Value::Timestamp(unit, v) => DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|ts| json!(ts.naive_utc().format("%Y-%m-%dT%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null),
        Value::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            NaiveTime::from_num_seconds_from_midnight_opt(
                (micros / 1_000_000) as u32,
                ((micros % 1_000_000) * 1_000) as u32,
            )
            .map(|t| json!(t.format("%H:%M:%S%.f").to_string()))
            .unwrap_or(JsonValue::Null)
        }
        Value::List(items) | Value::Array(items) => {
            JsonValue::Array(items.into_iter().map(to_json).collect())
        }
        other => json!(format!("{:?}", other)),
    }
}
