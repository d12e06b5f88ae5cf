//! Worker protocol: newline-delimited JSON over the worker's stdio.
//!
//! Commands (coordinator → worker) are flat objects tagged by `type`:
//!
//! ```text
//! {"type":"CONNECT","dsn":"..."}
//! {"type":"EXECUTE","sql":"...","resultSetId":"...","maxRows":500}
//! {"type":"RECONNECT"}
//! {"type":"CLOSE"}
//! ```
//!
//! Events (worker → coordinator) carry their body under `payload`:
//!
//! ```text
//! {"type":"READY"}
//! {"type":"EXECUTE_RESULT","payload":{"success":true,...}}
//! ```
//!
//! Correlation is by response kind: each command kind has exactly one
//! event kind answering it, and at most one command of a kind may be
//! outstanding per worker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// One result row, keyed by column name
pub type Row = Map<String, Value>;

// ═══════════════════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════════════════

/// Command sent from the coordinator to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Command {
    Connect {
        dsn: String,
    },
    Execute {
        sql: String,
        #[serde(rename = "resultSetId")]
        result_set_id: String,
        #[serde(rename = "maxRows", default, skip_serializing_if = "Option::is_none")]
        max_rows: Option<usize>,
    },
    Reconnect,
    Close,
}

impl Command {
    /// Wire name of this command kind
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Connect { .. } => "CONNECT",
            Command::Execute { .. } => "EXECUTE",
            Command::Reconnect => "RECONNECT",
            Command::Close => "CLOSE",
        }
    }

    /// The event kind that answers this command
    pub fn response_kind(&self) -> ResponseKind {
        match self {
            Command::Connect { .. } => ResponseKind::ConnectResult,
            Command::Execute { .. } => ResponseKind::ExecuteResult,
            Command::Reconnect => ResponseKind::ReconnectResult,
            Command::Close => ResponseKind::CloseResult,
        }
    }

    /// Encode as a single protocol line (including the trailing newline)
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let mut line =
            serde_json::to_string(self).map_err(|e| ProtocolError::Json(e.to_string()))?;
        line.push('\n');
        Ok(line)
    }

    /// Decode one command line, rejecting unknown kinds explicitly
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Json(e.to_string()))?;
        let kind = message_kind(&value)?;
        match kind.as_str() {
            "CONNECT" | "EXECUTE" | "RECONNECT" | "CLOSE" => serde_json::from_value(value)
                .map_err(|e| ProtocolError::InvalidPayload {
                    kind,
                    reason: e.to_string(),
                }),
            _ => Err(ProtocolError::UnknownKind(kind)),
        }
    }
}

/// Event kinds that answer a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    ConnectResult,
    ExecuteResult,
    ReconnectResult,
    CloseResult,
}

impl fmt::Display for ResponseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseKind::ConnectResult => write!(f, "CONNECT_RESULT"),
            ResponseKind::ExecuteResult => write!(f, "EXECUTE_RESULT"),
            ResponseKind::ReconnectResult => write!(f, "RECONNECT_RESULT"),
            ResponseKind::CloseResult => write!(f, "CLOSE_RESULT"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// EVENT PAYLOADS
// ═══════════════════════════════════════════════════════════════════════════

/// Payload of CONNECT_RESULT
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

/// Column metadata for a result set
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    /// Display type: `number`, `string`, `boolean` or `date`
    #[serde(rename = "type")]
    pub column_type: String,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, column_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column_type: column_type.into(),
        }
    }
}

/// Structured diagnostic attached to a failed execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_snippet: Option<String>,
}

impl ErrorDetails {
    /// True when no field carries information
    pub fn is_empty(&self) -> bool {
        self == &ErrorDetails::default()
    }
}

/// Payload of EXECUTE_RESULT
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResult {
    pub success: bool,
    /// Missing on "Not connected" replies from older workers
    #[serde(default)]
    pub result_set_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_results: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<Vec<Row>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<ErrorDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traceback: Option<String>,
}

impl ExecuteResult {
    /// Successful result carrying rows
    pub fn with_rows(result_set_id: impl Into<String>, columns: Vec<ColumnInfo>, rows: Vec<Row>) -> Self {
        let row_count = rows.len() as u64;
        Self {
            success: true,
            result_set_id: result_set_id.into(),
            has_results: Some(true),
            columns: Some(columns),
            rows: Some(rows),
            row_count: Some(row_count),
            ..Default::default()
        }
    }

    /// Successful DDL/DML result without rows
    pub fn statement_done(result_set_id: impl Into<String>, affected: u64) -> Self {
        Self {
            success: true,
            result_set_id: result_set_id.into(),
            has_results: Some(false),
            row_count: Some(affected),
            message: Some(format!(
                "Query executed successfully ({} rows affected)",
                affected
            )),
            ..Default::default()
        }
    }

    /// Failed execution with a flat message
    pub fn failure(result_set_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            result_set_id: result_set_id.into(),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// True when the statement produced a row set (even an empty one)
    pub fn returns_rows(&self) -> bool {
        self.has_results.unwrap_or(false) || self.columns.is_some()
    }

    /// Best human-readable failure text
    pub fn error_message(&self) -> String {
        self.error
            .clone()
            .or_else(|| self.message.clone())
            .unwrap_or_else(|| "Query failed".to_string())
    }
}

/// Payload of RECONNECT_RESULT
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconnectResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Payload of CLOSE_RESULT
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CloseResult {
    #[serde(default = "default_true")]
    pub success: bool,
}

fn default_true() -> bool {
    true
}

// ═══════════════════════════════════════════════════════════════════════════
// EVENTS
// ═══════════════════════════════════════════════════════════════════════════

/// Event sent from a worker to the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    /// Unsolicited, exactly once at startup
    Ready,
    ConnectResult(ConnectResult),
    ExecuteResult(ExecuteResult),
    ReconnectResult(ReconnectResult),
    CloseResult(CloseResult),
    /// Free-form failure; rejects whatever command is outstanding
    Error(Value),
}

impl WorkerEvent {
    /// Wire name of this event kind
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerEvent::Ready => "READY",
            WorkerEvent::ConnectResult(_) => "CONNECT_RESULT",
            WorkerEvent::ExecuteResult(_) => "EXECUTE_RESULT",
            WorkerEvent::ReconnectResult(_) => "RECONNECT_RESULT",
            WorkerEvent::CloseResult(_) => "CLOSE_RESULT",
            WorkerEvent::Error(_) => "ERROR",
        }
    }

    /// The response slot this event fills, if it answers a command
    pub fn response_kind(&self) -> Option<ResponseKind> {
        match self {
            WorkerEvent::ConnectResult(_) => Some(ResponseKind::ConnectResult),
            WorkerEvent::ExecuteResult(_) => Some(ResponseKind::ExecuteResult),
            WorkerEvent::ReconnectResult(_) => Some(ResponseKind::ReconnectResult),
            WorkerEvent::CloseResult(_) => Some(ResponseKind::CloseResult),
            WorkerEvent::Ready | WorkerEvent::Error(_) => None,
        }
    }

    /// Message text of an ERROR payload (`{"error": "..."}` or a bare string)
    pub fn error_text(payload: &Value) -> String {
        match payload {
            Value::String(s) => s.clone(),
            Value::Object(map) => map
                .get("error")
                .or_else(|| map.get("message"))
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string()),
            other => other.to_string(),
        }
    }

    /// Decode one event line, matching the kind exhaustively
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        let mut value: Value =
            serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Json(e.to_string()))?;
        let kind = message_kind(&value)?;
        let payload = value.as_object_mut().and_then(|m| m.remove("payload"));

        fn body<T: for<'de> Deserialize<'de>>(
            kind: &str,
            payload: Option<Value>,
        ) -> Result<T, ProtocolError> {
            let payload = payload.ok_or_else(|| ProtocolError::InvalidPayload {
                kind: kind.to_string(),
                reason: "missing payload".to_string(),
            })?;
            serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
                kind: kind.to_string(),
                reason: e.to_string(),
            })
        }

        match kind.as_str() {
            "READY" => Ok(WorkerEvent::Ready),
            "CONNECT_RESULT" => body(&kind, payload).map(WorkerEvent::ConnectResult),
            "EXECUTE_RESULT" => body(&kind, payload).map(WorkerEvent::ExecuteResult),
            "RECONNECT_RESULT" => body(&kind, payload).map(WorkerEvent::ReconnectResult),
            // Older workers send CLOSE_RESULT with no payload
            "CLOSE_RESULT" => Ok(WorkerEvent::CloseResult(match payload {
                Some(p) => body(&kind, Some(p))?,
                None => CloseResult { success: true },
            })),
            "ERROR" => Ok(WorkerEvent::Error(payload.unwrap_or(Value::Null))),
            _ => Err(ProtocolError::UnknownKind(kind)),
        }
    }

    /// Encode as a single protocol line (including the trailing newline)
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        let payload = match self {
            WorkerEvent::Ready => None,
            WorkerEvent::ConnectResult(p) => Some(serde_json::to_value(p)),
            WorkerEvent::ExecuteResult(p) => Some(serde_json::to_value(p)),
            WorkerEvent::ReconnectResult(p) => Some(serde_json::to_value(p)),
            WorkerEvent::CloseResult(p) => Some(serde_json::to_value(p)),
            WorkerEvent::Error(p) => Some(Ok(p.clone())),
        };
        let mut message = Map::new();
        message.insert("type".to_string(), Value::String(self.kind().to_string()));
        if let Some(payload) = payload {
            let payload = payload.map_err(|e| ProtocolError::Json(e.to_string()))?;
            message.insert("payload".to_string(), payload);
        }
        let mut line = Value::Object(message).to_string();
        line.push('\n');
        Ok(line)
    }
}

fn message_kind(value: &Value) -> Result<String, ProtocolError> {
    value
        .get("type")
        .and_then(|t| t.as_str())
        .map(str::to_string)
        .ok_or(ProtocolError::MissingKind)
}

/// Protocol decode/encode failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// Line is not valid JSON
    #[error("Invalid JSON: {0}")]
    Json(String),
    /// JSON object has no string `type` field
    #[error("Message has no type")]
    MissingKind,
    /// `type` is not a known kind
    #[error("Unknown message type: {0}")]
    UnknownKind(String),
    /// Known kind with a payload that does not match its schema
    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: String, reason: String },
}

impl From<ProtocolError> for crate::SqlRunError {
    fn from(err: ProtocolError) -> Self {
        crate::SqlRunError::Protocol(err.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// LINE FRAMING
// ═══════════════════════════════════════════════════════════════════════════

/// Incremental newline framer for the worker's stdout byte stream.
///
/// Bytes are appended as they arrive; every complete line is trimmed,
/// empty lines are skipped, and the rest are decoded one by one so a
/// malformed line never poisons its neighbours.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and return the decode result of every completed line
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<WorkerEvent, ProtocolError>> {
        self.buffer.extend_from_slice(bytes);
        let mut decoded = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let text = text.trim();
            if text.is_empty() {
                continue;
            }
            decoded.push(WorkerEvent::decode(text));
        }
        decoded
    }

    /// Bytes received after the last newline
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}
