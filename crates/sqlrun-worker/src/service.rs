//! Command loop
//!
//! Reads one JSON command per line, answers each with exactly one event
//! line, and stops after CLOSE or end of input.

use anyhow::Result;
use serde_json::json;
use sqlrun_common::{CloseResult, Command, ProtocolError, WorkerEvent};
use std::io::{BufRead, Write};
use tracing::{debug, info, warn};

use crate::executor::SqlExecutor;

/// Serve the protocol until CLOSE or EOF
pub fn serve<R: BufRead, W: Write>(
    reader: R,
    mut writer: W,
    executor: &mut SqlExecutor,
) -> Result<()> {
    send(&mut writer, &WorkerEvent::Ready)?;

    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let command = match Command::decode(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Rejected command");
                let error = match e {
                    ProtocolError::UnknownKind(kind) => format!("Unknown command type: {}", kind),
                    other => other.to_string(),
                };
                send(&mut writer, &WorkerEvent::Error(json!({ "error": error })))?;
                continue;
            }
        };
        debug!(kind = command.kind(), "Received command");

        match command {
            Command::Connect { dsn } => {
                let result = executor.connect(&dsn);
                send(&mut writer, &WorkerEvent::ConnectResult(result))?;
            }
            Command::Execute {
                sql,
                result_set_id,
                max_rows,
            } => {
                let result = executor.execute(&sql, &result_set_id, max_rows);
                debug!(
                    result_set_id = %result_set_id,
                    success = result.success,
                    row_count = ?result.row_count,
                    "Sending EXECUTE_RESULT"
                );
                send(&mut writer, &WorkerEvent::ExecuteResult(result))?;
            }
            Command::Reconnect => {
                let result = executor.reconnect();
                send(&mut writer, &WorkerEvent::ReconnectResult(result))?;
            }
            Command::Close => {
                executor.close();
                send(
                    &mut writer,
                    &WorkerEvent::CloseResult(CloseResult { success: true }),
                )?;
                info!("Closed by coordinator");
                return Ok(());
            }
        }
    }

    info!("Input closed");
    executor.close();
    Ok(())
}

fn send<W: Write>(writer: &mut W, event: &WorkerEvent) -> Result<()> {
    writer.write_all(event.to_line()?.as_bytes())?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{ExecutorConfig, Mode};
    use sqlrun_common::ExecuteResult;
    use std::io::Cursor;

    fn run(input: &[&str], mode: Mode) -> Vec<WorkerEvent> {
        let mut executor = SqlExecutor::new(ExecutorConfig {
            mode,
            ..Default::default()
        });
        let input = input.join("\n") + "\n";
        let mut output = Vec::new();
        serve(Cursor::new(input), &mut output, &mut executor).unwrap();
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| WorkerEvent::decode(line).unwrap())
            .collect()
    }

    fn execute_result(event: &WorkerEvent) -> &ExecuteResult {
        match event {
            WorkerEvent::ExecuteResult(result) => result,
            other => panic!("expected EXECUTE_RESULT, got {:?}", other),
        }
    }

    #[test]
    fn test_ready_is_sent_first() {
        let events = run(&[], Mode::Mock);
        assert_eq!(events, vec![WorkerEvent::Ready]);
    }

    #[test]
    fn test_execute_before_connect() {
        let events = run(
            &[r#"{"type":"EXECUTE","sql":"SELECT 1","resultSetId":"a:0"}"#],
            Mode::Mock,
        );
        let result = execute_result(&events[1]);
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Not connected"));
    }

    #[test]
    fn test_temp_table_then_select() {
        let events = run(
            &[
                r#"{"type":"CONNECT","dsn":":memory:"}"#,
                r#"{"type":"EXECUTE","sql":"CREATE TEMP TABLE t AS SELECT 1 AS col","resultSetId":"a:0"}"#,
                r#"{"type":"EXECUTE","sql":"SELECT * FROM t","resultSetId":"a:1"}"#,
            ],
            Mode::Duckdb,
        );
        assert_eq!(events.len(), 4);
        assert!(matches!(&events[1], WorkerEvent::ConnectResult(r) if r.success));
        assert_eq!(execute_result(&events[2]).has_results, Some(false));

        let selected = execute_result(&events[3]);
        assert_eq!(selected.result_set_id, "a:1");
        assert_eq!(selected.columns.as_ref().unwrap().len(), 1);
        assert_eq!(selected.rows.as_ref().unwrap()[0]["col"], json!(1));
    }

    #[test]
    fn test_invalid_input_keeps_running() {
        let events = run(
            &[
                "not json",
                r#"{"type":"DESCRIBE"}"#,
                r#"{"type":"CONNECT","dsn":"ignored"}"#,
            ],
            Mode::Mock,
        );
        assert_eq!(events.len(), 4);
        match &events[1] {
            WorkerEvent::Error(payload) => {
                assert!(WorkerEvent::error_text(payload).starts_with("Invalid JSON"))
            }
            other => panic!("unexpected {:?}", other),
        }
        match &events[2] {
            WorkerEvent::Error(payload) => {
                assert_eq!(WorkerEvent::error_text(payload), "Unknown command type: DESCRIBE")
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(&events[3], WorkerEvent::ConnectResult(r) if r.success));
    }

    #[test]
    fn test_close_stops_loop() {
        let events = run(
            &[
                r#"{"type":"CONNECT","dsn":""}"#,
                r#"{"type":"CLOSE"}"#,
                r#"{"type":"EXECUTE","sql":"SELECT 1","resultSetId":"late"}"#,
            ],
            Mode::Mock,
        );
        assert_eq!(events.len(), 3);
        assert_eq!(
            events[2],
            WorkerEvent::CloseResult(CloseResult { success: true })
        );
    }

    #[test]
    fn test_reconnect_reports_alive() {
        let events = run(
            &[r#"{"type":"CONNECT","dsn":""}"#, r#"{"type":"RECONNECT"}"#],
            Mode::Mock,
        );
        match &events[2] {
            WorkerEvent::ReconnectResult(result) => {
                assert!(result.success);
                assert_eq!(result.message.as_deref(), Some("Connection is alive"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
