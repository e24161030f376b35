//! Session adapter over an engine bridge subprocess
//!
//! The engine's client library lives in the engine's own language, so the
//! runner drives it through a small bridge program started from
//! `[engine] command`. The bridge reads one JSON request per line on stdin
//! and answers with one JSON line on stdout:
//!
//! ```json
//! {"op": "hello", "mode": "embedded", "host": "localhost", "port": 10000}
//!                                                      -> {"ok": true, "port": 10000, "version": "0.36.1"}
//! {"op": "run_script", "code": "..."}                  -> {"ok": true}
//! {"op": "open_table", "name": "t"}                    -> {"ok": true, "is_refreshing": false, "arrow_ipc_b64": "..."}
//! {"op": "list_tables"}                                -> {"ok": true, "names": ["t"]}
//! {"op": "close"}                                      -> {"ok": true}
//! ```
//!
//! Any reply with `"ok": false` carries an `error` string, which becomes a
//! [`RunnerError::Session`]. A bridge that exits or closes stdout mid-call
//! is reported the same way.
//!
//! `hello` is always the first request. In `embedded` mode the bridge starts
//! an engine on `port` (or any free port when it is taken) and reports the
//! port it got; in `remote` and `vm` mode it connects to `host:port`.
//!
//! The reference bridge is `bridge/dh-bridge` in this repository, a Python
//! script over `pydeephaven` and `pyarrow` (plus `deephaven-server` for
//! embedded mode). The default command, `dh-bridge`, expects it on `PATH`.

use std::collections::BTreeSet;
use std::io::{BufRead, BufReader, Cursor, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use arrow::compute::concat_batches;
use arrow::ipc::reader::StreamReader;
use arrow::record_batch::RecordBatch;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{ArrowTable, Session, TableHandle};
use crate::config::RunnerMode;
use crate::error::{Result, RunnerError};

#[derive(Debug, Deserialize)]
struct BridgeReply {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    names: Vec<String>,
    #[serde(default)]
    is_refreshing: bool,
    #[serde(default)]
    arrow_ipc_b64: Option<String>,
}

struct BridgeIo {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// Engine session backed by a bridge subprocess
pub struct BridgeSession {
    child: Mutex<Child>,
    io: Mutex<BridgeIo>,
    port: u16,
    version: Option<String>,
}

impl BridgeSession {
    /// Start the bridge and connect it to the engine at `host:port`
    pub fn spawn(command: &[String], mode: RunnerMode, host: &str, port: u16) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RunnerError::Config {
                message: "engine command is empty".to_string(),
            })?;

        tracing::info!("Starting engine bridge: {}", command.join(" "));
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| RunnerError::session(format!("Failed to start engine bridge {program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RunnerError::session("engine bridge has no stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RunnerError::session("engine bridge has no stdout"))?;

        let io = BridgeIo {
            stdin,
            stdout: BufReader::new(stdout),
        };
        let mut session = Self {
            child: Mutex::new(child),
            io: Mutex::new(io),
            port,
            version: None,
        };

        let hello = session.call(json!({
            "op": "hello",
            "mode": mode.to_string(),
            "host": host,
            "port": port,
        }))?;
        if let Some(actual) = hello.port {
            session.port = actual;
        }
        session.version = hello.version;
        tracing::info!(
            "Engine session connected on port {} (version {})",
            session.port,
            session.version.as_deref().unwrap_or("unknown")
        );
        Ok(session)
    }

    /// Port the engine actually listens on (may differ from the requested one)
    pub fn port(&self) -> u16 {
        self.port
    }

    fn call(&self, request: Value) -> Result<BridgeReply> {
        let mut io = self.io.lock();
        let mut line = serde_json::to_vec(&request)?;
        line.push(b'\n');
        io.stdin.write_all(&line)?;
        io.stdin.flush()?;

        let mut reply = String::new();
        if io.stdout.read_line(&mut reply)? == 0 {
            return Err(RunnerError::session("engine bridge closed its output"));
        }
        let reply: BridgeReply = serde_json::from_str(reply.trim_end())?;
        if !reply.ok {
            return Err(RunnerError::session(
                reply.error.unwrap_or_else(|| "engine bridge call failed".to_string()),
            ));
        }
        Ok(reply)
    }
}

impl Session for BridgeSession {
    fn run_script(&self, code: &str) -> Result<()> {
        self.call(json!({ "op": "run_script", "code": code }))?;
        Ok(())
    }

    fn open_table(&self, name: &str) -> Result<Box<dyn TableHandle>> {
        let reply = self.call(json!({ "op": "open_table", "name": name }))?;
        let encoded = reply
            .arrow_ipc_b64
            .ok_or_else(|| RunnerError::session(format!("engine bridge sent no data for {name}")))?;
        let bytes = BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| RunnerError::session(format!("Invalid table payload base64: {e}")))?;
        let batch = decode_ipc_stream(&bytes)?;
        Ok(Box::new(ArrowTable::new(batch, reply.is_refreshing)))
    }

    fn list_table_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.call(json!({ "op": "list_tables" }))?.names.into_iter().collect())
    }

    fn version(&self) -> Option<String> {
        self.version.clone()
    }

    fn close(&self) -> Result<()> {
        let result = self.call(json!({ "op": "close" })).map(|_| ());
        let mut child = self.child.lock();
        if let Err(e) = child.wait() {
            tracing::warn!("Engine bridge did not exit cleanly: {}", e);
        }
        result
    }
}

impl Drop for BridgeSession {
    fn drop(&mut self) {
        let mut child = self.child.lock();
        if let Ok(None) = child.try_wait() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

/// Concatenate every batch of an Arrow IPC stream into one batch
pub fn decode_ipc_stream(bytes: &[u8]) -> Result<RecordBatch> {
    let reader = StreamReader::try_new(Cursor::new(bytes), None)?;
    let schema = reader.schema();
    let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(concat_batches(&schema, &batches)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::ipc::writer::StreamWriter;
    use std::sync::Arc;

    fn ipc_bytes(batches: &[RecordBatch]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut writer = StreamWriter::try_new(&mut buf, &batches[0].schema()).unwrap();
            for batch in batches {
                writer.write(batch).unwrap();
            }
            writer.finish().unwrap();
        }
        buf
    }

    #[test]
    fn test_decode_ipc_stream_concatenates_batches() {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("sym", DataType::Utf8, true),
        ]));
        let first = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(vec![1, 2])),
                Arc::new(StringArray::from(vec![Some("a"), None])),
            ],
        )
        .unwrap();
        let second = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![3])),
                Arc::new(StringArray::from(vec![Some("c")])),
            ],
        )
        .unwrap();

        let batch = decode_ipc_stream(&ipc_bytes(&[first, second])).unwrap();
        assert_eq!(batch.num_rows(), 3);
        assert_eq!(batch.schema().field(1).name(), "sym");
    }

    #[test]
    fn test_spawn_rejects_empty_command() {
        let err = BridgeSession::spawn(&[], RunnerMode::Embedded, "localhost", 10000).err().unwrap();
        assert!(matches!(err, RunnerError::Config { .. }));
    }

    #[test]
    fn test_reply_defaults() {
        let reply: BridgeReply = serde_json::from_str(r#"{"ok":false,"error":"boom"}"#).unwrap();
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("boom"));
        assert!(reply.names.is_empty());
    }
}
