//! Result channel: the return path of the execution wrapper
//!
//! The wrapper leaves its outcome as base64(JSON) in the single cell of a
//! result table. This module owns both halves of that encoding and the
//! read-then-delete handling of the result table.

use arrow::array::{Array, AsArray};
use arrow::compute::cast;
use arrow::datatypes::DataType;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Result, RunnerError};
use crate::session::Session;
use crate::wrapper::{cleanup_script, RESULT_COLUMN};

/// What the wrapper captured from one run of user code
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedOutput {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub result_repr: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CapturedOutput {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Encode captured output the same way the wrapper does
pub fn encode_payload(output: &CapturedOutput) -> Result<String> {
    let json = serde_json::to_vec(output)?;
    Ok(BASE64.encode(json))
}

/// Decode a payload produced by the wrapper
pub fn decode_payload(encoded: &str) -> Result<CapturedOutput> {
    let bytes = BASE64
        .decode(encoded.trim().as_bytes())
        .map_err(RunnerError::payload)?;
    serde_json::from_slice(&bytes).map_err(RunnerError::payload)
}

/// Read and decode the payload left in `result_name`
///
/// An empty result table decodes to an empty [`CapturedOutput`].
pub fn read_result(session: &dyn Session, result_name: &str) -> Result<CapturedOutput> {
    let table = session.open_table(result_name)?;
    let batch = table.slice_rows(0, 1)?;
    if batch.num_rows() == 0 {
        return Ok(CapturedOutput::default());
    }

    let column = batch
        .column_by_name(RESULT_COLUMN)
        .ok_or_else(|| RunnerError::payload(format!("result table has no {RESULT_COLUMN} column")))?;
    let column = cast(column, &DataType::Utf8).map_err(RunnerError::payload)?;
    let strings = column.as_string::<i32>();
    if strings.is_null(0) {
        return Err(RunnerError::payload("result payload is null"));
    }
    decode_payload(strings.value(0))
}

/// Read the result table, falling back to a synthetic error on any failure
pub fn collect(session: &dyn Session, result_name: &str) -> CapturedOutput {
    match read_result(session, result_name) {
        Ok(output) => output,
        Err(RunnerError::Payload { message }) => {
            CapturedOutput::failed(format!("Failed to read results: {message}"))
        }
        Err(e) => CapturedOutput::failed(format!("Failed to read results: {e}")),
    }
}

/// Delete the result table; failures are logged and otherwise ignored
pub fn cleanup(session: &dyn Session, result_name: &str) {
    if let Err(e) = session.run_script(&cleanup_script(result_name)) {
        tracing::debug!("Failed to remove {}: {}", result_name, e);
    }
}
