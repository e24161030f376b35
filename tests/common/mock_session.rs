//! Scripted in-memory engine session
//!
//! `run_script` recognises the two programs the runner sends: wrapper
//! programs (user code is recovered from the embedded source and looked up
//! in the script table) and result cleanup scripts. Recognised user code
//! applies its scripted `Outcome`; unknown code succeeds with empty output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use arrow::array::{Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;

use dh_runner::result_channel::{encode_payload, CapturedOutput};
use dh_runner::wrapper::{embedded_source, result_name_of, RESULT_COLUMN};
use dh_runner::{ArrowTable, Result, RunnerError, Session, TableHandle};

/// Effect of one scripted piece of user code
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    pub output: CapturedOutput,
    pub tables: Vec<(String, RecordBatch)>,
    pub drops: Vec<String>,
}

impl Outcome {
    /// Expression whose repr is `repr`
    pub fn value(repr: &str) -> Self {
        Self {
            output: CapturedOutput {
                result_repr: Some(repr.to_string()),
                ..CapturedOutput::default()
            },
            ..Self::default()
        }
    }

    /// Code that raised; `error` is the formatted traceback
    pub fn raised(error: &str) -> Self {
        Self {
            output: CapturedOutput::failed(error),
            ..Self::default()
        }
    }

    pub fn printed(stdout: &str) -> Self {
        Self {
            output: CapturedOutput {
                stdout: stdout.to_string(),
                ..CapturedOutput::default()
            },
            ..Self::default()
        }
    }

    /// Also bind `name` to a new table
    pub fn with_table(mut self, name: &str, batch: RecordBatch) -> Self {
        self.tables.push((name.to_string(), batch));
        self
    }

    /// Also delete `name` from the namespace
    pub fn dropping(mut self, name: &str) -> Self {
        self.drops.push(name.to_string());
        self
    }
}

#[derive(Default)]
struct State {
    tables: BTreeMap<String, (RecordBatch, bool)>,
    scripts: HashMap<String, Outcome>,
    programs: Vec<String>,
    fail_runs: Option<String>,
    fail_after_result: Option<String>,
    corrupt_payloads: bool,
    closed: u32,
}

/// Clonable handle; clones share one namespace
#[derive(Clone, Default)]
pub struct MockSession {
    state: Arc<Mutex<State>>,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the effect of running exactly `code`
    pub fn on(&self, code: &str, outcome: Outcome) -> &Self {
        self.state.lock().scripts.insert(code.to_string(), outcome);
        self
    }

    pub fn put_table(&self, name: &str, batch: RecordBatch, refreshing: bool) {
        self.state
            .lock()
            .tables
            .insert(name.to_string(), (batch, refreshing));
    }

    pub fn remove_table(&self, name: &str) {
        self.state.lock().tables.remove(name);
    }

    /// Make every `run_script` fail with `message`
    pub fn fail_runs(&self, message: &str) {
        self.state.lock().fail_runs = Some(message.to_string());
    }

    /// Make wrapper programs fail after their result table is stored
    pub fn fail_after_result(&self, message: &str) {
        self.state.lock().fail_after_result = Some(message.to_string());
    }

    /// Store undecodable result payloads
    pub fn corrupt_payloads(&self) {
        self.state.lock().corrupt_payloads = true;
    }

    /// Every program passed to `run_script`, in order
    pub fn programs(&self) -> Vec<String> {
        self.state.lock().programs.clone()
    }

    pub fn table_names(&self) -> Vec<String> {
        self.state.lock().tables.keys().cloned().collect()
    }

    pub fn close_count(&self) -> u32 {
        self.state.lock().closed
    }

    fn run_user_code(state: &mut State, code: &str) -> CapturedOutput {
        let Some(outcome) = state.scripts.get(code).cloned() else {
            return CapturedOutput::default();
        };
        for (name, batch) in outcome.tables {
            state.tables.insert(name, (batch, false));
        }
        for name in outcome.drops {
            state.tables.remove(&name);
        }
        outcome.output
    }
}

fn cleanup_target(program: &str) -> Option<&str> {
    program
        .strip_prefix("try:\n    del ")
        .and_then(|rest| rest.lines().next())
}

impl Session for MockSession {
    fn run_script(&self, program: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.programs.push(program.to_string());
        if let Some(message) = &state.fail_runs {
            return Err(RunnerError::session(message.clone()));
        }

        if let Some(name) = cleanup_target(program) {
            state.tables.remove(name);
            return Ok(());
        }

        let (Some(code), Some(result_name)) = (embedded_source(program), result_name_of(program))
        else {
            return Err(RunnerError::session("mock engine cannot run this program"));
        };

        let output = Self::run_user_code(&mut state, &code);
        let payload = if state.corrupt_payloads {
            "%%%not-base64%%%".to_string()
        } else {
            encode_payload(&output)?
        };
        state
            .tables
            .insert(result_name.to_string(), (string_table(RESULT_COLUMN, &payload), false));
        match &state.fail_after_result {
            Some(message) => Err(RunnerError::session(message.clone())),
            None => Ok(()),
        }
    }

    fn open_table(&self, name: &str) -> Result<Box<dyn TableHandle>> {
        let state = self.state.lock();
        let (batch, refreshing) = state
            .tables
            .get(name)
            .ok_or_else(|| RunnerError::session(format!("Table '{}' not found", name)))?;
        Ok(Box::new(ArrowTable::new(batch.clone(), *refreshing)))
    }

    fn list_table_names(&self) -> Result<BTreeSet<String>> {
        Ok(self.state.lock().tables.keys().cloned().collect())
    }

    fn version(&self) -> Option<String> {
        Some("0.36.1".to_string())
    }

    fn close(&self) -> Result<()> {
        self.state.lock().closed += 1;
        Ok(())
    }
}

/// Single Int64 column `x` holding `values`
pub fn int_table(values: &[i64]) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new("x", DataType::Int64, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
        .expect("valid batch")
}

fn string_table(column: &str, value: &str) -> RecordBatch {
    let schema = Arc::new(Schema::new(vec![Field::new(column, DataType::Utf8, false)]));
    RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(vec![value]))])
        .expect("valid batch")
}
