//! Protocol dispatcher
//!
//! Routes each decoded request to its handler and writes exactly one reply
//! per request through the shared [`ResponseWriter`]. Nothing a single
//! command does can end the connection: engine failures become `error`
//! responses, and user-code failures are reported inside a normal `result`.

use std::time::{Duration, Instant};

use serde_json::Value;

use crate::analyzer::assigned_names;
use crate::codec::{Frame, ResponseWriter};
use crate::config::{DaemonConfig, RunnerMode};
use crate::error::Result;
use crate::protocol::{ExecuteTiming, Request, Response, TablePreview};
use crate::result_channel::{cleanup, collect, CapturedOutput};
use crate::session::{Session, SharedSession};
use crate::snapshot::{describe, preview, snapshot, user_table_names};
use crate::subscription::{SubscriptionManager, SubscriptionTarget};
use crate::wrapper::{build_wrapper, new_result_name};

/// Whether the read loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Shutdown,
}

/// Identity reported in `ready` and `server_info`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerIdentity {
    pub host: String,
    pub port: u16,
    pub version: String,
    pub mode: RunnerMode,
}

impl ServerIdentity {
    pub fn new(config: &DaemonConfig, port: u16, version: Option<String>) -> Self {
        Self {
            host: config.advertised_host().to_string(),
            port,
            version: version.unwrap_or_else(|| "unknown".to_string()),
            mode: config.mode,
        }
    }

    pub fn ready(&self) -> Response {
        Response::Ready {
            port: self.port,
            version: self.version.clone(),
            mode: self.mode.to_string(),
        }
    }
}

/// Optional extras an `execute` reply can carry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub show_tables: bool,
    pub show_table_meta: bool,
    pub show_timing: bool,
}

/// Everything one `execute` produced, before it becomes a `result`
struct Execution {
    output: CapturedOutput,
    assigned_tables: Vec<String>,
    all_tables: Vec<String>,
    previews: Vec<TablePreview>,
    timing: ExecuteTiming,
}

impl Execution {
    fn new(output: CapturedOutput, all_tables: Vec<String>) -> Self {
        Self {
            output,
            assigned_tables: Vec::new(),
            all_tables,
            previews: Vec::new(),
            timing: ExecuteTiming::default(),
        }
    }

    fn into_response(self, id: Option<Value>, options: ExecuteOptions, started: Instant) -> Response {
        let exit_code = i32::from(self.output.error.is_some());
        Response::Result {
            id,
            stdout: self.output.stdout,
            stderr: self.output.stderr,
            error: self.output.error,
            result_repr: self.output.result_repr,
            assigned_tables: self.assigned_tables,
            all_tables: self.all_tables,
            elapsed_ms: millis(started.elapsed()),
            exit_code: options.show_tables.then_some(exit_code),
            tables: options.show_tables.then_some(self.previews),
            timing: options.show_timing.then_some(self.timing),
        }
    }
}

/// Per-connection protocol state machine
pub struct Dispatcher {
    session: SharedSession,
    writer: ResponseWriter,
    subscriptions: SubscriptionManager,
    identity: ServerIdentity,
    fetch_limit: usize,
    subscribe_limit: usize,
    session_closed: bool,
}

impl Dispatcher {
    pub fn new(
        session: SharedSession,
        writer: ResponseWriter,
        identity: ServerIdentity,
        config: &DaemonConfig,
    ) -> Self {
        let subscriptions =
            SubscriptionManager::new(session.clone(), writer.clone(), config.subscription.clone());
        Self {
            session,
            writer,
            subscriptions,
            identity,
            fetch_limit: config.fetch.default_limit,
            subscribe_limit: config.subscription.default_limit,
            session_closed: false,
        }
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    /// Handle one decoded line
    pub fn handle_frame(&mut self, frame: Frame) -> Flow {
        match frame {
            Frame::Blank => Flow::Continue,
            Frame::Invalid(response) => {
                self.reply(&response);
                Flow::Continue
            }
            Frame::Request(request) => self.handle(request),
        }
    }

    /// Handle one request, writing its reply
    pub fn handle(&mut self, request: Request) -> Flow {
        tracing::debug!("Handling {}", request.kind());
        let id = request.id().cloned();
        let outcome = match request {
            Request::Execute {
                id,
                code,
                show_tables,
                show_table_meta,
                show_timing,
            } => {
                let options = ExecuteOptions {
                    show_tables,
                    show_table_meta,
                    show_timing,
                };
                Ok(self.execute(id, &code, options))
            }
            Request::ListTables { id } => self.list_tables(id),
            Request::FetchTable {
                id,
                name,
                offset,
                limit,
            } => Ok(self.fetch_table(id, name, offset, limit)),
            Request::Subscribe {
                id,
                name,
                offset,
                limit,
            } => self.subscribe(id, name, offset, limit),
            Request::Unsubscribe { id, name } => Ok(self.unsubscribe(id, name)),
            Request::ServerInfo { id } => self.server_info(id),
            Request::Shutdown { .. } => {
                self.shutdown();
                return Flow::Shutdown;
            }
        };

        let response = outcome.unwrap_or_else(|e| {
            tracing::warn!("Command failed: {}", e);
            Response::error(id, e.to_string())
        });
        self.reply(&response);
        Flow::Continue
    }

    /// Stop the subscription and close the session without acknowledging
    ///
    /// Used when the peer goes away; safe to call repeatedly.
    pub fn finish(&mut self) {
        self.subscriptions.cancel();
        if self.session_closed {
            return;
        }
        self.session_closed = true;
        if let Err(e) = self.session.lock().close() {
            tracing::warn!("Failed to close session: {}", e);
        }
    }

    fn shutdown(&mut self) {
        tracing::info!("Shutdown requested");
        self.subscriptions.cancel();
        self.reply(&Response::ShutdownAck);
        self.finish();
    }

    fn reply(&self, response: &Response) {
        if let Err(e) = self.writer.send(response) {
            tracing::warn!("Failed to write {} response: {}", response.kind(), e);
        }
    }

    fn execute(&self, id: Option<Value>, code: &str, options: ExecuteOptions) -> Response {
        let started = Instant::now();
        if code.trim().is_empty() {
            return Execution::new(CapturedOutput::default(), Vec::new())
                .into_response(id, options, started);
        }

        let names = assigned_names(code);
        let result_name = new_result_name();
        let program = build_wrapper(code, &result_name);
        let built = started.elapsed();

        let session = self.session.lock();
        let run_started = Instant::now();
        if let Err(e) = session.run_script(&program) {
            tracing::warn!("Wrapper program failed to run: {}", e);
            let run_script = run_started.elapsed();
            let cleanup_started = Instant::now();
            cleanup(session.as_ref(), &result_name);
            let all_tables = user_table_names(session.as_ref()).unwrap_or_default();
            let mut execution = Execution::new(CapturedOutput::failed(e.to_string()), all_tables);
            execution.timing = ExecuteTiming {
                build_wrapper_ms: millis(built),
                run_script_ms: millis(run_script),
                read_result_ms: 0,
                cleanup_ms: millis(cleanup_started.elapsed()),
            };
            return execution.into_response(id, options, started);
        }
        let run_script = run_started.elapsed();

        let read_started = Instant::now();
        let output = collect(session.as_ref(), &result_name);
        let read_result = read_started.elapsed();

        let cleanup_started = Instant::now();
        cleanup(session.as_ref(), &result_name);
        let cleaned = cleanup_started.elapsed();

        let all_tables = match user_table_names(session.as_ref()) {
            Ok(tables) => tables,
            Err(e) => {
                tracing::warn!("Failed to list tables after execute: {}", e);
                Vec::new()
            }
        };

        let mut execution = Execution::new(output, all_tables);
        execution.assigned_tables = execution
            .all_tables
            .iter()
            .filter(|name| names.contains(name.as_str()))
            .cloned()
            .collect();
        if options.show_tables {
            execution.previews =
                previews(session.as_ref(), &execution.assigned_tables, options.show_table_meta);
        }
        drop(session);

        execution.timing = ExecuteTiming {
            build_wrapper_ms: millis(built),
            run_script_ms: millis(run_script),
            read_result_ms: millis(read_result),
            cleanup_ms: millis(cleaned),
        };
        tracing::debug!(
            "execute timing: build_wrapper={:?} run_script={:?} read_result={:?} cleanup={:?}",
            built,
            run_script,
            read_result,
            cleaned
        );
        execution.into_response(id, options, started)
    }

    fn list_tables(&self, id: Option<Value>) -> Result<Response> {
        let session = self.session.lock();
        let tables = user_table_names(session.as_ref())?
            .iter()
            .map(|name| describe(session.as_ref(), name))
            .collect();
        Ok(Response::Tables { id, tables })
    }

    fn fetch_table(&self, id: Option<Value>, name: String, offset: usize, limit: Option<usize>) -> Response {
        let limit = limit.unwrap_or(self.fetch_limit);
        let result = {
            let session = self.session.lock();
            snapshot(session.as_ref(), &name, offset, limit)
        };
        match result {
            Ok(snap) => Response::TableData {
                id,
                frame: snap.frame,
                is_refreshing: snap.is_refreshing,
            },
            Err(e) => {
                tracing::warn!("{}", e);
                Response::error(id, e.to_string())
            }
        }
    }

    fn subscribe(
        &self,
        id: Option<Value>,
        name: String,
        offset: usize,
        limit: Option<usize>,
    ) -> Result<Response> {
        self.subscriptions.subscribe(SubscriptionTarget {
            name: name.clone(),
            offset,
            limit: limit.unwrap_or(self.subscribe_limit),
        })?;
        Ok(Response::SubscribeAck { id, name })
    }

    fn unsubscribe(&self, id: Option<Value>, name: String) -> Response {
        self.subscriptions.cancel();
        Response::UnsubscribeAck { id, name }
    }

    fn server_info(&self, id: Option<Value>) -> Result<Response> {
        let table_count = {
            let session = self.session.lock();
            user_table_names(session.as_ref())?.len()
        };
        Ok(Response::ServerInfo {
            id,
            host: self.identity.host.clone(),
            port: self.identity.port,
            version: self.identity.version.clone(),
            mode: self.identity.mode.to_string(),
            table_count,
        })
    }
}

/// Previews of `names`; tables that cannot be read are left out
fn previews(session: &dyn Session, names: &[String], show_meta: bool) -> Vec<TablePreview> {
    names
        .iter()
        .filter_map(|name| match preview(session, name, show_meta) {
            Ok(rendered) => Some(rendered),
            Err(e) => {
                tracing::debug!("No preview for {}: {}", name, e);
                None
            }
        })
        .collect()
}

fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
