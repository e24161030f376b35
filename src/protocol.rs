//! Wire protocol message types
//!
//! Every message is one JSON object on one line, tagged by `type`.
//!
//! ```json
//! // Host -> runner
//! {"type": "execute", "id": 1, "code": "t = empty_table(3)"}
//! {"type": "fetch_table", "id": 2, "name": "t", "offset": 0, "limit": 50}
//! {"type": "subscribe", "id": 3, "name": "t"}
//!
//! // Runner -> host
//! {"type": "ready", "port": 10000, "version": "0.36.1", "mode": "embedded"}
//! {"type": "result", "id": 1, "stdout": "", "assigned_tables": ["t"], ...}
//! {"type": "table_update", "name": "t", "rows": [[0], [1]], ...}
//! ```
//!
//! `id` is opaque to the runner and echoed back verbatim. `table_update` is
//! the only unsolicited message and never carries an `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const DEFAULT_FETCH_LIMIT: usize = 50;
pub const DEFAULT_SUBSCRIBE_LIMIT: usize = 200;

/// Host-to-runner message
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Run user code in the engine session
    Execute {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        code: String,
        /// Add `exit_code` and a preview of each assigned table
        #[serde(default)]
        show_tables: bool,
        /// Prefix each preview with its column list
        #[serde(default)]
        show_table_meta: bool,
        /// Add the `_timing` breakdown
        #[serde(default)]
        show_timing: bool,
    },
    /// Describe every user-visible table
    ListTables {
        #[serde(default)]
        id: Option<Value>,
    },
    /// One-shot slice of a table
    FetchTable {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Start (or replace) the background poller
    Subscribe {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        name: String,
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    /// Stop the background poller
    Unsubscribe {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        name: String,
    },
    ServerInfo {
        #[serde(default)]
        id: Option<Value>,
    },
    Shutdown {
        #[serde(default)]
        id: Option<Value>,
    },
}

impl Request {
    /// Tags this enum accepts, used to tell unknown tags apart from bad fields
    pub const TAGS: &'static [&'static str] = &[
        "execute",
        "list_tables",
        "fetch_table",
        "subscribe",
        "unsubscribe",
        "server_info",
        "shutdown",
    ];

    pub fn id(&self) -> Option<&Value> {
        match self {
            Self::Execute { id, .. }
            | Self::ListTables { id }
            | Self::FetchTable { id, .. }
            | Self::Subscribe { id, .. }
            | Self::Unsubscribe { id, .. }
            | Self::ServerInfo { id }
            | Self::Shutdown { id } => id.as_ref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Execute { .. } => "execute",
            Self::ListTables { .. } => "list_tables",
            Self::FetchTable { .. } => "fetch_table",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::ServerInfo { .. } => "server_info",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// Runner-to-host message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Handshake line, emitted once before any other traffic
    Ready {
        port: u16,
        version: String,
        mode: String,
    },
    /// Outcome of an `execute`
    Result {
        id: Option<Value>,
        stdout: String,
        stderr: String,
        error: Option<String>,
        result_repr: Option<String>,
        assigned_tables: Vec<String>,
        all_tables: Vec<String>,
        elapsed_ms: u64,
        /// 0 when the code ran cleanly, 1 when `error` is set
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tables: Option<Vec<TablePreview>>,
        #[serde(default, rename = "_timing", skip_serializing_if = "Option::is_none")]
        timing: Option<ExecuteTiming>,
    },
    Tables {
        id: Option<Value>,
        tables: Vec<TableInfo>,
    },
    TableData {
        id: Option<Value>,
        #[serde(flatten)]
        frame: TableFrame,
        is_refreshing: bool,
    },
    /// Unsolicited poller output
    TableUpdate {
        #[serde(flatten)]
        frame: TableFrame,
    },
    SubscribeAck {
        id: Option<Value>,
        name: String,
    },
    UnsubscribeAck {
        id: Option<Value>,
        name: String,
    },
    ServerInfo {
        id: Option<Value>,
        host: String,
        port: u16,
        version: String,
        mode: String,
        table_count: usize,
    },
    ShutdownAck,
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
        message: String,
    },
}

impl Response {
    pub fn error(id: Option<Value>, message: impl Into<String>) -> Self {
        Self::Error {
            id,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Result { .. } => "result",
            Self::Tables { .. } => "tables",
            Self::TableData { .. } => "table_data",
            Self::TableUpdate { .. } => "table_update",
            Self::SubscribeAck { .. } => "subscribe_ack",
            Self::UnsubscribeAck { .. } => "unsubscribe_ack",
            Self::ServerInfo { .. } => "server_info",
            Self::ShutdownAck => "shutdown_ack",
            Self::Error { .. } => "error",
        }
    }
}

/// A transport-safe slice of a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableFrame {
    pub name: String,
    pub columns: Vec<String>,
    pub types: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub total_rows: usize,
    pub offset: usize,
}

/// Entry in a `tables` response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub name: String,
    /// -1 when the table could not be opened
    pub row_count: i64,
    pub is_refreshing: bool,
    pub columns: Vec<ColumnInfo>,
}

/// Entry in an `execute` reply's `tables`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TablePreview {
    pub name: String,
    pub row_count: usize,
    pub is_refreshing: bool,
    pub columns: Vec<ColumnInfo>,
    /// Rendered text of the first rows
    pub preview: String,
}

/// Per-stage milliseconds of one `execute`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteTiming {
    pub build_wrapper_ms: u64,
    pub run_script_ms: u64,
    pub read_result_ms: u64,
    pub cleanup_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}
