//! Table-engine session collaborator
//!
//! The runner never implements the query engine. It talks to it through the
//! [`Session`] trait and reads tables as Arrow data through [`TableHandle`].
//!
//! # Locking
//!
//! The dispatch thread and the subscription poller share one session. All
//! access goes through [`SharedSession::lock`], and a caller holds the guard
//! for its whole engine interaction (an `execute` keeps it from `run_script`
//! until the result object is cleaned up). Engine calls are therefore fully
//! serialised; a slow poll delays the next command by at most one snapshot.

pub mod bridge;

use std::collections::BTreeSet;
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use parking_lot::{Mutex, MutexGuard};

use crate::error::Result;

pub use bridge::BridgeSession;

/// One long-lived connection to the table engine
pub trait Session: Send {
    /// Run a script in the engine's shared namespace
    fn run_script(&self, code: &str) -> Result<()>;

    /// Open a table by its namespace name
    fn open_table(&self, name: &str) -> Result<Box<dyn TableHandle>>;

    /// Names of every table-valued variable in the namespace
    fn list_table_names(&self) -> Result<BTreeSet<String>>;

    /// Engine version, if the engine reports one
    fn version(&self) -> Option<String> {
        None
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Read access to a single opened table
pub trait TableHandle: Send {
    fn row_count(&self) -> usize;
    fn is_refreshing(&self) -> bool;
    fn schema(&self) -> SchemaRef;
    /// Rows `[offset, offset + limit)`, clamped to the table
    fn slice_rows(&self, offset: usize, limit: usize) -> Result<RecordBatch>;
}

/// A [`TableHandle`] over one materialised Arrow batch
#[derive(Debug, Clone)]
pub struct ArrowTable {
    batch: RecordBatch,
    refreshing: bool,
}

impl ArrowTable {
    pub fn new(batch: RecordBatch, refreshing: bool) -> Self {
        Self { batch, refreshing }
    }
}

impl TableHandle for ArrowTable {
    fn row_count(&self) -> usize {
        self.batch.num_rows()
    }

    fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    fn slice_rows(&self, offset: usize, limit: usize) -> Result<RecordBatch> {
        let total = self.batch.num_rows();
        let start = offset.min(total);
        let len = limit.min(total - start);
        Ok(self.batch.slice(start, len))
    }
}

/// The one session shared by the dispatcher and the poller
#[derive(Clone)]
pub struct SharedSession {
    inner: Arc<Mutex<Box<dyn Session>>>,
}

impl SharedSession {
    pub fn new<S: Session + 'static>(session: S) -> Self {
        Self::from_boxed(Box::new(session))
    }

    pub fn from_boxed(session: Box<dyn Session>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(session)),
        }
    }

    /// Exclusive access for one engine interaction
    pub fn lock(&self) -> MutexGuard<'_, Box<dyn Session>> {
        self.inner.lock()
    }
}
