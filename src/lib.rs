//! dh-runner: execution daemon for a table-engine session
//!
//! Speaks newline-delimited JSON with a host process (over stdio or TCP),
//! runs user code inside one long-lived engine session, and streams table
//! data back, including change-driven updates for one subscribed table.
//!
//! # Example
//!
//! ```ignore
//! use dh_runner::{DaemonConfig, lifecycle};
//!
//! let config = DaemonConfig::default();
//! lifecycle::run(&config)?;
//! ```

pub mod analyzer;
pub mod cli;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod lifecycle;
pub mod protocol;
pub mod result_channel;
pub mod session;
pub mod snapshot;
pub mod subscription;
pub mod wrapper;

// Re-export commonly used types
pub use cli::Args;
pub use codec::{Frame, FrameReader, ResponseWriter};
pub use config::{DaemonConfig, RunnerMode};
pub use dispatcher::{Dispatcher, Flow, ServerIdentity};
pub use error::{Result, RunnerError};
pub use protocol::{Request, Response, TableFrame, TableInfo};
pub use session::{ArrowTable, BridgeSession, Session, SharedSession, TableHandle};
pub use subscription::{SubscriptionManager, SubscriptionTarget};
