//! Table subscription manager
//!
//! At most one background poller runs per process. Each poller wakes every
//! `poll_interval`, snapshots its table slice and emits a `table_update` only
//! when the slice's fingerprint changed since the last emitted one.
//!
//! # Cancellation
//!
//! Each poller owns the receiving end of a cancel channel. Dropping the
//! sender disconnects it, which both wakes the poller's timed wait and is
//! re-checked under the writer lock before every update is written. A
//! cancelled poller therefore never gets a line onto the wire after the
//! caller's next write (the `subscribe_ack` of a replacement, for example).
//!
//! Replacement holds the slot lock across cancel + spawn + store, so two
//! concurrent `subscribe` calls can never leave two live pollers.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use serde_json::Value;

use crate::codec::ResponseWriter;
use crate::config::SubscriptionConfig;
use crate::error::Result;
use crate::protocol::{Response, TableFrame};
use crate::session::SharedSession;
use crate::snapshot::snapshot;

/// Cheap change summary of one table slice
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    total_rows: usize,
    slice_len: usize,
    first: Option<Vec<Value>>,
    last: Option<Vec<Value>>,
}

impl Fingerprint {
    pub fn of(frame: &TableFrame) -> Self {
        Self {
            total_rows: frame.total_rows,
            slice_len: frame.rows.len(),
            first: frame.rows.first().cloned(),
            last: frame.rows.last().cloned(),
        }
    }
}

/// What a poller watches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionTarget {
    pub name: String,
    pub offset: usize,
    pub limit: usize,
}

struct ActiveSubscription {
    target: SubscriptionTarget,
    cancel: Sender<()>,
    done: Receiver<()>,
    handle: JoinHandle<()>,
}

/// Owner of the single subscription slot
pub struct SubscriptionManager {
    session: SharedSession,
    writer: ResponseWriter,
    config: SubscriptionConfig,
    active: Mutex<Option<ActiveSubscription>>,
}

impl SubscriptionManager {
    pub fn new(session: SharedSession, writer: ResponseWriter, config: SubscriptionConfig) -> Self {
        Self {
            session,
            writer,
            config,
            active: Mutex::new(None),
        }
    }

    /// Replace any running poller with one watching `target`
    ///
    /// The table's current state is taken as the baseline, so only changes
    /// made after this call produce updates.
    pub fn subscribe(&self, target: SubscriptionTarget) -> Result<()> {
        let mut slot = self.active.lock();
        if let Some(previous) = slot.take() {
            self.stop(previous);
        }

        let baseline = {
            let session = self.session.lock();
            match snapshot(session.as_ref(), &target.name, target.offset, target.limit) {
                Ok(snap) => Some(Fingerprint::of(&snap.frame)),
                Err(e) => {
                    tracing::debug!("No baseline for {}: {}", target.name, e);
                    None
                }
            }
        };

        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let (done_tx, done_rx) = bounded::<()>(1);
        let poller = Poller {
            session: self.session.clone(),
            writer: self.writer.clone(),
            target: target.clone(),
            interval: self.config.poll_interval(),
            cancel: cancel_rx,
            last: baseline,
        };
        let handle = thread::Builder::new()
            .name("dh-subscribe".to_string())
            .spawn(move || {
                poller.run();
                drop(done_tx);
            })?;

        tracing::info!(
            "Subscribed to {} (offset {}, limit {})",
            target.name,
            target.offset,
            target.limit
        );
        *slot = Some(ActiveSubscription {
            target,
            cancel: cancel_tx,
            done: done_rx,
            handle,
        });
        Ok(())
    }

    /// Cancel the running poller, if any, and return what it was watching
    pub fn cancel(&self) -> Option<SubscriptionTarget> {
        let previous = self.active.lock().take()?;
        let target = previous.target.clone();
        self.stop(previous);
        Some(target)
    }

    pub fn active_target(&self) -> Option<SubscriptionTarget> {
        self.active.lock().as_ref().map(|a| a.target.clone())
    }

    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }

    fn stop(&self, subscription: ActiveSubscription) {
        let ActiveSubscription {
            target,
            cancel,
            done,
            handle,
        } = subscription;
        drop(cancel);

        match done.recv_timeout(self.config.cancel_grace()) {
            Err(RecvTimeoutError::Timeout) => {
                tracing::debug!(
                    "Poller for {} still busy after {:?}; detaching",
                    target.name,
                    self.config.cancel_grace()
                );
            }
            _ => {
                if handle.join().is_err() {
                    tracing::warn!("Poller for {} panicked", target.name);
                }
            }
        }
        tracing::info!("Unsubscribed from {}", target.name);
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct Poller {
    session: SharedSession,
    writer: ResponseWriter,
    target: SubscriptionTarget,
    interval: Duration,
    cancel: Receiver<()>,
    last: Option<Fingerprint>,
}

impl Poller {
    fn run(mut self) {
        loop {
            match self.cancel.recv_timeout(self.interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => return,
            }

            let result = {
                let session = self.session.lock();
                snapshot(
                    session.as_ref(),
                    &self.target.name,
                    self.target.offset,
                    self.target.limit,
                )
            };
            let snap = match result {
                Ok(snap) => snap,
                Err(e) => {
                    tracing::warn!("Subscription error for {}: {}", self.target.name, e);
                    return;
                }
            };

            let fingerprint = Fingerprint::of(&snap.frame);
            if self.last.as_ref() == Some(&fingerprint) {
                continue;
            }
            self.last = Some(fingerprint);

            let update = Response::TableUpdate { frame: snap.frame };
            let cancel = &self.cancel;
            match self
                .writer
                .send_if(&update, || matches!(cancel.try_recv(), Err(TryRecvError::Empty)))
            {
                Ok(true) => tracing::debug!("Sent update for {}", self.target.name),
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!("Failed to send update for {}: {}", self.target.name, e);
                    return;
                }
            }
        }
    }
}
