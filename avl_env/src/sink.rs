//! Outbound record handoff for the AVL engine.
//!
//! Arrivals, departures, match records, predictions and vehicle-state
//! notifications leave the core through a [`Sink`]. Delivery is a
//! non-blocking enqueue: the report loop never waits on storage.
//!
//! ```text
//! AvlProcessor                 Sink                  Durable store
//!   |                           |                          |
//!   |-- try_deliver(rec) ------>|                          |
//!   |<-- Ok / Err(SinkFull) ----|                          |
//!   |                           |-- [own retry/backoff] -->|
//! ```

use crate::error::EnvError;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Non-blocking outbound handoff.
pub trait Sink<T>: Send + Sync {
    /// Enqueues a record without blocking.
    ///
    /// # Returns
    /// * `Ok(())` - Record queued
    /// * `Err(EnvError::SinkFull)` - Queue saturated, record not queued
    /// * `Err(EnvError::SinkClosed)` - Consumer has shut down
    fn try_deliver(&self, item: T) -> Result<(), EnvError>;
}

/// Sink backed by a bounded tokio channel.
pub struct ChannelSink<T> {
    name: String,
    tx: mpsc::Sender<T>,
}

impl<T: Send> ChannelSink<T> {
    /// Creates a sink plus the receiver the consumer should drain.
    pub fn bounded(name: impl Into<String>, capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { name: name.into(), tx }, rx)
    }
}

impl<T: Send> Sink<T> for ChannelSink<T> {
    fn try_deliver(&self, item: T) -> Result<(), EnvError> {
        self.tx.try_send(item).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => EnvError::full(self.name.clone()),
            mpsc::error::TrySendError::Closed(_) => EnvError::closed(&self.name),
        })
    }
}

/// In-memory sink that keeps every record; used by replay and tests.
pub struct CollectingSink<T> {
    items: Mutex<Vec<T>>,
}

impl<T: Clone + Send> CollectingSink<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Copy of everything delivered so far.
    pub fn items(&self) -> Vec<T> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Removes and returns everything delivered so far.
    pub fn drain(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn len(&self) -> usize {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone + Send> Default for CollectingSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send> Sink<T> for CollectingSink<T> {
    fn try_deliver(&self, item: T) -> Result<(), EnvError> {
        self.items.lock().unwrap_or_else(|e| e.into_inner()).push(item);
        Ok(())
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl<T> Sink<T> for NullSink {
    fn try_deliver(&self, _item: T) -> Result<(), EnvError> {
        Ok(())
    }
}
