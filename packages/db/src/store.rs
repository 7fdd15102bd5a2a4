//! Store abstraction: the key/list/sorted-set/pub-sub primitives the queue needs.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::StoreError;

/// Future returned by every store operation.
pub type StoreFuture<'a, T> = BoxFuture<'a, Result<T, StoreError>>;

/// A single write inside an atomic batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    Del {
        key: String,
    },
    RPush {
        key: String,
        value: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: i64,
    },
    ZRem {
        key: String,
        member: String,
    },
    SAdd {
        key: String,
        member: String,
    },
    SRem {
        key: String,
        member: String,
    },
    /// Remove `member` from `from` (if present) and add it to `to`.
    SMove {
        from: String,
        to: String,
        member: String,
    },
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Live subscription to one or more channels.
///
/// The underlying subscription is released on [`Subscription::close`] or drop.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(rx: mpsc::UnboundedReceiver<PubSubMessage>, forwarder: JoinHandle<()>) -> Self {
        Self {
            rx,
            forwarder: Some(forwarder),
        }
    }

    /// Next message, or `None` once the subscription is closed.
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
            self.rx.close();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Backend the queue persists to.
///
/// Sorted-set scores are epoch milliseconds.
pub trait Store: Send + Sync + 'static {
    /// Atomically increment a counter and return the new value.
    fn incr<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64>;

    fn hget<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>>;

    /// Apply all writes as one atomic batch.
    fn exec(&self, ops: Vec<Op>) -> StoreFuture<'_, ()>;

    /// Pop the head of the first non-empty list, waiting up to `timeout`.
    fn blpop<'a>(
        &'a self,
        keys: &'a [String],
        timeout: Duration,
    ) -> StoreFuture<'a, Option<(String, String)>>;

    /// Atomically read and remove every member scored within `[min, max]`.
    fn zclaim<'a>(&'a self, key: &'a str, min: i64, max: i64) -> StoreFuture<'a, Vec<(String, i64)>>;

    fn zcard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    fn scard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    fn sismember<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool>;

    fn llen<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64>;

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> StoreFuture<'a, ()>;

    /// Subscribe to `channels`; the subscription is active once this resolves.
    fn subscribe(&self, channels: Vec<String>) -> StoreFuture<'_, Subscription>;

    fn ping(&self) -> StoreFuture<'_, ()>;

    /// A handle with its own connection, for blocking pops.
    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn Store>>;

    /// Release connections held by this handle.
    fn close(&self) -> StoreFuture<'_, ()>;
}
