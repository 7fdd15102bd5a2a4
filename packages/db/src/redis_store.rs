//! Redis-backed store (requires the `redis` feature).
//!
//! Batches run as MULTI/EXEC pipelines; blocking pops use a dedicated
//! connection so they never stall commands multiplexed on the shared one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tokio::sync::{Mutex, mpsc};

use crate::StoreError;
use crate::store::{Op, PubSubMessage, Store, StoreFuture, Subscription};

/// Store backed by a Redis server.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: Arc<Mutex<Option<MultiplexedConnection>>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Create a store for `url`. Connections are opened on first use.
    pub fn open(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        Ok(Self::with_client(client))
    }

    fn with_client(client: redis::Client) -> Self {
        Self {
            client,
            conn: Arc::new(Mutex::new(None)),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn connection(&self) -> Result<MultiplexedConnection, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        let mut slot = self.conn.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

/// Score argument for range commands; the integer extremes map to the
/// open bounds.
fn score_bound(score: i64) -> String {
    match score {
        i64::MIN => "-inf".to_string(),
        i64::MAX => "+inf".to_string(),
        score => score.to_string(),
    }
}

fn append_op(pipe: &mut redis::Pipeline, op: Op) {
    match op {
        Op::HSet { key, fields } => {
            pipe.hset_multiple(key, &fields).ignore();
        }
        Op::Del { key } => {
            pipe.del(key).ignore();
        }
        Op::RPush { key, value } => {
            pipe.rpush(key, value).ignore();
        }
        Op::ZAdd { key, member, score } => {
            pipe.zadd(key, member, score).ignore();
        }
        Op::ZRem { key, member } => {
            pipe.zrem(key, member).ignore();
        }
        Op::SAdd { key, member } => {
            pipe.sadd(key, member).ignore();
        }
        Op::SRem { key, member } => {
            pipe.srem(key, member).ignore();
        }
        Op::SMove { from, to, member } => {
            pipe.srem(from, &member).ignore();
            pipe.sadd(to, member).ignore();
        }
    }
}

impl Store for RedisStore {
    fn incr<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            Ok(conn.incr(key, 1).await?)
        })
    }

    fn hget<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            Ok(conn.hget(key, field).await?)
        })
    }

    fn exec(&self, ops: Vec<Op>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if ops.is_empty() {
                return Ok(());
            }
            let mut conn = self.connection().await?;
            let mut pipe = redis::pipe();
            pipe.atomic();
            for op in ops {
                append_op(&mut pipe, op);
            }
            let () = pipe.query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn blpop<'a>(
        &'a self,
        keys: &'a [String],
        timeout: Duration,
    ) -> StoreFuture<'a, Option<(String, String)>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(keys)
                .arg(timeout.as_secs_f64())
                .query_async(&mut conn)
                .await?;
            Ok(popped)
        })
    }

    fn zclaim<'a>(&'a self, key: &'a str, min: i64, max: i64) -> StoreFuture<'a, Vec<(String, i64)>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let (claimed,): (Vec<(String, f64)>,) = redis::pipe()
                .atomic()
                .cmd("ZRANGEBYSCORE")
                .arg(key)
                .arg(score_bound(min))
                .arg(score_bound(max))
                .arg("WITHSCORES")
                .cmd("ZREMRANGEBYSCORE")
                .arg(key)
                .arg(score_bound(min))
                .arg(score_bound(max))
                .ignore()
                .query_async(&mut conn)
                .await?;
            Ok(claimed
                .into_iter()
                .map(|(member, score)| (member, score as i64))
                .collect())
        })
    }

    fn zcard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            Ok(conn.zcard(key).await?)
        })
    }

    fn scard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            Ok(conn.scard(key).await?)
        })
    }

    fn sismember<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            Ok(conn.sismember(key, member).await?)
        })
    }

    fn llen<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            Ok(conn.llen(key).await?)
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let _: i64 = conn.publish(channel, payload).await?;
            Ok(())
        })
    }

    fn subscribe(&self, channels: Vec<String>) -> StoreFuture<'_, Subscription> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(StoreError::Closed);
            }
            let mut pubsub = self.client.get_async_pubsub().await?;
            for channel in &channels {
                pubsub.subscribe(channel).await?;
            }
            let (tx, rx) = mpsc::unbounded_channel();
            let forwarder = tokio::spawn(async move {
                let mut messages = pubsub.into_on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(e) => {
                            tracing::warn!("Dropping undecodable pub/sub payload: {}", e);
                            continue;
                        }
                    };
                    let message = PubSubMessage {
                        channel: msg.get_channel_name().to_string(),
                        payload,
                    };
                    if tx.send(message).is_err() {
                        break;
                    }
                }
            });
            Ok(Subscription::new(rx, forwarder))
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(())
        })
    }

    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn Store>> {
        Box::pin(async move {
            let store = Self::with_client(self.client.clone());
            store.connection().await?;
            Ok(Arc::new(store) as Arc<dyn Store>)
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.closed.store(true, Ordering::Release);
            self.conn.lock().await.take();
            tracing::debug!("Redis connection released");
            Ok(())
        })
    }
}
