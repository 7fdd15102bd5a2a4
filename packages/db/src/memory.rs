//! In-process store backend, used for tests and single-process deployments.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::time::Instant;

use crate::store::{Op, PubSubMessage, Store, StoreFuture, Subscription};

#[derive(Debug, Default)]
struct Data {
    counters: HashMap<String, i64>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    zsets: HashMap<String, HashMap<String, i64>>,
    sets: HashMap<String, HashSet<String>>,
}

impl Data {
    fn apply(&mut self, op: Op) -> bool {
        match op {
            Op::HSet { key, fields } => {
                self.hashes.entry(key).or_default().extend(fields);
            }
            Op::Del { key } => {
                self.counters.remove(&key);
                self.hashes.remove(&key);
                self.lists.remove(&key);
                self.zsets.remove(&key);
                self.sets.remove(&key);
            }
            Op::RPush { key, value } => {
                self.lists.entry(key).or_default().push_back(value);
                return true;
            }
            Op::ZAdd { key, member, score } => {
                self.zsets.entry(key).or_default().insert(member, score);
            }
            Op::ZRem { key, member } => {
                if let Some(zset) = self.zsets.get_mut(&key) {
                    zset.remove(&member);
                }
            }
            Op::SAdd { key, member } => {
                self.sets.entry(key).or_default().insert(member);
            }
            Op::SRem { key, member } => {
                if let Some(set) = self.sets.get_mut(&key) {
                    set.remove(&member);
                }
            }
            Op::SMove { from, to, member } => {
                if let Some(set) = self.sets.get_mut(&from) {
                    set.remove(&member);
                }
                self.sets.entry(to).or_default().insert(member);
            }
        }
        false
    }

    fn pop_first(&mut self, keys: &[String]) -> Option<(String, String)> {
        keys.iter().find_map(|key| {
            self.lists
                .get_mut(key)
                .and_then(|list| list.pop_front())
                .map(|value| (key.clone(), value))
        })
    }
}

#[derive(Debug)]
struct Inner {
    data: Mutex<Data>,
    pushed: Notify,
    channel: broadcast::Sender<PubSubMessage>,
}

/// Store kept entirely in memory.
///
/// Clones share the same data. Only the handle returned by [`MemoryStore::new`]
/// clears it on close; dedicated handles close as a no-op.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
    owner: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (channel, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                data: Mutex::new(Data::default()),
                pushed: Notify::new(),
                channel,
            }),
            owner: true,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn incr<'a>(&'a self, key: &'a str) -> StoreFuture<'a, i64> {
        Box::pin(async move {
            let mut data = self.inner.data.lock().await;
            let counter = data.counters.entry(key.to_string()).or_insert(0);
            *counter += 1;
            Ok(*counter)
        })
    }

    fn hget<'a>(&'a self, key: &'a str, field: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move {
            let data = self.inner.data.lock().await;
            Ok(data.hashes.get(key).and_then(|h| h.get(field)).cloned())
        })
    }

    fn exec(&self, ops: Vec<Op>) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let pushed = {
                let mut data = self.inner.data.lock().await;
                ops.into_iter().fold(false, |pushed, op| data.apply(op) | pushed)
            };
            if pushed {
                self.inner.pushed.notify_waiters();
            }
            Ok(())
        })
    }

    fn blpop<'a>(
        &'a self,
        keys: &'a [String],
        timeout: Duration,
    ) -> StoreFuture<'a, Option<(String, String)>> {
        Box::pin(async move {
            let deadline = Instant::now() + timeout;
            loop {
                // Registered before checking so a push in between still wakes us.
                let notified = self.inner.pushed.notified();
                if let Some(popped) = self.inner.data.lock().await.pop_first(keys) {
                    return Ok(Some(popped));
                }
                if tokio::time::timeout_at(deadline, notified).await.is_err() {
                    return Ok(None);
                }
            }
        })
    }

    fn zclaim<'a>(&'a self, key: &'a str, min: i64, max: i64) -> StoreFuture<'a, Vec<(String, i64)>> {
        Box::pin(async move {
            let mut data = self.inner.data.lock().await;
            let Some(zset) = data.zsets.get_mut(key) else {
                return Ok(Vec::new());
            };
            let mut claimed: Vec<(String, i64)> = zset
                .iter()
                .filter(|(_, score)| (min..=max).contains(*score))
                .map(|(member, score)| (member.clone(), *score))
                .collect();
            for (member, _) in &claimed {
                zset.remove(member);
            }
            claimed.sort_by_key(|(_, score)| *score);
            Ok(claimed)
        })
    }

    fn zcard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let data = self.inner.data.lock().await;
            Ok(data.zsets.get(key).map_or(0, |z| z.len() as u64))
        })
    }

    fn scard<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let data = self.inner.data.lock().await;
            Ok(data.sets.get(key).map_or(0, |s| s.len() as u64))
        })
    }

    fn sismember<'a>(&'a self, key: &'a str, member: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let data = self.inner.data.lock().await;
            Ok(data.sets.get(key).is_some_and(|s| s.contains(member)))
        })
    }

    fn llen<'a>(&'a self, key: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let data = self.inner.data.lock().await;
            Ok(data.lists.get(key).map_or(0, |l| l.len() as u64))
        })
    }

    fn publish<'a>(&'a self, channel: &'a str, payload: String) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            // Nobody listening is not an error.
            let _ = self.inner.channel.send(PubSubMessage {
                channel: channel.to_string(),
                payload,
            });
            Ok(())
        })
    }

    fn subscribe(&self, channels: Vec<String>) -> StoreFuture<'_, Subscription> {
        Box::pin(async move {
            let mut rx = self.inner.channel.subscribe();
            let channels: HashSet<String> = channels.into_iter().collect();
            let (tx, out) = mpsc::unbounded_channel();
            let forwarder = tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => {
                            if channels.contains(&message.channel) && tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!("Subscription lagged, {} messages skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            });
            Ok(Subscription::new(out, forwarder))
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    fn dedicated(&self) -> StoreFuture<'_, Arc<dyn Store>> {
        Box::pin(async move {
            let handle = Self {
                inner: self.inner.clone(),
                owner: false,
            };
            Ok(Arc::new(handle) as Arc<dyn Store>)
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if !self.owner {
                return Ok(());
            }
            *self.inner.data.lock().await = Data::default();
            tracing::debug!("Memory store cleared");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blpop_times_out_on_empty_lists() {
        let store = MemoryStore::new();
        let keys = vec!["q:a".to_string()];
        let popped = store.blpop(&keys, Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn blpop_wakes_on_push() {
        let store = MemoryStore::new();
        let waiter = store.clone();
        let task = tokio::spawn(async move {
            let keys = vec!["q:a".to_string(), "q:b".to_string()];
            waiter.blpop(&keys, Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        store
            .exec(vec![Op::RPush {
                key: "q:b".into(),
                value: "7".into(),
            }])
            .await
            .unwrap();
        let popped = task.await.unwrap().unwrap();
        assert_eq!(popped, Some(("q:b".to_string(), "7".to_string())));
    }

    #[tokio::test]
    async fn zclaim_removes_claimed_range() {
        let store = MemoryStore::new();
        let ops = (1..=5)
            .map(|i| Op::ZAdd {
                key: "z".into(),
                member: i.to_string(),
                score: i * 100,
            })
            .collect();
        store.exec(ops).await.unwrap();
        let claimed = store.zclaim("z", 150, 350).await.unwrap();
        assert_eq!(claimed, vec![("2".to_string(), 200), ("3".to_string(), 300)]);
        assert_eq!(store.zcard("z").await.unwrap(), 3);
        assert!(store.zclaim("z", 150, 350).await.unwrap().is_empty());

        let overdue = store.zclaim("z", i64::MIN, 150).await.unwrap();
        assert_eq!(overdue, vec![("1".to_string(), 100)]);
    }

    #[tokio::test]
    async fn smove_lands_in_destination() {
        let store = MemoryStore::new();
        store
            .exec(vec![Op::SMove {
                from: "s:new".into(),
                to: "s:queued".into(),
                member: "1".into(),
            }])
            .await
            .unwrap();
        assert!(store.sismember("s:queued", "1").await.unwrap());
        assert_eq!(store.scard("s:new").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn closing_a_dedicated_handle_keeps_data() {
        let store = MemoryStore::new();
        store.incr("n").await.unwrap();
        let dedicated = store.dedicated().await.unwrap();
        dedicated.close().await.unwrap();
        assert_eq!(store.incr("n").await.unwrap(), 2);

        store.close().await.unwrap();
        assert_eq!(store.incr("n").await.unwrap(), 1);
    }
}
