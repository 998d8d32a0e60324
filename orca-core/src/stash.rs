use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

enum StashRequest<V> {
    Put { key: String, value: Option<V> },
    Get { key: String, reply: oneshot::Sender<Option<V>> },
}

/// In-memory map with per-entry TTL, owned by a single actor task. All
/// access goes through channels, so a get enqueued after a put observes the
/// put, and after the scheduled removal fires the key reads as absent.
///
/// Holds the public-key-phase user between the two authentication phases of
/// a session; nothing is persisted.
#[derive(Clone)]
pub struct TimedStash<V> {
    tx: mpsc::UnboundedSender<StashRequest<V>>,
}

impl<V: Clone + Send + 'static> TimedStash<V> {
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<StashRequest<V>>();
        tokio::spawn(async move {
            let mut entries: HashMap<String, V> = HashMap::new();
            while let Some(request) = rx.recv().await {
                match request {
                    StashRequest::Put { key, value: Some(value) } => {
                        entries.insert(key, value);
                    }
                    StashRequest::Put { key, value: None } => {
                        entries.remove(&key);
                    }
                    StashRequest::Get { key, reply } => {
                        let _ = reply.send(entries.get(&key).cloned());
                    }
                }
            }
        });
        Self { tx }
    }

    /// Insert a value and schedule its removal after `ttl`.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let _ = self.tx.send(StashRequest::Put {
            key: key.clone(),
            value: Some(value),
        });
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let _ = tx.send(StashRequest::Put { key, value: None });
        });
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(StashRequest::Get {
                key: key.to_string(),
                reply,
            })
            .ok()?;
        rx.await.ok().flatten()
    }
}

impl<V: Clone + Send + 'static> Default for TimedStash<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_then_get() {
        let stash = TimedStash::new();
        stash.put("a", 1u32, Duration::from_secs(30));
        assert_eq!(stash.get("a").await, Some(1));
        assert_eq!(stash.get("b").await, None);
    }

    #[tokio::test]
    async fn overwrite_keeps_latest() {
        let stash = TimedStash::new();
        stash.put("a", 1u32, Duration::from_secs(30));
        stash.put("a", 2u32, Duration::from_secs(30));
        assert_eq!(stash.get("a").await, Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn entry_expires_after_ttl() {
        let stash = TimedStash::new();
        stash.put("a", 7u32, Duration::from_secs(30));
        assert_eq!(stash.get("a").await, Some(7));

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(stash.get("a").await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_independently() {
        let stash = TimedStash::new();
        stash.put("short", 1u32, Duration::from_secs(5));
        stash.put("long", 2u32, Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(stash.get("short").await, None);
        assert_eq!(stash.get("long").await, Some(2));
    }
}
