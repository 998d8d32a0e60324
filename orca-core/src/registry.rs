use std::time::Duration;

use orca_common::Result;
use tokio::task::JoinHandle;
use tracing::*;

use crate::EtcdClient;

/// KV path under which manager instances announce their base URLs.
pub const MANAGER_SERVICE_PATH: &str = "/orca/manage/userFetchService";

/// Service discovery over short-TTL registry nodes. The registry is
/// eventually consistent; consumers must tolerate stale values.
#[derive(Clone)]
pub struct ServiceRegistry {
    client: EtcdClient,
}

/// A live registration. Dropping it stops the refresh; `unregister`
/// additionally removes the node right away instead of letting it expire.
pub struct Registration {
    key: String,
    client: EtcdClient,
    refresher: JoinHandle<()>,
}

impl ServiceRegistry {
    pub fn new(client: EtcdClient) -> Self {
        Self { client }
    }

    /// Announce `value` under `path` with the given TTL in seconds. TTLs
    /// below 10 s are bumped to 15 s; the node is refreshed every
    /// `ttl - 10` seconds so it never expires while the owner is alive.
    pub async fn register(&self, path: &str, value: &str, ttl: u64) -> Result<Registration> {
        let ttl = effective_ttl(ttl);
        self.client.ensure_dir(path).await?;
        let key = self.client.create_child(path, value, ttl).await?;

        let refresher = tokio::spawn({
            let client = self.client.clone();
            let key = key.clone();
            let value = value.to_string();
            async move {
                let mut interval = tokio::time::interval(Duration::from_secs(ttl - 10));
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if let Err(error) = client.update(&key, &value, ttl).await {
                        warn!(%key, %error, "failed to refresh registry node");
                    }
                }
            }
        });

        Ok(Registration {
            key,
            client: self.client.clone(),
            refresher,
        })
    }

    /// All currently registered values under `path`, in index order.
    pub async fn get_values(&self, path: &str) -> Result<Vec<String>> {
        let nodes = self.client.ls(path).await?;
        Ok(nodes.into_iter().filter_map(|n| n.value).collect())
    }
}

impl Registration {
    pub async fn unregister(self) -> Result<()> {
        self.refresher.abort();
        self.client.delete(&self.key, true).await
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

fn effective_ttl(ttl: u64) -> u64 {
    if ttl < 10 {
        15
    } else {
        ttl
    }
}

#[cfg(test)]
mod tests {
    use super::effective_ttl;

    #[test]
    fn ttl_floor() {
        assert_eq!(effective_ttl(1), 15);
        assert_eq!(effective_ttl(9), 15);
        assert_eq!(effective_ttl(10), 10);
        assert_eq!(effective_ttl(60), 60);
        // refresh period stays positive even at the floor
        assert!(effective_ttl(0) - 10 >= 5);
    }
}
