use std::sync::Arc;

use orca_common::{Gateway, Result};
use tokio::sync::Mutex;

use crate::{AuthEngine, ConfigStore, EtcdClient, ManagerClient, ServiceRegistry};

/// Shared state for the gateway process. Constructed once in `main` and
/// cloned into every session; nothing here is a hidden global.
#[derive(Clone)]
pub struct Services {
    pub zone: String,
    pub kv: EtcdClient,
    pub config_store: ConfigStore,
    pub registry: ServiceRegistry,
    /// The active gateway settings; swapped wholesale by the config
    /// watcher. Sessions snapshot it at accept time.
    pub gateway: Arc<Mutex<Gateway>>,
    pub auth: Arc<AuthEngine>,
}

impl Services {
    /// Wire up the service bundle for a zone: bootstrap the zone records
    /// when missing and load the active gateway settings.
    pub async fn new(kv: EtcdClient, zone: String) -> Result<Self> {
        let config_store = ConfigStore::new(kv.clone());
        config_store.ensure_zone(&zone).await?;
        let gateway = config_store.ensure_gateway(&zone).await?;
        config_store.ensure_cluster_config(&zone).await?;

        let registry = ServiceRegistry::new(kv.clone());
        let managers = ManagerClient::new(Arc::new(registry.clone()))?;

        Ok(Self {
            zone,
            kv,
            config_store,
            registry,
            gateway: Arc::new(Mutex::new(gateway)),
            auth: Arc::new(AuthEngine::new(managers)),
        })
    }

    pub async fn gateway_snapshot(&self) -> Gateway {
        self.gateway.lock().await.clone()
    }
}
