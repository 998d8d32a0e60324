use std::time::Duration;

use orca_common::{ClusterConfig, Gateway, LogLevel, OrcaError, Result};
use russh::keys::ssh_key::private::{KeypairData, RsaKeypair};
use russh::keys::ssh_key::LineEnding;
use russh::keys::PrivateKey;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tracing::*;

use crate::{EtcdClient, JsonPersister};

const WATCH_RESTART_DELAY: Duration = Duration::from_secs(2);

/// Zone-scoped configuration records. The gateway only ever reads and
/// watches them; mutation happens through the management plane (or the
/// bootstrap defaults below).
#[derive(Clone)]
pub struct ConfigStore {
    persister: JsonPersister,
}

impl ConfigStore {
    pub fn new(client: EtcdClient) -> Self {
        Self {
            persister: JsonPersister::new(client, ""),
        }
    }

    fn zone_key(zone: &str, key: &str) -> String {
        format!("/zones/{zone}/{key}")
    }

    pub async fn zones(&self) -> Result<Vec<String>> {
        self.persister.ls("/zones").await
    }

    pub async fn ensure_zone(&self, zone: &str) -> Result<()> {
        let exists = match self.zones().await {
            Ok(zones) => zones.iter().any(|z| z == zone),
            Err(OrcaError::NotFound) => false,
            Err(e) => return Err(e),
        };
        if !exists {
            debug!(%zone, "zone not found, creating it");
            self.persister
                .put(&Self::zone_key(zone, "created"), &OffsetDateTime::now_utc())
                .await?;
        }
        Ok(())
    }

    pub async fn gateway(&self, zone: &str) -> Result<Gateway> {
        self.persister.get(&Self::zone_key(zone, "gateway")).await
    }

    pub async fn put_gateway(&self, zone: &str, gateway: &Gateway) -> Result<()> {
        russh::keys::decode_secret_key(&gateway.host_key, None)
            .map_err(|e| OrcaError::ConfigInvalid(format!("host key does not parse: {e}")))?;
        self.persister
            .put(&Self::zone_key(zone, "gateway"), gateway)
            .await
    }

    /// Load the zone's gateway record, generating and persisting defaults
    /// when none exists yet.
    pub async fn ensure_gateway(&self, zone: &str) -> Result<Gateway> {
        match self.gateway(zone).await {
            Ok(gateway) => Ok(gateway),
            Err(OrcaError::NotFound) => {
                debug!(%zone, "no gateway settings, creating defaults");
                let gateway = generate_gateway()?;
                self.put_gateway(zone, &gateway).await?;
                Ok(gateway)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn cluster_config(&self, zone: &str) -> Result<ClusterConfig> {
        self.persister.get(&Self::zone_key(zone, "cluster")).await
    }

    pub async fn put_cluster_config(&self, zone: &str, config: &ClusterConfig) -> Result<()> {
        russh::keys::decode_secret_key(&config.key, None)
            .map_err(|e| OrcaError::ConfigInvalid(format!("cluster key does not parse: {e}")))?;
        self.persister
            .put(&Self::zone_key(zone, "cluster"), config)
            .await
    }

    pub async fn ensure_cluster_config(&self, zone: &str) -> Result<ClusterConfig> {
        match self.cluster_config(zone).await {
            Ok(config) => Ok(config),
            Err(OrcaError::NotFound) => {
                debug!(%zone, "no cluster settings, creating defaults");
                let config = generate_cluster_config(zone)?;
                self.put_cluster_config(zone, &config).await?;
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Stream of decoded gateway records as they change in the KV store.
    /// Watch errors are logged and the subscription restarts after a short
    /// delay; the consumer keeps running on its last-known config.
    pub fn watch_gateway(&self, zone: &str) -> mpsc::UnboundedReceiver<Gateway> {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = self.persister.client().clone();
        let path = self.persister.path(&Self::zone_key(zone, "gateway"));

        tokio::spawn(async move {
            let mut after_index = None;
            loop {
                match client.watch(&path, after_index).await {
                    Ok(node) => {
                        after_index = Some(node.modified_index + 1);
                        let Some(value) = node.value else { continue };
                        match serde_json::from_str::<Gateway>(&value) {
                            Ok(gateway) => {
                                if tx.send(gateway).is_err() {
                                    break;
                                }
                            }
                            Err(error) => {
                                error!(%path, %error, "undecodable gateway record, keeping current settings");
                            }
                        }
                    }
                    Err(error) => {
                        error!(%path, %error, "gateway watch failed, restarting");
                        tokio::time::sleep(WATCH_RESTART_DELAY).await;
                    }
                }
            }
        });

        rx
    }
}

/// Default gateway settings with a fresh RSA-2048 host key.
pub fn generate_gateway() -> Result<Gateway> {
    Ok(Gateway {
        default_host: String::new(),
        force_2fa: false,
        host_key: generate_private_key_pem("orca-gateway")?,
        log_level: LogLevel::Debug,
        check_allow: true,
        max_autologin_2fa: 300,
        allowed_cidrs: vec!["0.0.0.0/0".to_string()],
        denied_cidrs: vec!["127.0.0.1/8".to_string()],
        allow_deny: true,
        verify_host_keys: false,
        forward_ports: true,
    })
}

pub fn generate_cluster_config(zone: &str) -> Result<ClusterConfig> {
    Ok(ClusterConfig {
        name: format!("orca {zone}"),
        key: generate_private_key_pem("orca-cluster")?,
        self_register: false,
    })
}

fn generate_private_key_pem(comment: &str) -> Result<String> {
    let keypair = RsaKeypair::random(&mut getrandom::rand_core::UnwrapErr(getrandom::SysRng), 2048)
        .map_err(|e| OrcaError::ConfigInvalid(format!("RSA generation failed: {e}")))?;
    let key = PrivateKey::new(KeypairData::Rsa(keypair), comment)
        .map_err(|e| OrcaError::ConfigInvalid(format!("key assembly failed: {e}")))?;
    let pem = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| OrcaError::ConfigInvalid(format!("PEM encoding failed: {e}")))?;
    Ok(pem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_gateway_defaults() {
        let gateway = generate_gateway().unwrap();
        assert_eq!(gateway.log_level, LogLevel::Debug);
        assert!(gateway.check_allow);
        assert!(gateway.allow_deny);
        assert_eq!(gateway.allowed_cidrs, vec!["0.0.0.0/0"]);
        assert_eq!(gateway.denied_cidrs, vec!["127.0.0.1/8"]);
        assert!(!gateway.verify_host_keys);
    }

    #[test]
    fn generated_host_key_parses() {
        let gateway = generate_gateway().unwrap();
        let key = russh::keys::decode_secret_key(&gateway.host_key, None).unwrap();
        assert!(matches!(key.key_data(), KeypairData::Rsa(_)));
    }

    #[test]
    fn gateway_record_roundtrips_with_wire_names() {
        let gateway = generate_gateway().unwrap();
        let encoded = serde_json::to_string(&gateway).unwrap();
        assert!(encoded.contains("\"hostkey\""));
        assert!(encoded.contains("\"checkAllow\""));
        assert!(encoded.contains("\"allowDeny\""));
        let decoded: Gateway = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.host_key, gateway.host_key);
    }

    #[test]
    fn partial_gateway_record_decodes_with_defaults() {
        let decoded: Gateway =
            serde_json::from_str(r#"{"hostkey": "x", "loglevel": "INFO"}"#).unwrap();
        assert!(decoded.check_allow);
        assert!(decoded.forward_ports);
        assert!(!decoded.force_2fa);
        assert_eq!(decoded.log_level, LogLevel::Info);
        assert_eq!(decoded.max_autologin_2fa, 300);
    }
}
