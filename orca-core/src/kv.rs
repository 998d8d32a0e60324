use std::sync::Arc;
use std::time::Duration;

use orca_common::{OrcaError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::*;

/// Root of everything orca persists in the KV store.
pub const KV_ROOT: &str = "/orca";

const ETCD_ERR_KEY_NOT_FOUND: u32 = 100;

#[derive(Debug, Clone, Default)]
pub struct EtcdTlsOptions {
    pub ca: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EtcdNode {
    pub key: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub dir: bool,
    #[serde(default)]
    pub nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    pub modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    node: EtcdNode,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u32,
    #[serde(default)]
    message: String,
}

/// Client for the etcd v2 keyspace API. Operations try the configured
/// machines in order and use the first one that responds.
#[derive(Clone)]
pub struct EtcdClient {
    machines: Arc<Vec<String>>,
    http: reqwest::Client,
}

enum Call<'a> {
    Get { query: &'a str },
    Put { form: Vec<(&'static str, String)> },
    Post { form: Vec<(&'static str, String)> },
    Delete { query: &'a str },
}

impl EtcdClient {
    pub fn new(machines: Vec<String>, tls: EtcdTlsOptions) -> Result<Self> {
        if machines.is_empty() {
            return Err(OrcaError::ConfigInvalid("no etcd machines given".into()));
        }
        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(5));
        if let Some(ca) = &tls.ca {
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(ca).map_err(OrcaError::other)?,
            );
        }
        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
            let mut pem = cert.clone();
            pem.extend_from_slice(key);
            builder =
                builder.identity(reqwest::Identity::from_pem(&pem).map_err(OrcaError::other)?);
        }
        Ok(Self {
            machines: Arc::new(
                machines
                    .into_iter()
                    .map(|m| m.trim_end_matches('/').to_string())
                    .collect(),
            ),
            http: builder.build().map_err(OrcaError::other)?,
        })
    }

    pub async fn get(&self, path: &str) -> Result<EtcdNode> {
        self.call(path, Call::Get { query: "" }).await
    }

    /// Children of a directory node.
    pub async fn ls(&self, path: &str) -> Result<Vec<EtcdNode>> {
        let node = self
            .call(path, Call::Get { query: "?sorted=true" })
            .await?;
        Ok(node.nodes)
    }

    pub async fn set(&self, path: &str, value: &str, ttl: Option<u64>) -> Result<EtcdNode> {
        let mut form = vec![("value", value.to_string())];
        if let Some(ttl) = ttl {
            form.push(("ttl", ttl.to_string()));
        }
        self.call(path, Call::Put { form }).await
    }

    pub async fn ensure_dir(&self, path: &str) -> Result<()> {
        match self.get(path).await {
            Ok(_) => Ok(()),
            Err(OrcaError::NotFound) => {
                self.call(path, Call::Put { form: vec![("dir", "true".into())] })
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Create an in-order child node under `path`; returns its full key.
    pub async fn create_child(&self, path: &str, value: &str, ttl: u64) -> Result<String> {
        let mut form = vec![("value", value.to_string())];
        if ttl > 0 {
            form.push(("ttl", ttl.to_string()));
        }
        let node = self.call(path, Call::Post { form }).await?;
        Ok(node.key)
    }

    /// Refresh an existing node's value and TTL.
    pub async fn update(&self, key: &str, value: &str, ttl: u64) -> Result<()> {
        let form = vec![
            ("value", value.to_string()),
            ("ttl", ttl.to_string()),
            ("prevExist", "true".to_string()),
        ];
        self.call(key, Call::Put { form }).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        let query = if recursive { "?recursive=true" } else { "" };
        self.call(path, Call::Delete { query }).await?;
        Ok(())
    }

    /// Long-poll for the next change of `path`. Blocks until the store
    /// reports a modification after `after_index` (or any, when `None`).
    pub async fn watch(&self, path: &str, after_index: Option<u64>) -> Result<EtcdNode> {
        let query = match after_index {
            Some(idx) => format!("?wait=true&waitIndex={idx}"),
            None => "?wait=true".to_string(),
        };
        self.call(path, Call::Get { query: &query }).await
    }

    async fn call(&self, path: &str, call: Call<'_>) -> Result<EtcdNode> {
        let mut last_error = None;
        for machine in self.machines.iter() {
            let result = match &call {
                Call::Get { query } => {
                    let url = format!("{machine}/v2/keys{path}{query}");
                    self.http.get(&url).send().await
                }
                Call::Put { form } => {
                    let url = format!("{machine}/v2/keys{path}");
                    self.http.put(&url).form(form).send().await
                }
                Call::Post { form } => {
                    let url = format!("{machine}/v2/keys{path}");
                    self.http.post(&url).form(form).send().await
                }
                Call::Delete { query } => {
                    let url = format!("{machine}/v2/keys{path}{query}");
                    self.http.delete(&url).send().await
                }
            };
            let response = match result {
                Ok(response) => response,
                Err(error) => {
                    debug!(%machine, %error, "etcd machine unreachable, trying next");
                    last_error = Some(error.to_string());
                    continue;
                }
            };
            let status = response.status();
            let body = response.text().await.map_err(OrcaError::other)?;
            if status.is_success() {
                let decoded: EtcdResponse = serde_json::from_str(&body)?;
                return Ok(decoded.node);
            }
            if let Ok(err) = serde_json::from_str::<EtcdErrorBody>(&body) {
                if err.error_code == ETCD_ERR_KEY_NOT_FOUND {
                    return Err(OrcaError::NotFound);
                }
                return Err(OrcaError::ProtocolError(format!(
                    "etcd error {}: {}",
                    err.error_code, err.message
                )));
            }
            return Err(OrcaError::ProtocolError(format!(
                "etcd returned HTTP {status}: {body}"
            )));
        }
        Err(OrcaError::Transient(format!(
            "no etcd machine reachable: {}",
            last_error.unwrap_or_default()
        )))
    }
}

/// Typed JSON view over a KV subtree rooted at [`KV_ROOT`].
#[derive(Clone)]
pub struct JsonPersister {
    base: String,
    client: EtcdClient,
}

impl JsonPersister {
    pub fn new(client: EtcdClient, suffix: &str) -> Self {
        Self {
            base: format!("{KV_ROOT}{suffix}"),
            client,
        }
    }

    pub fn path(&self, key: &str) -> String {
        format!("{}{}", self.base, key)
    }

    pub fn client(&self) -> &EtcdClient {
        &self.client
    }

    pub async fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.put_ttl(key, value, None).await
    }

    pub async fn put_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Option<u64>) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        self.client.set(&self.path(key), &encoded, ttl).await?;
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let node = self.client.get(&self.path(key)).await?;
        let value = node.value.ok_or(OrcaError::NotFound)?;
        Ok(serde_json::from_str(&value)?)
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        self.client.delete(&self.path(key), true).await
    }

    /// Child names (relative to the given path) of a directory node.
    pub async fn ls(&self, key: &str) -> Result<Vec<String>> {
        let full = self.path(key);
        let nodes = self.client.ls(&full).await?;
        Ok(nodes
            .into_iter()
            .map(|n| n.key.trim_start_matches(&full).trim_start_matches('/').to_string())
            .collect())
    }
}
