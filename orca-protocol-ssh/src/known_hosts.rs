use orca_common::Result;
use orca_core::{EtcdClient, JsonPersister};
use russh::keys::{PublicKey, PublicKeyBase64};
use serde::{Deserialize, Serialize};

/// Backend host key records for a zone, keyed by `host:port`. Only
/// consulted when host key verification is enabled; unknown hosts are
/// trusted on first use.
pub struct KnownHosts {
    persister: JsonPersister,
}

#[derive(Debug, Serialize, Deserialize)]
struct KnownHostRecord {
    #[serde(rename = "keyType")]
    key_type: String,
    #[serde(rename = "keyBase64")]
    key_base64: String,
}

pub enum KnownHostValidationResult {
    Valid,
    Invalid { key_type: String, key_base64: String },
    Unknown,
}

impl KnownHosts {
    pub fn new(client: &EtcdClient, zone: &str) -> Self {
        Self {
            persister: JsonPersister::new(client.clone(), &format!("/zones/{zone}/knownhosts")),
        }
    }

    fn entry_key(host: &str, port: u16) -> String {
        format!("/{host}:{port}")
    }

    pub async fn validate(
        &self,
        host: &str,
        port: u16,
        key: &PublicKey,
    ) -> Result<KnownHostValidationResult> {
        let record: KnownHostRecord = match self.persister.get(&Self::entry_key(host, port)).await
        {
            Ok(record) => record,
            Err(orca_common::OrcaError::NotFound) => return Ok(KnownHostValidationResult::Unknown),
            Err(e) => return Err(e),
        };
        if record.key_type == key.algorithm().to_string()
            && record.key_base64 == key.public_key_base64()
        {
            return Ok(KnownHostValidationResult::Valid);
        }
        Ok(KnownHostValidationResult::Invalid {
            key_type: record.key_type,
            key_base64: record.key_base64,
        })
    }

    pub async fn trust(&self, host: &str, port: u16, key: &PublicKey) -> Result<()> {
        let record = KnownHostRecord {
            key_type: key.algorithm().to_string(),
            key_base64: key.public_key_base64(),
        };
        self.persister.put(&Self::entry_key(host, port), &record).await
    }
}
