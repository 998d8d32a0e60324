use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orca_common::{OrcaError, Result, Secret, User};
use serde::de::DeserializeOwned;
use tracing::*;

use crate::{ServiceRegistry, MANAGER_SERVICE_PATH};

/// Where the fan-out finds live manager base URLs.
#[async_trait]
pub trait ManagerDiscovery: Send + Sync {
    async fn manager_urls(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl ManagerDiscovery for ServiceRegistry {
    async fn manager_urls(&self) -> Result<Vec<String>> {
        match self.get_values(MANAGER_SERVICE_PATH).await {
            Err(OrcaError::NotFound) => Ok(vec![]),
            other => other,
        }
    }
}

/// HTTP client for the manager control plane. Every call fans out over the
/// registered replicas in order: transport errors and 5xx responses move on
/// to the next replica, anything else is final.
#[derive(Clone)]
pub struct ManagerClient {
    discovery: Arc<dyn ManagerDiscovery>,
    http: reqwest::Client,
}

enum Fetch<'a> {
    UserByKey { armored: &'a str },
    CheckToken { uid: &'a str, otp: &'a str, maxtime: u64 },
}

impl ManagerClient {
    pub fn new(discovery: Arc<dyn ManagerDiscovery>) -> Result<Self> {
        Ok(Self {
            discovery,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .map_err(OrcaError::other)?,
        })
    }

    /// Resolve the user owning an armored public key.
    pub async fn user_by_key(&self, armored: &str) -> Result<User> {
        self.fan_out(Fetch::UserByKey { armored }).await
    }

    /// Verify an OTP for a user; a success grants an allowance of up to
    /// `maxtime` seconds on the manager side.
    pub async fn check_token(
        &self,
        uid: &str,
        otp: &Secret<String>,
        maxtime: u64,
    ) -> Result<()> {
        self.fan_out::<IgnoredBody>(Fetch::CheckToken {
            uid,
            otp: otp.expose_secret(),
            maxtime,
        })
        .await?;
        Ok(())
    }

    async fn fan_out<T: DeserializeOwned>(&self, fetch: Fetch<'_>) -> Result<T> {
        let urls = self.discovery.manager_urls().await?;
        if urls.is_empty() {
            return Err(OrcaError::NoManagersRegistered);
        }
        for url in &urls {
            let url = url.trim_end_matches('/');
            let request = match &fetch {
                Fetch::UserByKey { armored } => self
                    .http
                    .post(format!("{url}/users/pubkey"))
                    .json(armored)
                    .header("Accept", "application/json"),
                Fetch::CheckToken { uid, otp, maxtime } => self
                    .http
                    .get(format!("{url}/users/{uid}/{otp}/check"))
                    .query(&[("maxtime", maxtime.to_string())]),
            };
            let response = match request.send().await {
                Ok(response) => response,
                Err(error) => {
                    debug!(manager=%url, %error, "manager unreachable, trying next");
                    continue;
                }
            };
            let status = response.status();
            if status.is_server_error() {
                debug!(manager=%url, %status, "manager failed, trying next");
                continue;
            }
            let body = response.text().await.map_err(OrcaError::other)?;
            if !status.is_success() {
                if status == reqwest::StatusCode::FORBIDDEN {
                    return Err(OrcaError::AuthRequired(body));
                }
                return Err(OrcaError::ManagerRejected {
                    status: status.as_u16(),
                    body,
                });
            }
            return Ok(serde_json::from_str(if body.is_empty() { "null" } else { &body })?);
        }
        Err(OrcaError::Transient(
            "no working manager found in configuration".into(),
        ))
    }
}

/// Endpoints like the token check respond with an empty 200 body.
type IgnoredBody = Option<serde_json::Value>;

#[cfg(test)]
mod tests {
    use orca_common::Secret;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    struct StaticDiscovery(Vec<String>);

    #[async_trait]
    impl ManagerDiscovery for StaticDiscovery {
        async fn manager_urls(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    fn client(urls: Vec<String>) -> ManagerClient {
        ManagerClient::new(Arc::new(StaticDiscovery(urls))).unwrap()
    }

    fn user_json() -> serde_json::Value {
        serde_json::json!({
            "id": "u-1",
            "name": "alice",
            "roles": ["USER"],
            "use2fa": false,
        })
    }

    #[tokio::test]
    async fn resolves_user_from_first_replica() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/pubkey"))
            .and(body_json("ssh-ed25519 AAAA test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json()))
            .mount(&mock)
            .await;

        let user = client(vec![mock.uri()])
            .user_by_key("ssh-ed25519 AAAA test")
            .await
            .unwrap();
        assert_eq!(user.id, "u-1");
        assert_eq!(user.name, "alice");
    }

    #[tokio::test]
    async fn failing_replica_falls_through_to_next() {
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/pubkey"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&broken)
            .await;

        let healthy = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/pubkey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json()))
            .mount(&healthy)
            .await;

        let user = client(vec![broken.uri(), healthy.uri()])
            .user_by_key("k")
            .await
            .unwrap();
        assert_eq!(user.id, "u-1");
    }

    #[tokio::test]
    async fn non_server_error_short_circuits() {
        let first = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/pubkey"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such key"))
            .mount(&first)
            .await;

        // A second healthy replica must not be consulted.
        let second = MockServer::start().await;

        let result = client(vec![first.uri(), second.uri()]).user_by_key("k").await;
        match result {
            Err(OrcaError::ManagerRejected { status, body }) => {
                assert_eq!(status, 404);
                assert_eq!(body, "no such key");
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(second.received_requests().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_registry_is_an_error() {
        let result = client(vec![]).user_by_key("k").await;
        assert!(matches!(result, Err(OrcaError::NoManagersRegistered)));
    }

    #[tokio::test]
    async fn token_check_success_and_denial() {
        let mock = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/u-1/123456/check"))
            .and(query_param("maxtime", "60"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/u-1/999999/check"))
            .respond_with(ResponseTemplate::new(403).set_body_string("{\"error\":\"bad otp\"}"))
            .mount(&mock)
            .await;

        let c = client(vec![mock.uri()]);
        c.check_token("u-1", &Secret::new("123456".into()), 60)
            .await
            .unwrap();
        let denied = c
            .check_token("u-1", &Secret::new("999999".into()), 60)
            .await;
        assert!(matches!(denied, Err(OrcaError::AuthRequired(_))));
    }

    #[tokio::test]
    async fn all_replicas_down_is_transient() {
        let broken = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/pubkey"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&broken)
            .await;

        let result = client(vec![broken.uri()]).user_by_key("k").await;
        assert!(matches!(result, Err(OrcaError::Transient(_))));
    }
}
