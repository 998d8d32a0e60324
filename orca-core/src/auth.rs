use std::time::Duration;

use orca_common::{Gateway, Result, Secret, SessionId, User};
use time::OffsetDateTime;
use tracing::*;

use crate::{ManagerClient, TimedStash};

/// How long a user resolved in the public-key phase stays staged for the
/// OTP phase of the same session.
pub const OTP_STASH_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    /// Fail the public-key attempt so the client falls through to the OTP
    /// method; the resolved user must be staged under the session id.
    NeedOtp,
    Deny(String),
}

/// The login policy decision table, evaluated top-down against the zone's
/// gateway settings and the resolved user record.
pub fn evaluate(gateway: &Gateway, user: &User, now: OffsetDateTime) -> PolicyDecision {
    if user.use_2fa {
        let Some(allowance) = &user.allowance else {
            return PolicyDecision::NeedOtp;
        };
        if allowance.until < now {
            return PolicyDecision::NeedOtp;
        }
        // An allowance reaching further than the configured maximum into
        // the future cannot have come from a legitimate OTP grant.
        if allowance.until > now + Duration::from_secs(gateway.max_autologin_2fa) {
            return PolicyDecision::NeedOtp;
        }
        return PolicyDecision::Allow;
    }
    if gateway.force_2fa {
        return PolicyDecision::Deny("you must use 2fa".into());
    }
    if !gateway.check_allow {
        return PolicyDecision::Allow;
    }
    match &user.allowance {
        None => PolicyDecision::Deny("please activate your account".into()),
        Some(allowance) if allowance.until < now => {
            PolicyDecision::Deny("your activation timed out".into())
        }
        Some(_) => PolicyDecision::Allow,
    }
}

#[derive(Debug)]
pub enum AuthOutcome {
    Allowed(User),
    /// The public-key attempt must fail; the client is expected to retry
    /// with the OTP method within [`OTP_STASH_WINDOW`].
    OtpRequired,
    Denied(String),
}

/// Orchestrates the two-phase session authentication: key lookup + policy,
/// then optionally an OTP finalization bound to the same session id.
pub struct AuthEngine {
    managers: ManagerClient,
    pending: TimedStash<User>,
}

impl AuthEngine {
    pub fn new(managers: ManagerClient) -> Self {
        Self {
            managers,
            pending: TimedStash::new(),
        }
    }

    /// Public-key phase: resolve the key's owner through the managers and
    /// apply the policy table.
    pub async fn authenticate_key(
        &self,
        session_id: &SessionId,
        armored_key: &str,
        gateway: &Gateway,
    ) -> Result<AuthOutcome> {
        let user = self.managers.user_by_key(armored_key).await?;
        match evaluate(gateway, &user, OffsetDateTime::now_utc()) {
            PolicyDecision::Allow => {
                info!(user=%user.id, "login by public key");
                Ok(AuthOutcome::Allowed(user))
            }
            PolicyDecision::NeedOtp => {
                debug!(user=%user.id, "2FA enabled, next password check");
                self.pending
                    .put(session_id.to_string(), user, OTP_STASH_WINDOW);
                Ok(AuthOutcome::OtpRequired)
            }
            PolicyDecision::Deny(reason) => Ok(AuthOutcome::Denied(reason)),
        }
    }

    /// OTP phase: finalize a login staged by [`Self::authenticate_key`] on
    /// the same session id. The granted allowance is capped both by the
    /// user's autologin setting and the gateway's maximum.
    pub async fn authenticate_otp(
        &self,
        session_id: &SessionId,
        otp: &Secret<String>,
        gateway: &Gateway,
    ) -> Result<AuthOutcome> {
        let Some(user) = self.pending.get(&session_id.to_string()).await else {
            return Ok(AuthOutcome::Denied(
                "no key auth happened before OTP check".into(),
            ));
        };
        let ttl = user.autologin_after_2fa.min(gateway.max_autologin_2fa);
        match self.managers.check_token(&user.id, otp, ttl).await {
            Ok(()) => {
                info!(user=%user.id, "login by public key + OTP");
                Ok(AuthOutcome::Allowed(user))
            }
            Err(error) => {
                debug!(user=%user.id, %error, "OTP check failed");
                Ok(AuthOutcome::Denied(format!("OTP check failed: {error}")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use orca_common::Allowance;

    use super::*;

    fn gateway() -> Gateway {
        Gateway {
            default_host: String::new(),
            force_2fa: false,
            host_key: String::new(),
            log_level: Default::default(),
            check_allow: true,
            max_autologin_2fa: 300,
            allowed_cidrs: vec![],
            denied_cidrs: vec![],
            allow_deny: true,
            verify_host_keys: false,
            forward_ports: true,
        }
    }

    fn user(use_2fa: bool) -> User {
        User {
            id: "u-1".into(),
            name: "alice".into(),
            roles: Default::default(),
            aliases: vec![],
            keys: vec![],
            allowance: None,
            use_2fa,
            autologin_after_2fa: 60,
            id_token: String::new(),
        }
    }

    fn allowance(until: OffsetDateTime) -> Allowance {
        Allowance {
            granted_by: "m-1".into(),
            uid: "u-1".into(),
            until,
        }
    }

    #[test]
    fn twofa_without_allowance_needs_otp() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            evaluate(&gateway(), &user(true), now),
            PolicyDecision::NeedOtp
        );
    }

    #[test]
    fn twofa_with_expired_allowance_needs_otp() {
        let now = OffsetDateTime::now_utc();
        let mut u = user(true);
        u.allowance = Some(allowance(now - Duration::from_secs(1)));
        assert_eq!(evaluate(&gateway(), &u, now), PolicyDecision::NeedOtp);
    }

    #[test]
    fn twofa_with_fresh_allowance_is_allowed() {
        let now = OffsetDateTime::now_utc();
        let mut u = user(true);
        u.allowance = Some(allowance(now + Duration::from_secs(60)));
        assert_eq!(evaluate(&gateway(), &u, now), PolicyDecision::Allow);
    }

    #[test]
    fn suspiciously_long_allowance_forces_fresh_otp() {
        let now = OffsetDateTime::now_utc();
        let mut u = user(true);
        u.allowance = Some(allowance(now + Duration::from_secs(301)));
        assert_eq!(evaluate(&gateway(), &u, now), PolicyDecision::NeedOtp);

        u.allowance = Some(allowance(now + Duration::from_secs(299)));
        assert_eq!(evaluate(&gateway(), &u, now), PolicyDecision::Allow);
    }

    #[test]
    fn force_2fa_rejects_users_without_it() {
        let now = OffsetDateTime::now_utc();
        let mut gw = gateway();
        gw.force_2fa = true;
        assert_eq!(
            evaluate(&gw, &user(false), now),
            PolicyDecision::Deny("you must use 2fa".into())
        );
    }

    #[test]
    fn allowance_checks_can_be_disabled() {
        let now = OffsetDateTime::now_utc();
        let mut gw = gateway();
        gw.check_allow = false;
        assert_eq!(evaluate(&gw, &user(false), now), PolicyDecision::Allow);
    }

    #[test]
    fn missing_allowance_denies() {
        let now = OffsetDateTime::now_utc();
        assert_eq!(
            evaluate(&gateway(), &user(false), now),
            PolicyDecision::Deny("please activate your account".into())
        );
    }

    #[test]
    fn expired_allowance_denies() {
        let now = OffsetDateTime::now_utc();
        let mut u = user(false);
        u.allowance = Some(allowance(now - Duration::from_secs(1)));
        assert_eq!(
            evaluate(&gateway(), &u, now),
            PolicyDecision::Deny("your activation timed out".into())
        );
    }

    #[test]
    fn valid_allowance_allows() {
        let now = OffsetDateTime::now_utc();
        let mut u = user(false);
        u.allowance = Some(allowance(now + Duration::from_secs(3600)));
        assert_eq!(evaluate(&gateway(), &u, now), PolicyDecision::Allow);
    }
}

#[cfg(test)]
mod engine_tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use orca_common::Result;
    use uuid::Uuid;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::ManagerDiscovery;

    struct StaticDiscovery(Vec<String>);

    #[async_trait]
    impl ManagerDiscovery for StaticDiscovery {
        async fn manager_urls(&self) -> Result<Vec<String>> {
            Ok(self.0.clone())
        }
    }

    fn engine(urls: Vec<String>) -> AuthEngine {
        AuthEngine::new(ManagerClient::new(Arc::new(StaticDiscovery(urls))).unwrap())
    }

    fn gateway() -> Gateway {
        serde_json::from_str(r#"{"hostkey": "", "maxAutologin2fa": 300}"#).unwrap()
    }

    #[tokio::test]
    async fn otp_without_key_phase_is_denied() {
        let engine = engine(vec![]);
        let outcome = engine
            .authenticate_otp(&Uuid::new_v4(), &Secret::new("123456".into()), &gateway())
            .await
            .unwrap();
        match outcome {
            AuthOutcome::Denied(reason) => {
                assert_eq!(reason, "no key auth happened before OTP check")
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn two_phase_login_with_otp() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/pubkey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u-1",
                "name": "alice",
                "use2fa": true,
                "autologinAfter2fa": 60,
            })))
            .mount(&mock)
            .await;
        // maxtime must be min(autologinAfter2fa=60, maxAutologin2fa=300)
        Mock::given(method("GET"))
            .and(path("/users/u-1/123456/check"))
            .and(query_param("maxtime", "60"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&mock)
            .await;

        let engine = engine(vec![mock.uri()]);
        let session = Uuid::new_v4();

        let first = engine
            .authenticate_key(&session, "ssh-ed25519 AAAA", &gateway())
            .await
            .unwrap();
        assert!(matches!(first, AuthOutcome::OtpRequired));

        let second = engine
            .authenticate_otp(&session, &Secret::new("123456".into()), &gateway())
            .await
            .unwrap();
        match second {
            AuthOutcome::Allowed(user) => assert_eq!(user.id, "u-1"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn otp_on_a_different_session_is_denied() {
        let mock = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/users/pubkey"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "u-1",
                "name": "alice",
                "use2fa": true,
            })))
            .mount(&mock)
            .await;

        let engine = engine(vec![mock.uri()]);
        let first = engine
            .authenticate_key(&Uuid::new_v4(), "ssh-ed25519 AAAA", &gateway())
            .await
            .unwrap();
        assert!(matches!(first, AuthOutcome::OtpRequired));

        let other_session = Uuid::new_v4();
        let second = engine
            .authenticate_otp(&other_session, &Secret::new("123456".into()), &gateway())
            .await
            .unwrap();
        assert!(matches!(second, AuthOutcome::Denied(_)));
    }
}
