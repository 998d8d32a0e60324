use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "USER")]
    User,
    #[serde(rename = "MANAGER")]
    Manager,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roles(pub Vec<Role>);

impl Roles {
    pub fn has(&self, role: Role) -> bool {
        self.0.contains(&role)
    }
}

impl Display for Roles {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .0
            .iter()
            .map(|r| match r {
                Role::User => "USER",
                Role::Manager => "MANAGER",
            })
            .collect();
        write!(f, "{}", names.join(","))
    }
}

/// Alias indirection entry: lookups of `alias@network` resolve to the
/// user's internal id. An alias equal to the internal id always exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAlias {
    pub alias: String,
    pub network: String,
}

impl UserAlias {
    /// The composite lookup key, `alias@network`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.alias, self.network)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    pub value: String,
    pub fingerprint: String,
}

/// A short-lived permission window granting login rights without a fresh
/// OTP. Stored with an external TTL equal to the remaining window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allowance {
    #[serde(rename = "grantedBy")]
    pub granted_by: String,
    pub uid: String,
    #[serde(with = "time::serde::rfc3339")]
    pub until: OffsetDateTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub roles: Roles,
    #[serde(default)]
    pub aliases: Vec<UserAlias>,
    #[serde(default)]
    pub keys: Vec<Key>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowance: Option<Allowance>,
    #[serde(rename = "use2fa", default)]
    pub use_2fa: bool,
    /// Seconds a successful OTP keeps the account logged in without a
    /// fresh challenge.
    #[serde(rename = "autologinAfter2fa", default)]
    pub autologin_after_2fa: u64,
    #[serde(rename = "idToken", default)]
    pub id_token: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "TRACE")]
    Trace,
    #[serde(rename = "DEBUG")]
    #[default]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARN")]
    Warn,
    #[serde(rename = "ERROR")]
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Per-zone gateway settings, stored at `/orca/zones/{zone}/gateway` and
/// watched for live updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Gateway {
    /// Backend used when the SSH username carries no `@host` part.
    #[serde(rename = "defaultHost", default)]
    pub default_host: String,
    /// Reject users that have no second factor configured.
    #[serde(rename = "force2fa", default)]
    pub force_2fa: bool,
    /// PEM-encoded SSH host key. Must parse; validated on store.
    #[serde(rename = "hostkey")]
    pub host_key: String,
    #[serde(rename = "loglevel", default)]
    pub log_level: LogLevel,
    /// When false, allowance checks are skipped entirely.
    #[serde(rename = "checkAllow", default = "default_true")]
    pub check_allow: bool,
    /// Upper bound in seconds for OTP-granted allowances. An allowance
    /// reaching further than this into the future forces a fresh OTP.
    #[serde(rename = "maxAutologin2fa", default = "default_max_autologin")]
    pub max_autologin_2fa: u64,
    #[serde(rename = "allowedCidrs", default)]
    pub allowed_cidrs: Vec<String>,
    #[serde(rename = "deniedCidrs", default)]
    pub denied_cidrs: Vec<String>,
    /// true: allow-then-deny (permit iff allowed and not denied).
    /// false: deny-then-allow (explicit allow beats blanket deny).
    #[serde(rename = "allowDeny", default = "default_true")]
    pub allow_deny: bool,
    /// Verify backend host keys against the zone's known-hosts records.
    /// Disabled dials log a warning on every connection.
    #[serde(rename = "verifyHostKeys", default)]
    pub verify_host_keys: bool,
    /// Accept and replay client `tcpip-forward` requests on the backend.
    #[serde(rename = "forwardPorts", default = "default_true")]
    pub forward_ports: bool,
}

fn default_true() -> bool {
    true
}

fn default_max_autologin() -> u64 {
    300
}

/// Cluster-wide settings: OTP issuer label, token signing key, and whether
/// unknown authenticated OAuth users are created on first contact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub name: String,
    pub key: String,
    #[serde(rename = "selfRegister", default)]
    pub self_register: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_record_wire_names() {
        let user: User = serde_json::from_str(
            r#"{
                "id": "u-1",
                "name": "alice",
                "roles": ["USER", "MANAGER"],
                "aliases": [{"alias": "alice", "network": "corp"}],
                "use2fa": true,
                "autologinAfter2fa": 60,
                "idToken": "tok",
                "allowance": {
                    "grantedBy": "m-1",
                    "uid": "u-1",
                    "until": "2026-01-01T00:00:00Z"
                }
            }"#,
        )
        .unwrap();
        assert!(user.use_2fa);
        assert_eq!(user.autologin_after_2fa, 60);
        assert_eq!(user.id_token, "tok");
        assert!(user.roles.has(Role::Manager));
        assert_eq!(user.aliases[0].key(), "alice@corp");
        assert_eq!(user.allowance.unwrap().granted_by, "m-1");
    }

    #[test]
    fn minimal_user_record_decodes() {
        let user: User = serde_json::from_str(r#"{"id": "u-2", "name": "bob"}"#).unwrap();
        assert!(!user.use_2fa);
        assert!(user.allowance.is_none());
        assert!(user.keys.is_empty());
    }

    #[test]
    fn roles_display() {
        let roles = Roles(vec![Role::User, Role::Manager]);
        assert_eq!(roles.to_string(), "USER,MANAGER");
    }
}
