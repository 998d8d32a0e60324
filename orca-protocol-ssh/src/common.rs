use std::fmt::{Display, Formatter};

use bytes::Bytes;
use orca_common::{OrcaError, Result};
use russh::{ChannelId, Pty, Sig};

pub const DEFAULT_BACKEND_PORT: u16 = 22;

/// The backend a client asked for, carried in the SSH username as
/// `remoteUser@remoteHost[:port]`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TargetAddress {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl TargetAddress {
    /// Split on the last `@`; a username without one targets the zone's
    /// default host when configured and is rejected otherwise.
    pub fn parse(ssh_username: &str, default_host: &str) -> Result<Self> {
        let (user, host_port) = match ssh_username.rsplit_once('@') {
            Some((user, host_port)) => (user, host_port),
            None => {
                if default_host.is_empty() {
                    return Err(OrcaError::ProtocolError(format!(
                        "unknown target: {ssh_username}"
                    )));
                }
                (ssh_username, default_host)
            }
        };
        if user.is_empty() || host_port.is_empty() {
            return Err(OrcaError::ProtocolError(format!(
                "unknown target: {ssh_username}"
            )));
        }
        let (host, port) = match host_port.rsplit_once(':') {
            Some((host, port)) => (
                host,
                port.parse::<u16>().map_err(|_| {
                    OrcaError::ProtocolError(format!("invalid port in target: {ssh_username}"))
                })?,
            ),
            None => (host_port, DEFAULT_BACKEND_PORT),
        };
        Ok(Self {
            user: user.to_string(),
            host: host.to_string(),
            port,
        })
    }
}

impl Display for TargetAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Pty, u32)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Hash, Eq)]
pub struct ServerChannelId(pub ChannelId);

impl Display for ServerChannelId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug)]
pub struct DirectTCPIPParams {
    pub host_to_connect: String,
    pub port_to_connect: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

#[derive(Clone, Debug)]
pub struct ForwardedTcpIpParams {
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

#[derive(Clone, Debug)]
pub struct X11Request {
    pub single_connection: bool,
    pub x11_auth_protocol: String,
    pub x11_auth_cookie: String,
    pub x11_screen_number: u32,
}

/// Operations the server session applies to a backend channel. Operations
/// issued before the backend is connected are buffered and replayed in
/// arrival order.
#[derive(Clone, Debug)]
pub enum ChannelOperation {
    OpenSession,
    OpenDirectTCPIP(DirectTCPIPParams),
    RequestPty(PtyRequest),
    ResizePty(PtyRequest),
    RequestShell,
    RequestEnv(String, String),
    RequestExec(String),
    RequestSubsystem(String),
    RequestX11(X11Request),
    Data(Bytes),
    ExtendedData { data: Bytes, ext: u32 },
    Eof,
    Signal(Sig),
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_at_host() {
        let t = TargetAddress::parse("alice@web01", "").unwrap();
        assert_eq!(t.user, "alice");
        assert_eq!(t.host, "web01");
        assert_eq!(t.port, 22);
    }

    #[test]
    fn explicit_port() {
        let t = TargetAddress::parse("alice@web01:2222", "").unwrap();
        assert_eq!(t.port, 2222);
    }

    #[test]
    fn split_happens_on_last_at() {
        let t = TargetAddress::parse("alice@corp@web01", "").unwrap();
        assert_eq!(t.user, "alice@corp");
        assert_eq!(t.host, "web01");
    }

    #[test]
    fn default_host_fallback() {
        let t = TargetAddress::parse("alice", "bastion").unwrap();
        assert_eq!(t.user, "alice");
        assert_eq!(t.host, "bastion");
        assert_eq!(t.port, 22);
    }

    #[test]
    fn no_default_host_rejects() {
        assert!(TargetAddress::parse("alice", "").is_err());
    }

    #[test]
    fn empty_parts_reject() {
        assert!(TargetAddress::parse("@web01", "").is_err());
        assert!(TargetAddress::parse("alice@", "").is_err());
    }

    #[test]
    fn bad_port_rejects() {
        assert!(TargetAddress::parse("alice@web01:notaport", "").is_err());
    }
}
