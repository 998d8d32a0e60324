use std::net::IpAddr;

use ipnet::IpNet;
use orca_common::{Gateway, OrcaError, Result};
use tracing::*;

/// Decide whether the gateway may dial `host`, per the zone's CIDR policy.
///
/// The host is resolved to all of its addresses first; a network matches
/// when it contains any of them. Malformed CIDR entries are skipped and
/// never affect the outcome of the remaining ones.
pub async fn check_backend_access(host: &str, gateway: &Gateway) -> Result<()> {
    let ips = resolve(host).await?;
    let allowed = parse_cidrs(&gateway.allowed_cidrs, "allowed");
    let denied = parse_cidrs(&gateway.denied_cidrs, "denied");

    let a = contains_any(&allowed, &ips);
    let d = contains_any(&denied, &ips);

    if gateway.allow_deny {
        // allow-then-deny: must be allowed and not denied
        if a && !d {
            return Ok(());
        }
        return Err(OrcaError::PolicyDenied(format!(
            "AD: {host} is not allowed: allowed:{a}, denied:{d}"
        )));
    }

    // deny-then-allow: an explicit allow beats a blanket deny
    if d && !a {
        return Err(OrcaError::PolicyDenied(format!(
            "DA: {host} is not allowed: allowed:{a}, denied:{d}"
        )));
    }
    Ok(())
}

async fn resolve(host: &str) -> Result<Vec<IpAddr>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![ip]);
    }
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| OrcaError::BackendUnreachable(format!("cannot resolve {host}: {e}")))?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(OrcaError::BackendUnreachable(format!(
            "{host} resolves to no addresses"
        )));
    }
    Ok(addrs)
}

fn parse_cidrs(entries: &[String], kind: &str) -> Vec<IpNet> {
    entries
        .iter()
        .filter_map(|entry| match entry.parse::<IpNet>() {
            Ok(net) => Some(net),
            Err(_) => {
                warn!("the {kind} CIDR {entry} cannot be parsed, ignoring");
                None
            }
        })
        .collect()
}

fn contains_any(nets: &[IpNet], ips: &[IpAddr]) -> bool {
    nets.iter().any(|net| ips.iter().any(|ip| net.contains(ip)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway(allow_deny: bool, allowed: &[&str], denied: &[&str]) -> Gateway {
        let mut gw: Gateway =
            serde_json::from_str(r#"{"hostkey": ""}"#).expect("gateway defaults");
        gw.allow_deny = allow_deny;
        gw.allowed_cidrs = allowed.iter().map(|s| s.to_string()).collect();
        gw.denied_cidrs = denied.iter().map(|s| s.to_string()).collect();
        gw
    }

    const IPS: [&str; 3] = ["1.2.3.4", "192.168.0.4", "2.4.5.6"];

    #[tokio::test]
    async fn allow_deny_permits_everything_when_all_allowed() {
        let gw = gateway(true, &["0.0.0.0/0"], &[]);
        for ip in IPS {
            assert!(check_backend_access(ip, &gw).await.is_ok(), "{ip}");
        }
    }

    #[tokio::test]
    async fn allow_deny_denies_the_denied_subnet() {
        let gw = gateway(true, &["0.0.0.0/0"], &["2.4.5.0/24"]);
        for ip in IPS {
            let result = check_backend_access(ip, &gw).await;
            if ip == "2.4.5.6" {
                assert!(result.is_err(), "{ip} should be denied");
            } else {
                assert!(result.is_ok(), "{ip} should be allowed");
            }
        }
    }

    #[tokio::test]
    async fn allow_deny_denies_everything_outside_the_allowed_subnet() {
        let gw = gateway(true, &["192.168.0.0/24"], &[]);
        for ip in IPS {
            let result = check_backend_access(ip, &gw).await;
            if ip == "192.168.0.4" {
                assert!(result.is_ok(), "{ip} should be allowed");
            } else {
                assert!(result.is_err(), "{ip} should be denied");
            }
        }
    }

    #[tokio::test]
    async fn deny_allow_denies_everything_when_all_denied() {
        let gw = gateway(false, &[], &["0.0.0.0/0"]);
        for ip in IPS {
            assert!(check_backend_access(ip, &gw).await.is_err(), "{ip}");
        }
    }

    #[tokio::test]
    async fn deny_allow_explicit_allow_beats_blanket_deny() {
        let gw = gateway(false, &["192.168.0.0/24"], &["0.0.0.0/0"]);
        for ip in IPS {
            let result = check_backend_access(ip, &gw).await;
            if ip == "192.168.0.4" {
                assert!(result.is_ok(), "{ip} should be allowed");
            } else {
                assert!(result.is_err(), "{ip} should be denied");
            }
        }
    }

    #[tokio::test]
    async fn deny_allow_permits_anything_not_denied() {
        let gw = gateway(false, &[], &["192.168.0.0/24"]);
        for ip in IPS {
            let result = check_backend_access(ip, &gw).await;
            if ip == "192.168.0.4" {
                assert!(result.is_err(), "{ip} should be denied");
            } else {
                assert!(result.is_ok(), "{ip} should be allowed");
            }
        }
    }

    #[tokio::test]
    async fn malformed_cidrs_are_skipped() {
        let gw = gateway(true, &["none of this parses", "192.168.0.0/24"], &["?!"]);
        assert!(check_backend_access("192.168.0.4", &gw).await.is_ok());
        assert!(check_backend_access("1.2.3.4", &gw).await.is_err());
    }

    #[tokio::test]
    async fn rejection_reason_carries_both_flags() {
        let gw = gateway(true, &["0.0.0.0/0"], &["10.0.0.0/8"]);
        let error = check_backend_access("10.1.2.3", &gw).await.unwrap_err();
        let text = error.to_string();
        assert!(text.contains("allowed:true"), "{text}");
        assert!(text.contains("denied:true"), "{text}");
    }
}
