use crate::PingError;
use std::net::IpAddr;
use std::result::Result;

/// Forward lookup. Blocks; call it off any timing-critical thread.
///
/// IP literals are returned as they are. IPv4 addresses are preferred.
pub(crate) fn resolve(hostname: &str) -> Result<IpAddr, PingError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(ip);
    }
    let ips: Vec<IpAddr> = dns_lookup::lookup_host(hostname)
        .map_err(|e| PingError::ResolutionFailed(format!("could not resolve hostname {hostname}: {e}")))?;
    ips.iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| ips.first())
        .copied()
        .ok_or_else(|| PingError::ResolutionFailed(format!("no address for hostname {hostname}")))
}

/// Best effort reverse lookup; a failure just means there is no name.
pub(crate) fn reverse_lookup(ip: IpAddr) -> Option<String> {
    match dns_lookup::lookup_addr(&ip) {
        Ok(hostname) if hostname != ip.to_string() => Some(hostname),
        Ok(_) => None,
        Err(e) => {
            tracing::trace!(%ip, "reverse lookup failed: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn ip_literals_are_not_looked_up() {
        assert_eq!(IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)), resolve("10.1.2.3").unwrap());
        assert_eq!(IpAddr::V6(Ipv6Addr::LOCALHOST), resolve("::1").unwrap());
    }

    #[test]
    fn test_lookup_host() {
        let ip = resolve("localhost").unwrap();

        assert!(ip.is_loopback());
    }

    #[test]
    fn empty_hostname_fails() {
        assert!(matches!(resolve(""), Err(PingError::ResolutionFailed(_))));
    }

    #[test]
    fn test_lookup_addr() {
        let ip_127_0_0_1 = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1));

        if let Some(hostname) = reverse_lookup(ip_127_0_0_1) {
            assert!(hostname.contains("localhost"), "unexpected name {hostname}");
        }
    }
}
