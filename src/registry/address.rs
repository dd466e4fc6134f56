//! `Address`: a resolved host/port pair (`spec.md` §3).

use std::net::IpAddr;

/// A monitored instance's address. Two addresses are equal iff their
/// resolved IPs and ports match — the hostname is kept only for
/// re-resolution and display, never for comparison, since a given host can
/// resolve to a different `resolved_ip` over time under DNS policy changes.
#[derive(Debug, Clone)]
pub struct Address {
    pub hostname: String,
    pub resolved_ip: IpAddr,
    pub port: u16,
}

impl Address {
    pub fn new(hostname: impl Into<String>, resolved_ip: IpAddr, port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            resolved_ip,
            port,
        }
    }

    /// A port of 0 means "invalid, do not connect" (`spec.md` §3).
    pub fn is_valid(&self) -> bool {
        self.port != 0
    }

    pub fn socket_addr(&self) -> std::net::SocketAddr {
        std::net::SocketAddr::new(self.resolved_ip, self.port)
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.resolved_ip == other.resolved_ip && self.port == other.port
    }
}
impl Eq for Address {}

impl std::hash::Hash for Address {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.resolved_ip.hash(state);
        self.port.hash(state);
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.resolved_ip, self.port)
    }
}

/// Resolves a hostname to an `Address`. Per `spec.md` §3's resolve-hostnames
/// policy, a Sentinel may be configured to trust the literal IP/hostname
/// given rather than re-resolving; this performs a real resolution via the
/// standard library, which is sufficient for both IP literals and names.
pub async fn resolve(hostname: &str, port: u16) -> Result<Address, crate::error::SentinelError> {
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return Ok(Address::new(hostname, ip, port));
    }
    let host = hostname.to_string();
    let lookup = format!("{host}:{port}");
    let mut addrs = tokio::net::lookup_host(&lookup)
        .await
        .map_err(|e| crate::error::SentinelError::Config(format!("cannot resolve {lookup}: {e}")))?;
    let resolved = addrs
        .next()
        .ok_or_else(|| crate::error::SentinelError::Config(format!("no addresses for {lookup}")))?;
    Ok(Address::new(host, resolved.ip(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_hostname() {
        let a = Address::new("master1.internal", "10.0.0.1".parse().unwrap(), 6379);
        let b = Address::new("10.0.0.1", "10.0.0.1".parse().unwrap(), 6379);
        assert_eq!(a, b);
    }

    #[test]
    fn port_zero_is_invalid() {
        let a = Address::new("h", "10.0.0.1".parse().unwrap(), 0);
        assert!(!a.is_valid());
    }

    #[test]
    fn differing_ip_is_not_equal() {
        let a = Address::new("h", "10.0.0.1".parse().unwrap(), 6379);
        let b = Address::new("h", "10.0.0.2".parse().unwrap(), 6379);
        assert_ne!(a, b);
    }
}
