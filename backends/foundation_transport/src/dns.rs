use crate::errors::DnsError;
use std::collections::HashMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};

/// Trait for DNS resolution.
///
/// The engine holds resolvers as `Arc<dyn DnsResolver>` so connections opened
/// by different threads can share one.
pub trait DnsResolver: Send + Sync + std::fmt::Debug {
    /// Resolves a hostname and port to socket addresses.
    ///
    /// # Errors
    ///
    /// Returns `DnsError` if resolution fails.
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DnsError>;
}

/// Always answers with one fixed address, whatever the hostname.
#[derive(Debug, Clone)]
pub struct StaticSocketAddr(SocketAddr);

impl Default for StaticSocketAddr {
    fn default() -> Self {
        Self(SocketAddr::from(([127, 0, 0, 1], 80)))
    }
}

impl StaticSocketAddr {
    #[must_use]
    pub fn new(addr: SocketAddr) -> Self {
        Self(addr)
    }
}

impl DnsResolver for StaticSocketAddr {
    fn resolve(&self, _host: &str, _port: u16) -> Result<Vec<SocketAddr>, DnsError> {
        Ok(vec![self.0])
    }
}

/// System DNS resolver using `std::net::ToSocketAddrs`.
///
/// IPv6 literals are accepted without brackets, the way
/// [`crate::url::decompose`] hands them out.
#[derive(Debug, Clone, Default)]
pub struct SystemDnsResolver;

impl SystemDnsResolver {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl DnsResolver for SystemDnsResolver {
    fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>, DnsError> {
        if host.is_empty() {
            return Err(DnsError::InvalidHost(host.to_string()));
        }

        let addrs: Vec<SocketAddr> = (host, port)
            .to_socket_addrs()
            .map_err(|err| DnsError::ResolutionFailed(format!("{host}: {err}")))?
            .collect();

        if addrs.is_empty() {
            return Err(DnsError::NoAddressesFound(host.to_string()));
        }

        Ok(addrs)
    }
}

/// Resolver answering from a fixed table, for tests.
#[derive(Debug, Clone, Default)]
pub struct MockDnsResolver {
    responses: Arc<Mutex<HashMap<String, Result<Vec<SocketAddr>, DnsError>>>>,
}

impl MockDnsResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_response(self, host: &str, addrs: Vec<SocketAddr>) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(host.to_string(), Ok(addrs));
        }
        self
    }

    #[must_use]
    pub fn with_error(self, host: &str, error: DnsError) -> Self {
        if let Ok(mut responses) = self.responses.lock() {
            responses.insert(host.to_string(), Err(error));
        }
        self
    }
}

impl DnsResolver for MockDnsResolver {
    fn resolve(&self, host: &str, _port: u16) -> Result<Vec<SocketAddr>, DnsError> {
        let responses = self
            .responses
            .lock()
            .map_err(|_| DnsError::ResolutionFailed("lock poisoned".to_string()))?;

        responses
            .get(host)
            .cloned()
            .unwrap_or_else(|| Err(DnsError::NoAddressesFound(host.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// WHY: Literal addresses must resolve without touching the network
    /// WHAT: Tests that the system resolver handles IPv4 and bare IPv6 literals
    #[test]
    fn test_system_resolver_literals() {
        let resolver = SystemDnsResolver::new();

        let v4 = resolver.resolve("127.0.0.1", 8080).expect("should resolve");
        assert_eq!(v4, vec![SocketAddr::from(([127, 0, 0, 1], 8080))]);

        let v6 = resolver.resolve("::1", 443).expect("should resolve");
        assert_eq!(v6.len(), 1);
        assert!(v6[0].is_ipv6());
        assert_eq!(v6[0].port(), 443);
    }

    /// WHY: Empty hosts are rejected up front
    /// WHAT: Tests InvalidHost for an empty hostname
    #[test]
    fn test_system_resolver_empty_host() {
        let result = SystemDnsResolver::new().resolve("", 80);
        assert!(matches!(result, Err(DnsError::InvalidHost(_))));
    }

    /// WHY: Unknown hosts must fail rather than hang
    /// WHAT: Tests that a reserved .invalid hostname fails to resolve
    #[test]
    #[ignore = "depends on the host resolver configuration"]
    fn test_system_resolver_invalid_domain() {
        let result = SystemDnsResolver::new().resolve("does-not-exist.invalid", 80);
        assert!(result.is_err());
    }

    /// WHY: Tests need deterministic resolution
    /// WHAT: Tests mock responses, mock errors and the miss path
    #[test]
    fn test_mock_resolver() {
        let addr = SocketAddr::from(([10, 0, 0, 1], 80));
        let resolver = MockDnsResolver::new()
            .with_response("example.test", vec![addr])
            .with_error("broken.test", DnsError::ResolutionFailed("boom".into()));

        assert_eq!(resolver.resolve("example.test", 80).unwrap(), vec![addr]);
        assert!(matches!(
            resolver.resolve("broken.test", 80),
            Err(DnsError::ResolutionFailed(_))
        ));
        assert!(matches!(
            resolver.resolve("unknown.test", 80),
            Err(DnsError::NoAddressesFound(_))
        ));
    }

    #[test]
    fn test_static_resolver_ignores_host() {
        let addr = SocketAddr::from(([127, 0, 0, 1], 9000));
        let resolver = StaticSocketAddr::new(addr);
        assert_eq!(resolver.resolve("anything", 1).unwrap(), vec![addr]);
    }
}
