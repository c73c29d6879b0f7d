//! Absolute URL decomposition on top of the `url` crate.

use crate::errors::{ClientError, ClientResult};
use std::fmt;
use ::url::{Host, Position, Url};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// Protocol, host and port of an absolute URL.
///
/// `hostname` is stored without IPv6 brackets so it can be handed straight to
/// a resolver.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
}

impl Endpoint {
    fn is_ipv6(&self) -> bool {
        self.hostname.contains(':')
    }

    fn default_port(&self) -> Option<u16> {
        match self.protocol.as_str() {
            "http" => Some(HTTP_PORT),
            "https" => Some(HTTPS_PORT),
            _ => None,
        }
    }

    /// `host:port` with IPv6 hosts bracketed.
    #[must_use]
    pub fn authority(&self) -> String {
        if self.is_ipv6() {
            format!("[{}]:{}", self.hostname, self.port)
        } else {
            format!("{}:{}", self.hostname, self.port)
        }
    }

    /// Value for the `Host` request header; the port is left out when it is
    /// the protocol's default.
    #[must_use]
    pub fn host_header(&self) -> String {
        if self.default_port() == Some(self.port) {
            if self.is_ipv6() {
                format!("[{}]", self.hostname)
            } else {
                self.hostname.clone()
            }
        } else {
            self.authority()
        }
    }

    /// True when `other` names the same protocol, host and port.
    #[must_use]
    pub fn same_origin(&self, other: &Endpoint) -> bool {
        self.protocol == other.protocol
            && self.port == other.port
            && self.hostname.eq_ignore_ascii_case(&other.hostname)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.protocol, self.authority())
    }
}

/// Splits an absolute URL into its [`Endpoint`].
///
/// An explicit port always wins. Without one, `http` gets 80 and `https` gets
/// 443; any other protocol fails.
///
/// # Errors
///
/// [`ClientError::InvalidUrl`] when the URL does not parse, has no host, or
/// no port can be determined.
pub fn decompose(url: &str) -> ClientResult<Endpoint> {
    let parsed = Url::parse(url)?;
    let protocol = parsed.scheme().to_string();

    let hostname = match parsed.host() {
        Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
        Some(Host::Ipv4(addr)) => addr.to_string(),
        Some(Host::Ipv6(addr)) => addr.to_string(),
        _ => return Err(ClientError::InvalidUrl(format!("{url}: missing hostname"))),
    };

    // The parser drops ports equal to a scheme's known default, so those
    // are recovered from the raw text.
    let port = match (parsed.port(), protocol.as_str()) {
        (Some(port), _) => port,
        (None, "http") => HTTP_PORT,
        (None, "https") => HTTPS_PORT,
        (None, _) => explicit_port(url)
            .ok_or_else(|| ClientError::InvalidUrl(format!("{url}: no port for {protocol}")))?,
    };

    Ok(Endpoint {
        protocol,
        hostname,
        port,
    })
}

fn explicit_port(url: &str) -> Option<u16> {
    let (_, rest) = url.split_once("://")?;
    let authority = rest
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = authority.rsplit('@').next().unwrap_or(authority);

    let port = if host_port.starts_with('[') {
        let (_, after) = host_port.split_once(']')?;
        after.strip_prefix(':')?
    } else {
        host_port.rsplit_once(':')?.1
    };

    port.parse().ok()
}

/// Turns an absolute `http://` or `https://` URL into the request target sent
/// on the wire: the path plus query, always starting with `/`.
///
/// Anything else, including a path that is already relative, is rejected.
///
/// # Errors
///
/// [`ClientError::InvalidUrl`] for other prefixes or URLs that do not parse.
pub fn make_relative(url: &str) -> ClientResult<String> {
    let has_http_prefix = ["http://", "https://"].iter().any(|prefix| {
        url.get(..prefix.len())
            .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
    });
    if !has_http_prefix {
        return Err(ClientError::InvalidUrl(format!(
            "{url}: expected an absolute http:// or https:// URL"
        )));
    }

    let parsed = Url::parse(url)?;
    let target = &parsed[Position::BeforePath..Position::AfterQuery];
    if target.starts_with('/') {
        Ok(target.to_string())
    } else {
        Ok(format!("/{target}"))
    }
}
