use std::fmt;
use std::net::IpAddr;

use serde::Deserialize;

/// Listener / target group protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Http,
    Https,
    Tcp,
    Tls,
    Udp,
    TcpUdp,
}

impl Protocol {
    /// HTTP and HTTPS are evaluated against layer 7 rules
    pub fn is_application(&self) -> bool {
        matches!(self, Protocol::Http | Protocol::Https)
    }

    /// Whether a listener on this protocol terminates TLS
    pub fn requires_certificate(&self) -> bool {
        matches!(self, Protocol::Https | Protocol::Tls)
    }

    /// Default port for URI rendering, if the protocol has one
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Protocol::Http => Some(80),
            Protocol::Https => Some(443),
            _ => None,
        }
    }

    /// Lowercase URI scheme
    pub fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
            Protocol::Tcp => "tcp",
            Protocol::Tls => "tls",
            Protocol::Udp => "udp",
            Protocol::TcpUdp => "tcp_udp",
        }
    }

    /// Parse a protocol name, case-insensitive
    pub fn parse(s: &str) -> Option<Protocol> {
        match s.to_ascii_uppercase().as_str() {
            "HTTP" => Some(Protocol::Http),
            "HTTPS" => Some(Protocol::Https),
            "TCP" => Some(Protocol::Tcp),
            "TLS" => Some(Protocol::Tls),
            "UDP" => Some(Protocol::Udp),
            "TCP_UDP" => Some(Protocol::TcpUdp),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.scheme().to_ascii_uppercase())
    }
}

/// Load balancer flavor: layer 7 rules or layer 4 forwarding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerKind {
    #[default]
    Application,
    Network,
}

impl LoadBalancerKind {
    pub fn is_application(&self) -> bool {
        matches!(self, LoadBalancerKind::Application)
    }

    /// Whether listeners on this kind of load balancer may use `protocol`
    pub fn supports(&self, protocol: Protocol) -> bool {
        protocol.is_application() == self.is_application()
    }
}

impl fmt::Display for LoadBalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancerKind::Application => f.write_str("application"),
            LoadBalancerKind::Network => f.write_str("network"),
        }
    }
}

/// Kind of target a group accepts. Locked on first registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
    Instance,
    Ip,
    Lambda,
    Alb,
}

impl fmt::Display for TargetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TargetType::Instance => "instance",
            TargetType::Ip => "ip",
            TargetType::Lambda => "lambda",
            TargetType::Alb => "alb",
        };
        f.write_str(s)
    }
}

/// Arena handle for a target group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetGroupId(pub u32);

impl fmt::Display for TargetGroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tg-{}", self.0)
    }
}

/// Incoming request attributes used for rule evaluation
#[derive(Debug, Clone)]
pub struct Request {
    /// HTTP method, as received
    pub method: String,
    /// Protocol the request arrived on
    pub scheme: Protocol,
    /// Listener port the request arrived on
    pub port: u16,
    /// URL path, without the query string
    pub path: String,
    /// Raw query string, without the leading '?'
    pub query: Option<String>,
    /// Header name/value pairs in arrival order
    pub headers: Vec<(String, String)>,
    /// Peer address of the client connection
    pub source_ip: Option<IpAddr>,
}

impl Request {
    /// Create a request from a method and a request target ("/path?query")
    pub fn new(method: impl Into<String>, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query.to_string())),
            None => (target, None),
        };
        Self {
            method: method.into(),
            scheme: Protocol::Http,
            port: 80,
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            query,
            headers: Vec::new(),
            source_ip: None,
        }
    }

    /// Create a GET request
    pub fn get(target: &str) -> Self {
        Self::new("GET", target)
    }

    /// Set the Host header
    pub fn with_host(self, host: impl Into<String>) -> Self {
        self.with_header("Host", host)
    }

    /// Append a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the client address
    pub fn with_source_ip(mut self, ip: IpAddr) -> Self {
        self.source_ip = Some(ip);
        self
    }

    /// Set the protocol and port the request arrived on
    pub fn with_scheme(mut self, scheme: Protocol, port: u16) -> Self {
        self.scheme = scheme;
        self.port = port;
        self
    }

    /// Values of a header in occurrence order; names compare case-insensitively
    pub fn header_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Host from the Host header, with any port suffix removed
    pub fn host(&self) -> Option<&str> {
        let raw = self.header_values("host").next()?.trim();
        if raw.is_empty() {
            return None;
        }
        if let Some(rest) = raw.strip_prefix('[') {
            // IPv6 literal: [::1]:8080
            return rest.split_once(']').map(|(addr, _)| addr);
        }
        match raw.rsplit_once(':') {
            Some((host, port)) if !host.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
                Some(host)
            }
            _ => Some(raw),
        }
    }

    /// Value of a cookie from the Cookie header(s)
    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.header_values("cookie")
            .flat_map(|h| h.split(';'))
            .filter_map(|pair| pair.trim().split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }
}
