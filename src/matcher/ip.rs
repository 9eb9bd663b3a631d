use std::net::IpAddr;

use ipnet::IpNet;

use super::{require_values, RequestMatcher};
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

/// Source IP matcher - CIDR containment against the connection peer address.
/// Forwarded-for headers are not consulted.
#[derive(Debug, Clone)]
pub struct SourceIpMatcher {
    networks: Vec<IpNet>,
}

impl SourceIpMatcher {
    pub fn new<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        require_values("source-ip", values)?;
        let mut networks = Vec::with_capacity(values.len());
        for value in values {
            networks.push(parse_network(value.as_ref().trim())?);
        }
        Ok(Self { networks })
    }

    pub fn from_networks(networks: Vec<IpNet>) -> Self {
        Self { networks }
    }

    pub fn networks(&self) -> &[IpNet] {
        &self.networks
    }
}

/// Parse a CIDR, or a bare address as a host network
fn parse_network(value: &str) -> Result<IpNet> {
    if let Ok(net) = value.parse::<IpNet>() {
        return Ok(net);
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| {
            LbError::config(
                ConfigErrorKind::InvalidCondition,
                format!("Invalid source-ip CIDR: {:?}", value),
            )
        })
}

impl RequestMatcher for SourceIpMatcher {
    fn matches(&self, request: &Request) -> bool {
        match request.source_ip {
            Some(ip) => {
                // Dual-stack sockets report IPv4 clients as ::ffff:a.b.c.d
                let ip = ip.to_canonical();
                self.networks.iter().any(|net| net.contains(&ip))
            }
            None => false,
        }
    }
}
