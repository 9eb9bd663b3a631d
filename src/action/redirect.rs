use serde::Deserialize;

use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

const PROTOCOL: &str = "#{protocol}";
const HOST: &str = "#{host}";
const PORT: &str = "#{port}";
/// Request path without its leading '/'
const PATH: &str = "#{path}";
const QUERY: &str = "#{query}";
const DEFAULT_PATH: &str = "/#{path}";

/// Redirect components. Unset components keep the request's value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedirectOptions {
    pub protocol: Option<String>,
    pub host: Option<String>,
    pub port: Option<String>,
    pub path: Option<String>,
    pub query: Option<String>,
    /// 301 when true, 302 otherwise
    pub permanent: bool,
}

impl RedirectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_port(mut self, port: impl Into<String>) -> Self {
        self.port = Some(port.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query = Some(query.into());
        self
    }

    pub fn permanent(mut self) -> Self {
        self.permanent = true;
        self
    }
}

/// Redirect the client to a URI built from the request's components.
///
/// Each component may reference `#{protocol}`, `#{host}`, `#{port}`,
/// `#{path}` and `#{query}`; references are expanded in a single pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectAction {
    protocol: String,
    host: String,
    port: String,
    path: String,
    query: String,
    status: u16,
}

fn invalid(message: impl Into<String>) -> LbError {
    LbError::config(ConfigErrorKind::InvalidAction, message)
}

impl RedirectAction {
    pub fn new(options: RedirectOptions) -> Result<Self> {
        let protocol = match options.protocol {
            None => PROTOCOL.to_string(),
            Some(p) if p == PROTOCOL => p,
            Some(p) if p.eq_ignore_ascii_case("http") || p.eq_ignore_ascii_case("https") => {
                p.to_ascii_uppercase()
            }
            Some(p) => return Err(invalid(format!("redirect protocol '{}' must be HTTP or HTTPS", p))),
        };

        let host = options.host.unwrap_or_else(|| HOST.to_string());
        if host.is_empty() || host.len() > 128 {
            return Err(invalid("redirect host must be 1-128 characters"));
        }

        let port = options.port.unwrap_or_else(|| PORT.to_string());
        if port != PORT && port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
            return Err(invalid(format!("redirect port '{}' is not 1-65535", port)));
        }

        let path = options.path.unwrap_or_else(|| DEFAULT_PATH.to_string());
        if !path.starts_with('/') || path.len() > 128 {
            return Err(invalid(format!("redirect path '{}' must start with '/'", path)));
        }

        let query = options.query.unwrap_or_else(|| QUERY.to_string());
        if query.starts_with('?') || query.len() > 128 {
            return Err(invalid("redirect query must not start with '?'"));
        }

        if protocol == PROTOCOL && host == HOST && port == PORT && path == DEFAULT_PATH {
            return Err(LbError::config(
                ConfigErrorKind::RedirectLoop,
                "redirect does not change protocol, host, port or path",
            ));
        }

        Ok(Self {
            protocol,
            host,
            port,
            path,
            query,
            status: if options.permanent { 301 } else { 302 },
        })
    }

    /// Build from a status code (301 or 302) instead of a permanence flag
    pub fn with_status(mut self, status: u16) -> Result<Self> {
        if status != 301 && status != 302 {
            return Err(LbError::config(
                ConfigErrorKind::InvalidStatusCode,
                format!("redirect status {} must be 301 or 302", status),
            ));
        }
        self.status = status;
        Ok(self)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Render the Location URI for a request. Default ports are omitted.
    /// Returns None when the host expands to nothing.
    pub fn location(&self, request: &Request) -> Option<String> {
        let protocol = expand(&self.protocol, request).to_ascii_lowercase();
        let host = expand(&self.host, request);
        if host.is_empty() {
            return None;
        }
        let port = expand(&self.port, request);
        let path = expand(&self.path, request);
        let query = expand(&self.query, request);

        let default_port = matches!(
            (protocol.as_str(), port.as_str()),
            ("http", "80") | ("https", "443")
        );
        let mut uri = format!("{}://{}", protocol, host);
        if !default_port && !port.is_empty() {
            uri.push(':');
            uri.push_str(&port);
        }
        uri.push_str(&path);
        if !query.is_empty() {
            uri.push('?');
            uri.push_str(&query);
        }
        Some(uri)
    }
}

fn expand(template: &str, request: &Request) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("#{") {
        out.push_str(&rest[..start]);
        let tail = &rest[start..];
        let Some(end) = tail.find('}') else {
            out.push_str(tail);
            return out;
        };
        match &tail[..=end] {
            PROTOCOL => out.push_str(request.scheme.scheme()),
            HOST => out.push_str(request.host().unwrap_or("")),
            PORT => out.push_str(&request.port.to_string()),
            PATH => out.push_str(request.path.strip_prefix('/').unwrap_or(&request.path)),
            QUERY => out.push_str(request.query.as_deref().unwrap_or("")),
            other => out.push_str(other),
        }
        rest = &tail[end + 1..];
    }
    out.push_str(rest);
    out
}
