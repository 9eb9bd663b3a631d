//! Routing conditions.
//!
//! Each condition variant has its own matcher; `Condition` wraps them in a
//! closed enum so rules can hold any mix. Matching is pure and fails closed:
//! a request missing the inspected attribute never matches.

mod glob;
mod header;
mod host;
mod ip;
mod method;
mod path;
mod query;

pub use glob::GlobPattern;
pub use header::HttpHeaderMatcher;
pub use host::HostHeaderMatcher;
pub use ip::SourceIpMatcher;
pub use method::MethodMatcher;
pub use path::PathPatternMatcher;
pub use query::{QueryPair, QueryStringMatcher};

use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

/// Trait for request matchers
pub trait RequestMatcher: Send + Sync {
    /// Check if the request matches this matcher
    fn matches(&self, request: &Request) -> bool;
}

/// Enum wrapper for all condition types
#[derive(Debug, Clone)]
pub enum Condition {
    HostHeader(HostHeaderMatcher),
    PathPattern(PathPatternMatcher),
    HttpHeader(HttpHeaderMatcher),
    HttpRequestMethod(MethodMatcher),
    QueryString(QueryStringMatcher),
    SourceIp(SourceIpMatcher),
}

impl Condition {
    pub fn host_header<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        HostHeaderMatcher::new(values).map(Condition::HostHeader)
    }

    pub fn path_pattern<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        PathPatternMatcher::new(values).map(Condition::PathPattern)
    }

    pub fn http_header<S: AsRef<str>>(name: &str, values: &[S]) -> Result<Self> {
        HttpHeaderMatcher::new(name, values).map(Condition::HttpHeader)
    }

    pub fn http_request_method<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        MethodMatcher::new(values).map(Condition::HttpRequestMethod)
    }

    pub fn query_string(pairs: Vec<(Option<String>, String)>) -> Result<Self> {
        QueryStringMatcher::new(pairs).map(Condition::QueryString)
    }

    pub fn source_ip<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        SourceIpMatcher::new(values).map(Condition::SourceIp)
    }

    /// Field name as used in listener rule configuration
    pub fn field(&self) -> &'static str {
        match self {
            Condition::HostHeader(_) => "host-header",
            Condition::PathPattern(_) => "path-pattern",
            Condition::HttpHeader(_) => "http-header",
            Condition::HttpRequestMethod(_) => "http-request-method",
            Condition::QueryString(_) => "query-string",
            Condition::SourceIp(_) => "source-ip",
        }
    }
}

impl RequestMatcher for Condition {
    fn matches(&self, request: &Request) -> bool {
        match self {
            Condition::HostHeader(m) => m.matches(request),
            Condition::PathPattern(m) => m.matches(request),
            Condition::HttpHeader(m) => m.matches(request),
            Condition::HttpRequestMethod(m) => m.matches(request),
            Condition::QueryString(m) => m.matches(request),
            Condition::SourceIp(m) => m.matches(request),
        }
    }
}

pub(crate) fn require_values<S>(field: &str, values: &[S]) -> Result<()> {
    if values.is_empty() {
        return Err(LbError::config(
            ConfigErrorKind::InvalidCondition,
            format!("{} condition requires at least one value", field),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_dispatch() {
        let req = Request::new("POST", "/api/users?v=2")
            .with_host("api.example.com")
            .with_header("X-Tenant", "acme")
            .with_source_ip("10.1.2.3".parse().unwrap());

        let matching = [
            Condition::host_header(&["*.example.com"]).unwrap(),
            Condition::path_pattern(&["/api/*"]).unwrap(),
            Condition::http_header("x-tenant", &["ACME"]).unwrap(),
            Condition::http_request_method(&["POST"]).unwrap(),
            Condition::query_string(vec![(Some("v".into()), "2".into())]).unwrap(),
            Condition::source_ip(&["10.0.0.0/8"]).unwrap(),
        ];
        for c in &matching {
            assert!(c.matches(&req), "{} should match", c.field());
        }

        let failing = [
            Condition::host_header(&["example.org"]).unwrap(),
            Condition::path_pattern(&["/web/*"]).unwrap(),
            Condition::http_header("x-tenant", &["other"]).unwrap(),
            Condition::http_request_method(&["GET"]).unwrap(),
            Condition::query_string(vec![(Some("v".into()), "1".into())]).unwrap(),
            Condition::source_ip(&["192.168.0.0/16"]).unwrap(),
        ];
        for c in &failing {
            assert!(!c.matches(&req), "{} should not match", c.field());
        }
    }

    #[test]
    fn test_empty_values_rejected() {
        let err = Condition::path_pattern::<&str>(&[]).unwrap_err();
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::InvalidCondition));
    }
}
