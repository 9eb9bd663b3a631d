use once_cell::sync::Lazy;
use regex::Regex;

use super::{require_values, GlobPattern, RequestMatcher};
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

static HOST_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9\-.*?]{1,128}$").expect("HOST_PATTERN: hardcoded regex is invalid")
});

/// Host header matcher - case-insensitive glob against the request host
#[derive(Debug, Clone)]
pub struct HostHeaderMatcher {
    patterns: Vec<GlobPattern>,
}

impl HostHeaderMatcher {
    pub fn new<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        require_values("host-header", values)?;
        let mut patterns = Vec::with_capacity(values.len());
        for value in values {
            let value = value.as_ref().trim();
            if !HOST_PATTERN.is_match(value) {
                return Err(LbError::config(
                    ConfigErrorKind::InvalidCondition,
                    format!("Invalid host-header pattern: {:?}", value),
                ));
            }
            patterns.push(GlobPattern::case_insensitive(value));
        }
        Ok(Self { patterns })
    }

    pub fn patterns(&self) -> &[GlobPattern] {
        &self.patterns
    }
}

impl RequestMatcher for HostHeaderMatcher {
    fn matches(&self, request: &Request) -> bool {
        match request.host() {
            Some(host) => self.patterns.iter().any(|p| p.matches(host)),
            None => false,
        }
    }
}
