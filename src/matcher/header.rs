use once_cell::sync::Lazy;
use regex::Regex;

use super::{require_values, GlobPattern, RequestMatcher};
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

/// RFC 7230 token characters
static HEADER_NAME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9!#$%&'*+\-.^_`|~]{1,40}$")
        .expect("HEADER_NAME: hardcoded regex is invalid")
});

const MAX_VALUE_LEN: usize = 128;

/// HTTP header matcher - case-insensitive name lookup, glob over values
#[derive(Debug, Clone)]
pub struct HttpHeaderMatcher {
    name: String,
    values: Vec<GlobPattern>,
}

impl HttpHeaderMatcher {
    pub fn new<S: AsRef<str>>(name: &str, values: &[S]) -> Result<Self> {
        if !HEADER_NAME.is_match(name) {
            return Err(LbError::config(
                ConfigErrorKind::InvalidCondition,
                format!("Invalid http-header name: {:?}", name),
            ));
        }
        require_values("http-header", values)?;
        let mut patterns = Vec::with_capacity(values.len());
        for value in values {
            let value = value.as_ref();
            if value.is_empty() || value.len() > MAX_VALUE_LEN {
                return Err(LbError::config(
                    ConfigErrorKind::InvalidCondition,
                    format!("Invalid http-header value for {}: {:?}", name, value),
                ));
            }
            patterns.push(GlobPattern::case_insensitive(value));
        }
        Ok(Self {
            name: name.to_string(),
            values: patterns,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[GlobPattern] {
        &self.values
    }
}

impl RequestMatcher for HttpHeaderMatcher {
    fn matches(&self, request: &Request) -> bool {
        // Occurrence order: first occurrence is checked against every value
        // before moving on to the next one.
        request
            .header_values(&self.name)
            .any(|actual| self.values.iter().any(|p| p.matches(actual)))
    }
}
