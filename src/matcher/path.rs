use super::{require_values, GlobPattern, RequestMatcher};
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

const MAX_PATTERN_LEN: usize = 128;

/// Path pattern matcher - case-sensitive glob against the URL path only
#[derive(Debug, Clone)]
pub struct PathPatternMatcher {
    patterns: Vec<GlobPattern>,
}

impl PathPatternMatcher {
    pub fn new<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        require_values("path-pattern", values)?;
        let mut patterns = Vec::with_capacity(values.len());
        for value in values {
            let value = value.as_ref();
            if value.is_empty()
                || value.len() > MAX_PATTERN_LEN
                || value.chars().any(char::is_whitespace)
            {
                return Err(LbError::config(
                    ConfigErrorKind::InvalidCondition,
                    format!("Invalid path-pattern: {:?}", value),
                ));
            }
            patterns.push(GlobPattern::new(value));
        }
        Ok(Self { patterns })
    }

    pub fn patterns(&self) -> &[GlobPattern] {
        &self.patterns
    }
}

impl RequestMatcher for PathPatternMatcher {
    fn matches(&self, request: &Request) -> bool {
        self.patterns.iter().any(|p| p.matches(&request.path))
    }
}
