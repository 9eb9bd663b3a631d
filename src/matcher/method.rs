use once_cell::sync::Lazy;
use regex::Regex;

use super::{require_values, RequestMatcher};
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::Request;

static METHOD_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Z_\-]{1,40}$").expect("METHOD_PATTERN: hardcoded regex is invalid")
});

/// HTTP method matcher - exact, case-sensitive, no wildcards
#[derive(Debug, Clone)]
pub struct MethodMatcher {
    methods: Vec<String>,
}

impl MethodMatcher {
    pub fn new<S: AsRef<str>>(values: &[S]) -> Result<Self> {
        require_values("http-request-method", values)?;
        let mut methods = Vec::with_capacity(values.len());
        for value in values {
            let value = value.as_ref();
            if !METHOD_PATTERN.is_match(value) {
                return Err(LbError::config(
                    ConfigErrorKind::InvalidCondition,
                    format!("Invalid http-request-method: {:?}", value),
                ));
            }
            methods.push(value.to_string());
        }
        Ok(Self { methods })
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }
}

impl RequestMatcher for MethodMatcher {
    fn matches(&self, request: &Request) -> bool {
        self.methods.iter().any(|m| *m == request.method)
    }
}
