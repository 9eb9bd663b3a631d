use crate::error::{ConfigErrorKind, LbError, Result};

/// Largest accepted fixed response body, in bytes
pub const MAX_BODY_LEN: usize = 1024;

/// Content types a fixed response may declare
pub const CONTENT_TYPES: &[&str] = &[
    "text/plain",
    "text/css",
    "text/html",
    "application/javascript",
    "application/json",
];

/// Return a canned response without contacting any target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedResponse {
    status: u16,
    content_type: Option<String>,
    body: Option<String>,
}

impl FixedResponse {
    pub fn new(status: u16) -> Result<Self> {
        if !(200..=599).contains(&status) {
            return Err(LbError::config(
                ConfigErrorKind::InvalidStatusCode,
                format!("fixed response status {} outside 200-599", status),
            ));
        }
        Ok(Self {
            status,
            content_type: None,
            body: None,
        })
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Result<Self> {
        let body = body.into();
        if body.len() > MAX_BODY_LEN {
            return Err(LbError::config(
                ConfigErrorKind::InvalidAction,
                format!("fixed response body is {} bytes, limit {}", body.len(), MAX_BODY_LEN),
            ));
        }
        self.body = Some(body);
        Ok(self)
    }

    pub fn with_content_type(mut self, content_type: &str) -> Result<Self> {
        let normalized = content_type.trim().to_ascii_lowercase();
        if !CONTENT_TYPES.contains(&normalized.as_str()) {
            return Err(LbError::config(
                ConfigErrorKind::InvalidAction,
                format!("unsupported content type '{}'", content_type),
            ));
        }
        self.content_type = Some(normalized);
        Ok(self)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn body(&self) -> Option<&str> {
        self.body.as_deref()
    }

    /// Declared content type, or one inferred from the body
    pub fn content_type(&self) -> Option<&str> {
        if let Some(ct) = &self.content_type {
            return Some(ct);
        }
        let body = self.body.as_deref()?.trim_start();
        let inferred = if body.starts_with('{') || body.starts_with('[') {
            "application/json"
        } else if body.starts_with('<') {
            "text/html"
        } else {
            "text/plain"
        };
        Some(inferred)
    }
}
