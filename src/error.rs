use thiserror::Error;

use crate::types::TargetGroupId;

/// Classifies configuration errors. These are raised before an object
/// becomes active; a failed mutation never publishes a new snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigErrorKind {
    /// Another rule on the listener already uses this priority
    DuplicatePriority,
    /// Default rule misuse (second default, conditioned rule without priority, ...)
    InvalidDefaultRule,
    /// Redirect does not change protocol, host, port or path
    RedirectLoop,
    /// More than one terminal action declared on a rule
    TooManyActions,
    /// HTTPS/TLS listener without exactly one default certificate
    MissingCertificate,
    /// Priority outside the accepted range
    InvalidPriority,
    /// Condition value failed validation
    InvalidCondition,
    /// Status code outside the accepted range
    InvalidStatusCode,
    /// Forward action with bad group list or weights
    InvalidForward,
    /// Health check parameters out of range
    InvalidHealthCheck,
    /// Feature not available for the listener or load balancer protocol
    UnsupportedProtocol,
    /// Target group cannot hold more targets of this type
    TooManyTargets,
    /// Action parameters failed validation
    InvalidAction,
    /// Target group parameters out of range
    InvalidTargetGroup,
    /// A listener already uses this port
    DuplicateListener,
}

/// Classifies administrative errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminErrorKind {
    /// Rule, listener, target group or target does not exist
    NotFound,
    /// Target type differs from the group's locked target type
    TypeMismatch,
    /// Object is still referenced and cannot be removed
    InUse,
}

/// Engine error types
#[derive(Error, Debug)]
pub enum LbError {
    #[error("Config error: {message}")]
    Config {
        kind: ConfigErrorKind,
        message: String,
    },

    #[error("Admin error: {message}")]
    Admin {
        kind: AdminErrorKind,
        message: String,
    },

    #[error("No healthy targets in target group {group}")]
    NoHealthyTargets { group: TargetGroupId },

    #[error("Probe error: {0}")]
    Probe(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

impl LbError {
    pub(crate) fn config(kind: ConfigErrorKind, message: impl Into<String>) -> Self {
        LbError::Config {
            kind,
            message: message.into(),
        }
    }

    pub(crate) fn admin(kind: AdminErrorKind, message: impl Into<String>) -> Self {
        LbError::Admin {
            kind,
            message: message.into(),
        }
    }

    /// Configuration error kind, if this is a configuration error.
    pub fn config_kind(&self) -> Option<ConfigErrorKind> {
        match self {
            LbError::Config { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Administrative error kind, if this is an administrative error.
    pub fn admin_kind(&self) -> Option<AdminErrorKind> {
        match self {
            LbError::Admin { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, LbError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_kind_is_matchable() {
        let err = LbError::config(ConfigErrorKind::DuplicatePriority, "priority 10 already in use");
        match &err {
            LbError::Config { kind, .. } => {
                assert!(matches!(kind, ConfigErrorKind::DuplicatePriority));
            }
            _ => panic!("expected Config"),
        }
        assert_eq!(err.config_kind(), Some(ConfigErrorKind::DuplicatePriority));
        assert_eq!(err.admin_kind(), None);
    }

    #[test]
    fn test_admin_error_kind_is_matchable() {
        let err = LbError::admin(AdminErrorKind::TypeMismatch, "group accepts ip targets");
        assert_eq!(err.admin_kind(), Some(AdminErrorKind::TypeMismatch));
    }

    #[test]
    fn test_error_display_includes_message() {
        let err = LbError::config(ConfigErrorKind::RedirectLoop, "redirect changes nothing");
        let display = format!("{}", err);
        assert!(display.contains("redirect changes nothing"), "got: {}", display);
    }

    #[test]
    fn test_no_healthy_targets_display() {
        let err = LbError::NoHealthyTargets {
            group: TargetGroupId(7),
        };
        assert_eq!(err.to_string(), "No healthy targets in target group tg-7");
    }
}
