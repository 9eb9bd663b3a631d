//! Target health checking.
//!
//! `HealthCheck` describes how targets are probed, `HealthTracker` turns
//! probe results into health transitions, and the probers implement the
//! actual HTTP / TCP checks. With the `async` feature, `HealthMonitor`
//! schedules probes per target and `DrainTimers` completes deregistrations.

use std::time::Duration;

use crate::error::{ConfigErrorKind, LbError, Result};
use crate::types::{Protocol, TargetType};

mod probe;
mod state;

#[cfg(feature = "async")]
mod monitor;

pub use probe::{HealthProber, HttpProber, ProbeResult, StaticProber, TcpProber};
pub use state::{HealthStatus, HealthTracker};

#[cfg(feature = "async")]
pub use monitor::{AsyncHealthProber, BlockingProber, DrainTimers, HealthMonitor};

/// Accepted health check interval range
pub const MIN_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_INTERVAL: Duration = Duration::from_secs(300);
/// Accepted probe timeout range
pub const MIN_TIMEOUT: Duration = Duration::from_secs(2);
pub const MAX_TIMEOUT: Duration = Duration::from_secs(120);
/// Accepted threshold range (both healthy and unhealthy)
pub const MIN_THRESHOLD: u32 = 2;
pub const MAX_THRESHOLD: u32 = 10;

/// HTTP status codes considered a passing probe, e.g. "200", "200,202", "200-299"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMatcher {
    ranges: Vec<(u16, u16)>,
}

impl StatusMatcher {
    pub fn parse(codes: &str) -> Result<Self> {
        let invalid = || {
            LbError::config(
                ConfigErrorKind::InvalidHealthCheck,
                format!("Invalid success codes: {:?}", codes),
            )
        };

        let mut ranges = Vec::new();
        for part in codes.split(',') {
            let part = part.trim();
            let (start, end) = match part.split_once('-') {
                Some((s, e)) => (
                    s.trim().parse::<u16>().map_err(|_| invalid())?,
                    e.trim().parse::<u16>().map_err(|_| invalid())?,
                ),
                None => {
                    let code = part.parse::<u16>().map_err(|_| invalid())?;
                    (code, code)
                }
            };
            if start > end || start < 200 || end > 599 {
                return Err(invalid());
            }
            ranges.push((start, end));
        }
        Ok(Self { ranges })
    }

    pub fn matches(&self, status: u16) -> bool {
        self.ranges.iter().any(|(s, e)| (*s..=*e).contains(&status))
    }
}

impl Default for StatusMatcher {
    fn default() -> Self {
        Self {
            ranges: vec![(200, 200)],
        }
    }
}

/// Health check configuration for a target group
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheck {
    pub enabled: bool,
    /// Probe protocol: HTTP/HTTPS issue a GET, everything else a TCP connect
    pub protocol: Protocol,
    pub path: String,
    /// Probe port; None probes the traffic port
    pub port: Option<u16>,
    pub interval: Duration,
    pub timeout: Duration,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    pub matcher: StatusMatcher,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            enabled: true,
            protocol: Protocol::Http,
            path: "/".to_string(),
            port: None,
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            healthy_threshold: 5,
            unhealthy_threshold: 2,
            matcher: StatusMatcher::default(),
        }
    }
}

impl HealthCheck {
    /// Defaults for a target type and traffic protocol.
    ///
    /// Lambda groups start disabled. TCP-family groups probe with a TCP
    /// connect and symmetric thresholds.
    pub fn for_target_type(target_type: TargetType, protocol: Protocol) -> Self {
        match target_type {
            TargetType::Lambda => Self {
                enabled: false,
                interval: Duration::from_secs(35),
                timeout: Duration::from_secs(30),
                ..Self::default()
            },
            _ if protocol.is_application() => Self {
                protocol,
                ..Self::default()
            },
            _ => Self {
                protocol: Protocol::Tcp,
                timeout: Duration::from_secs(10),
                healthy_threshold: 3,
                unhealthy_threshold: 3,
                ..Self::default()
            },
        }
    }

    /// Health checks disabled: every registered target is selectable
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_thresholds(mut self, healthy: u32, unhealthy: u32) -> Self {
        self.healthy_threshold = healthy;
        self.unhealthy_threshold = unhealthy;
        self
    }

    pub fn with_matcher(mut self, matcher: StatusMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Whether the probe is an HTTP(S) request rather than a TCP connect
    pub fn is_http(&self) -> bool {
        self.protocol.is_application()
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |message: String| Err(LbError::config(ConfigErrorKind::InvalidHealthCheck, message));

        if !(MIN_INTERVAL..=MAX_INTERVAL).contains(&self.interval) {
            return fail(format!("interval {:?} out of range", self.interval));
        }
        if !(MIN_TIMEOUT..=MAX_TIMEOUT).contains(&self.timeout) {
            return fail(format!("timeout {:?} out of range", self.timeout));
        }
        if self.timeout >= self.interval {
            return fail(format!(
                "timeout {:?} must be less than interval {:?}",
                self.timeout, self.interval
            ));
        }
        for threshold in [self.healthy_threshold, self.unhealthy_threshold] {
            if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&threshold) {
                return fail(format!("threshold {} out of range", threshold));
            }
        }
        if self.is_http() && !self.path.starts_with('/') {
            return fail(format!("path {:?} must start with '/'", self.path));
        }
        if matches!(self.protocol, Protocol::Udp | Protocol::TcpUdp) {
            return fail(format!("{} cannot be used for health checks", self.protocol));
        }
        Ok(())
    }
}
