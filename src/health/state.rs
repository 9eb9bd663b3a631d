use super::HealthCheck;

/// Probe-driven health status of a single target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HealthStatus {
    /// Registered, no probe has completed yet. Not selectable.
    Initial,
    Healthy,
    Unhealthy,
}

/// Consecutive pass/fail counter for one target.
///
/// The first completed probe settles an `Initial` target. After that,
/// `unhealthy_threshold` consecutive failures flip healthy to unhealthy and
/// `healthy_threshold` consecutive passes flip it back. Any opposite result
/// resets the running streak.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    status: HealthStatus,
    successes: u32,
    failures: u32,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            status: HealthStatus::Initial,
            successes: 0,
            failures: 0,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_successes(&self) -> u32 {
        self.successes
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Feed one probe result. Returns the new status on a transition.
    pub fn record(&mut self, passed: bool, check: &HealthCheck) -> Option<HealthStatus> {
        if passed {
            self.successes = self.successes.saturating_add(1);
            self.failures = 0;
        } else {
            self.failures = self.failures.saturating_add(1);
            self.successes = 0;
        }

        let next = match (self.status, passed) {
            (HealthStatus::Initial, true) => HealthStatus::Healthy,
            (HealthStatus::Initial, false) => HealthStatus::Unhealthy,
            (HealthStatus::Healthy, false) if self.failures >= check.unhealthy_threshold => {
                HealthStatus::Unhealthy
            }
            (HealthStatus::Unhealthy, true) if self.successes >= check.healthy_threshold => {
                HealthStatus::Healthy
            }
            (status, _) => status,
        };

        if next == self.status {
            return None;
        }
        self.status = next;
        self.successes = 0;
        self.failures = 0;
        Some(next)
    }
}
