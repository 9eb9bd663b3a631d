use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info};

use super::stickiness::{decode_binding, encode_binding, SetCookie, TARGET_COOKIE};
use super::{Attachable, Target, TargetState};
use crate::error::{AdminErrorKind, ConfigErrorKind, LbError, Result};
use crate::health::{HealthCheck, HealthStatus, HealthTracker};
use crate::types::{Protocol, Request, TargetGroupId, TargetType};

/// Default time a deregistered target keeps draining
pub const DEFAULT_DEREGISTRATION_DELAY: Duration = Duration::from_secs(300);
pub const MAX_DEREGISTRATION_DELAY: Duration = Duration::from_secs(3600);
/// Upper bound for cookie stickiness
pub const MAX_STICKINESS_DURATION: Duration = Duration::from_secs(7 * 24 * 3600);

/// Target selection algorithm within a group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingAlgorithm {
    #[default]
    RoundRobin,
    LeastOutstandingRequests,
}

/// Target group construction options.
#[derive(Debug, Clone)]
pub struct TargetGroupOptions {
    pub name: String,
    pub protocol: Protocol,
    /// Traffic port for targets registered without one
    pub port: Option<u16>,
    /// Lock the target type up front instead of on first registration
    pub target_type: Option<TargetType>,
    /// None uses the defaults for the target type
    pub health_check: Option<HealthCheck>,
    pub algorithm: LoadBalancingAlgorithm,
    pub deregistration_delay: Duration,
    /// Target-level cookie stickiness duration
    pub stickiness: Option<Duration>,
}

impl Default for TargetGroupOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            protocol: Protocol::Http,
            port: Some(80),
            target_type: None,
            health_check: None,
            algorithm: LoadBalancingAlgorithm::RoundRobin,
            deregistration_delay: DEFAULT_DEREGISTRATION_DELAY,
            stickiness: None,
        }
    }
}

impl TargetGroupOptions {
    pub fn new(name: impl Into<String>, protocol: Protocol, port: u16) -> Self {
        Self {
            name: name.into(),
            protocol,
            port: Some(port),
            ..Self::default()
        }
    }

    /// Options for a function target group (no port)
    pub fn lambda(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port: None,
            target_type: Some(TargetType::Lambda),
            ..Self::default()
        }
    }

    pub fn with_target_type(mut self, target_type: TargetType) -> Self {
        self.target_type = Some(target_type);
        self
    }

    pub fn with_health_check(mut self, check: HealthCheck) -> Self {
        self.health_check = Some(check);
        self
    }

    pub fn with_algorithm(mut self, algorithm: LoadBalancingAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn with_deregistration_delay(mut self, delay: Duration) -> Self {
        self.deregistration_delay = delay;
        self
    }

    pub fn with_stickiness(mut self, duration: Duration) -> Self {
        self.stickiness = Some(duration);
        self
    }
}

/// Decrements the target's in-flight counter when dropped.
///
/// Hold it for the lifetime of the downstream call.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicUsize>,
}

impl InFlightGuard {
    fn acquire(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self {
            counter: Arc::clone(counter),
        }
    }

    /// Current in-flight count of the target, this request included
    pub fn in_flight(&self) -> usize {
        self.counter.load(Ordering::Acquire)
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A selected target
#[derive(Debug)]
pub struct Selection {
    pub target: Target,
    pub guard: InFlightGuard,
    /// Stickiness cookie to return to the client
    pub cookie: Option<SetCookie>,
}

/// Receipt for a deregistration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainTicket {
    pub target_id: String,
    pub generation: u64,
    pub deadline: Instant,
    pub delay: Duration,
    /// True if the target was removed immediately (zero delay)
    pub completed: bool,
}

/// Reported target health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetHealthDescription {
    pub target: Target,
    pub state: TargetState,
    pub in_flight: usize,
}

#[derive(Debug, Clone)]
struct Member {
    target: Target,
    state: TargetState,
    in_flight: Arc<AtomicUsize>,
    /// (deadline, generation) while draining
    drain: Option<(Instant, u64)>,
}

/// Immutable view of the group published to readers
#[derive(Debug)]
struct TargetSet {
    members: Vec<Member>,
    /// Indices into `members` eligible for selection, in registration order
    selectable: Vec<usize>,
    /// Shared by every snapshot of the group so picks on a stale snapshot
    /// still advance the live rotation
    cursor: Arc<AtomicUsize>,
    target_type: Option<TargetType>,
    health_check: HealthCheck,
}

struct WriterState {
    trackers: HashMap<String, HealthTracker>,
    health_check_explicit: bool,
    next_generation: u64,
}

/// Pool of registered targets sharing health checks and an algorithm.
///
/// Readers load an immutable `TargetSet` snapshot; registration, draining
/// and health transitions are serialized by the writer lock and publish a
/// new snapshot.
pub struct TargetGroup {
    id: TargetGroupId,
    name: String,
    protocol: Protocol,
    port: Option<u16>,
    algorithm: LoadBalancingAlgorithm,
    deregistration_delay: Duration,
    stickiness: Option<Duration>,
    snapshot: ArcSwap<TargetSet>,
    writer: Mutex<WriterState>,
    attachments: AtomicUsize,
}

impl std::fmt::Debug for TargetGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("protocol", &self.protocol)
            .field("port", &self.port)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

fn initial_state(check: &HealthCheck) -> TargetState {
    if check.enabled {
        TargetState::Initial
    } else {
        TargetState::Unavailable
    }
}

fn is_selectable(member: &Member, check: &HealthCheck) -> bool {
    if check.enabled {
        member.state == TargetState::Healthy
    } else {
        member.state == TargetState::Unavailable
    }
}

impl TargetGroup {
    pub(crate) fn new(id: TargetGroupId, options: TargetGroupOptions) -> Result<Self> {
        if options.deregistration_delay > MAX_DEREGISTRATION_DELAY {
            return Err(LbError::config(
                ConfigErrorKind::InvalidTargetGroup,
                format!(
                    "deregistration delay {:?} exceeds {:?}",
                    options.deregistration_delay, MAX_DEREGISTRATION_DELAY
                ),
            ));
        }
        if let Some(d) = options.stickiness {
            if d < Duration::from_secs(1) || d > MAX_STICKINESS_DURATION {
                return Err(LbError::config(
                    ConfigErrorKind::InvalidTargetGroup,
                    format!("stickiness duration {:?} out of range", d),
                ));
            }
        }

        let explicit = options.health_check.is_some();
        let health_check = match options.health_check {
            Some(check) => {
                if check.enabled {
                    check.validate()?;
                }
                check
            }
            None => HealthCheck::for_target_type(
                options.target_type.unwrap_or(TargetType::Instance),
                options.protocol,
            ),
        };

        Ok(Self {
            id,
            name: options.name,
            protocol: options.protocol,
            port: options.port,
            algorithm: options.algorithm,
            deregistration_delay: options.deregistration_delay,
            stickiness: options.stickiness,
            snapshot: ArcSwap::from_pointee(TargetSet {
                members: Vec::new(),
                selectable: Vec::new(),
                cursor: Arc::new(AtomicUsize::new(0)),
                target_type: options.target_type,
                health_check,
            }),
            writer: Mutex::new(WriterState {
                trackers: HashMap::new(),
                health_check_explicit: explicit,
                next_generation: 0,
            }),
            attachments: AtomicUsize::new(0),
        })
    }

    pub fn id(&self) -> TargetGroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn algorithm(&self) -> LoadBalancingAlgorithm {
        self.algorithm
    }

    pub fn deregistration_delay(&self) -> Duration {
        self.deregistration_delay
    }

    pub fn stickiness(&self) -> Option<Duration> {
        self.stickiness
    }

    /// Locked target type, once known
    pub fn target_type(&self) -> Option<TargetType> {
        self.snapshot.load().target_type
    }

    pub fn health_check(&self) -> HealthCheck {
        self.snapshot.load().health_check.clone()
    }

    /// Publish a new snapshot, carrying the round-robin position over so the
    /// rotation continues after the last selected target.
    fn publish(
        &self,
        prev: &TargetSet,
        members: Vec<Member>,
        target_type: Option<TargetType>,
        health_check: HealthCheck,
    ) {
        let selectable: Vec<usize> = members
            .iter()
            .enumerate()
            .filter(|(_, m)| is_selectable(m, &health_check))
            .map(|(i, _)| i)
            .collect();

        let resync = |taken: usize| {
            if taken == 0 || prev.selectable.is_empty() || selectable.is_empty() {
                return 0;
            }
            let last_idx = prev.selectable[(taken - 1) % prev.selectable.len()];
            let last_id = prev.members[last_idx].target.id();
            selectable
                .iter()
                .position(|&i| members[i].target.id() == last_id)
                .map(|pos| pos + 1)
                .unwrap_or(taken)
        };
        let _ = prev
            .cursor
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |taken| Some(resync(taken)));

        self.snapshot.store(Arc::new(TargetSet {
            members,
            selectable,
            cursor: Arc::clone(&prev.cursor),
            target_type,
            health_check,
        }));
    }

    /// Register a target. The group's target type is locked on the first
    /// registration; re-registering a draining target cancels its removal.
    pub fn register_target(&self, target: &dyn Attachable) -> Result<Target> {
        let descriptor = target.describe();
        let target_type = descriptor.target_type();

        let mut writer = self.writer.lock();
        let prev = self.snapshot.load_full();

        if let Some(locked) = prev.target_type {
            if locked != target_type {
                return Err(LbError::admin(
                    AdminErrorKind::TypeMismatch,
                    format!(
                        "target group {} accepts {} targets, got {}",
                        self.id, locked, target_type
                    ),
                ));
            }
        }

        let target = Target::resolve(descriptor, self.port);
        if target_type != TargetType::Lambda && target.port().is_none() {
            return Err(LbError::config(
                ConfigErrorKind::InvalidTargetGroup,
                format!("target {} has no port and group {} has no default", target.id(), self.id),
            ));
        }

        let health_check = if prev.target_type.is_none() && !writer.health_check_explicit {
            HealthCheck::for_target_type(target_type, self.protocol)
        } else {
            prev.health_check.clone()
        };

        let mut members = prev.members.clone();
        match members.iter_mut().find(|m| m.target.id() == target.id()) {
            Some(existing) if existing.state != TargetState::Draining => {
                return Ok(target);
            }
            Some(existing) => {
                existing.state = initial_state(&health_check);
                existing.drain = None;
                info!(group = %self.id, target = %target, "deregistration cancelled");
            }
            None => {
                if target_type == TargetType::Lambda
                    && members.iter().any(|m| m.state != TargetState::Draining)
                {
                    return Err(LbError::config(
                        ConfigErrorKind::TooManyTargets,
                        format!("target group {} already has a function target", self.id),
                    ));
                }
                members.push(Member {
                    target: target.clone(),
                    state: initial_state(&health_check),
                    in_flight: Arc::new(AtomicUsize::new(0)),
                    drain: None,
                });
                info!(group = %self.id, target = %target, "target registered");
            }
        }
        writer
            .trackers
            .insert(target.id().to_string(), HealthTracker::new());

        self.publish(&prev, members, Some(target_type), health_check);
        Ok(target)
    }

    /// Start draining a target now
    pub fn deregister_target(&self, target_id: &str) -> Result<DrainTicket> {
        self.deregister_target_at(target_id, Instant::now())
    }

    /// Start draining a target at `now`. The target stops being selectable
    /// immediately and is removed once the deregistration delay elapses.
    pub fn deregister_target_at(&self, target_id: &str, now: Instant) -> Result<DrainTicket> {
        let mut writer = self.writer.lock();
        let prev = self.snapshot.load_full();

        let idx = prev
            .members
            .iter()
            .position(|m| m.target.id() == target_id)
            .ok_or_else(|| {
                LbError::admin(
                    AdminErrorKind::NotFound,
                    format!("target {} is not registered in {}", target_id, self.id),
                )
            })?;

        if let Some((deadline, generation)) = prev.members[idx].drain {
            return Ok(DrainTicket {
                target_id: target_id.to_string(),
                generation,
                deadline,
                delay: self.deregistration_delay,
                completed: false,
            });
        }

        writer.next_generation += 1;
        let generation = writer.next_generation;
        let mut members = prev.members.clone();

        if self.deregistration_delay.is_zero() {
            members.remove(idx);
            writer.trackers.remove(target_id);
            info!(group = %self.id, target = target_id, "target deregistered");
            self.publish(&prev, members, prev.target_type, prev.health_check.clone());
            return Ok(DrainTicket {
                target_id: target_id.to_string(),
                generation,
                deadline: now,
                delay: Duration::ZERO,
                completed: true,
            });
        }

        let deadline = now + self.deregistration_delay;
        members[idx].state = TargetState::Draining;
        members[idx].drain = Some((deadline, generation));
        info!(
            group = %self.id,
            target = target_id,
            delay = ?self.deregistration_delay,
            "target draining"
        );
        self.publish(&prev, members, prev.target_type, prev.health_check.clone());

        Ok(DrainTicket {
            target_id: target_id.to_string(),
            generation,
            deadline,
            delay: self.deregistration_delay,
            completed: false,
        })
    }

    /// Remove a draining target if it is still in the drain identified by
    /// `generation`. Returns false when the drain was cancelled or replaced.
    pub fn complete_drain(&self, target_id: &str, generation: u64) -> bool {
        let mut writer = self.writer.lock();
        let prev = self.snapshot.load_full();

        let Some(idx) = prev
            .members
            .iter()
            .position(|m| m.target.id() == target_id && matches!(m.drain, Some((_, g)) if g == generation))
        else {
            return false;
        };

        let mut members = prev.members.clone();
        members.remove(idx);
        writer.trackers.remove(target_id);
        info!(group = %self.id, target = target_id, "target deregistered");
        self.publish(&prev, members, prev.target_type, prev.health_check.clone());
        true
    }

    /// Remove every draining target whose deadline is at or before `now`
    pub fn reap_drained(&self, now: Instant) -> Vec<Target> {
        let mut writer = self.writer.lock();
        let prev = self.snapshot.load_full();

        let (expired, kept): (Vec<Member>, Vec<Member>) = prev
            .members
            .iter()
            .cloned()
            .partition(|m| matches!(m.drain, Some((deadline, _)) if deadline <= now));
        if expired.is_empty() {
            return Vec::new();
        }

        for m in &expired {
            writer.trackers.remove(m.target.id());
            info!(group = %self.id, target = %m.target, "target deregistered");
        }
        self.publish(&prev, kept, prev.target_type, prev.health_check.clone());
        expired.into_iter().map(|m| m.target).collect()
    }

    /// Feed a probe result into the target's health state machine.
    /// Returns the new state on a transition.
    pub fn record_probe(&self, target_id: &str, passed: bool) -> Option<TargetState> {
        let mut writer = self.writer.lock();
        let prev = self.snapshot.load_full();
        if !prev.health_check.enabled {
            return None;
        }

        let idx = prev
            .members
            .iter()
            .position(|m| m.target.id() == target_id && m.state != TargetState::Draining)?;

        let status = writer
            .trackers
            .entry(target_id.to_string())
            .or_default()
            .record(passed, &prev.health_check)?;

        let state = match status {
            HealthStatus::Initial => TargetState::Initial,
            HealthStatus::Healthy => TargetState::Healthy,
            HealthStatus::Unhealthy => TargetState::Unhealthy,
        };
        let mut members = prev.members.clone();
        members[idx].state = state;
        info!(group = %self.id, target = target_id, state = %state, "target health changed");
        self.publish(&prev, members, prev.target_type, prev.health_check.clone());
        Some(state)
    }

    /// Replace the health check. Enabling checks puts every active target
    /// back into `Initial`; disabling makes every active target selectable.
    pub fn configure_health_check(&self, check: HealthCheck) -> Result<()> {
        if check.enabled {
            check.validate()?;
        }

        let mut writer = self.writer.lock();
        let prev = self.snapshot.load_full();
        writer.health_check_explicit = true;

        let mut members = prev.members.clone();
        if check.enabled != prev.health_check.enabled {
            let state = initial_state(&check);
            for m in members.iter_mut().filter(|m| m.state != TargetState::Draining) {
                m.state = state;
                writer
                    .trackers
                    .insert(m.target.id().to_string(), HealthTracker::new());
            }
        }
        info!(group = %self.id, enabled = check.enabled, "health check configured");
        self.publish(&prev, members, prev.target_type, check);
        Ok(())
    }

    /// Select a target without stickiness
    pub fn select_target(&self) -> Result<Selection> {
        let set = self.snapshot.load();
        let idx = self.pick(&set).ok_or(LbError::NoHealthyTargets { group: self.id })?;
        Ok(self.selection(&set, idx, None))
    }

    /// Select a target for a request, honoring the target stickiness cookie
    pub fn select_target_for(&self, request: &Request, now: SystemTime) -> Result<Selection> {
        let Some(ttl) = self.stickiness else {
            return self.select_target();
        };

        let set = self.snapshot.load();
        let bound = request
            .cookie(TARGET_COOKIE)
            .and_then(decode_binding)
            .filter(|b| b.group == self.id && b.is_live(now))
            .and_then(|b| b.target)
            .and_then(|id| {
                set.selectable
                    .iter()
                    .copied()
                    .find(|&i| set.members[i].target.id() == id)
            });

        let idx = match bound {
            Some(idx) => idx,
            None => self.pick(&set).ok_or(LbError::NoHealthyTargets { group: self.id })?,
        };
        let target_id = set.members[idx].target.id();
        let cookie = SetCookie {
            name: TARGET_COOKIE.to_string(),
            value: encode_binding(self.id, Some(target_id), now, ttl),
            max_age: ttl,
        };
        Ok(self.selection(&set, idx, Some(cookie)))
    }

    fn pick(&self, set: &TargetSet) -> Option<usize> {
        let n = set.selectable.len();
        if n == 0 {
            return None;
        }
        let start = set.cursor.fetch_add(1, Ordering::Relaxed);

        match self.algorithm {
            LoadBalancingAlgorithm::RoundRobin => Some(set.selectable[start % n]),
            LoadBalancingAlgorithm::LeastOutstandingRequests => {
                // Scan from the round-robin position so ties rotate.
                let mut best = None;
                let mut best_load = usize::MAX;
                for k in 0..n {
                    let idx = set.selectable[start.wrapping_add(k) % n];
                    let load = set.members[idx].in_flight.load(Ordering::Acquire);
                    if load < best_load {
                        best = Some(idx);
                        best_load = load;
                    }
                }
                best
            }
        }
    }

    fn selection(&self, set: &TargetSet, idx: usize, cookie: Option<SetCookie>) -> Selection {
        let member = &set.members[idx];
        debug!(group = %self.id, target = %member.target, "target selected");
        Selection {
            target: member.target.clone(),
            guard: InFlightGuard::acquire(&member.in_flight),
            cookie,
        }
    }

    /// Health of every registered target, draining ones included
    pub fn targets(&self) -> Vec<TargetHealthDescription> {
        let set = self.snapshot.load();
        set.members
            .iter()
            .map(|m| TargetHealthDescription {
                target: m.target.clone(),
                state: self.reported_state(m),
                in_flight: m.in_flight.load(Ordering::Acquire),
            })
            .collect()
    }

    pub fn target_health(&self, target_id: &str) -> Option<TargetState> {
        let set = self.snapshot.load();
        set.members
            .iter()
            .find(|m| m.target.id() == target_id)
            .map(|m| self.reported_state(m))
    }

    fn reported_state(&self, member: &Member) -> TargetState {
        if member.state != TargetState::Draining && self.attachments() == 0 {
            TargetState::Unused
        } else {
            member.state
        }
    }

    /// Registered targets that are not draining
    pub fn active_targets(&self) -> Vec<Target> {
        let set = self.snapshot.load();
        set.members
            .iter()
            .filter(|m| m.state != TargetState::Draining)
            .map(|m| m.target.clone())
            .collect()
    }

    /// Number of targets currently eligible for selection
    pub fn healthy_count(&self) -> usize {
        self.snapshot.load().selectable.len()
    }

    /// Number of registered targets, draining ones included
    pub fn len(&self) -> usize {
        self.snapshot.load().members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self, target_id: &str) -> Option<usize> {
        let set = self.snapshot.load();
        set.members
            .iter()
            .find(|m| m.target.id() == target_id)
            .map(|m| m.in_flight.load(Ordering::Acquire))
    }

    /// Record that a listener rule references this group
    pub(crate) fn attach(&self) {
        self.attachments.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        let _ = self
            .attachments
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Number of listener rules referencing this group
    pub fn attachments(&self) -> usize {
        self.attachments.load(Ordering::Acquire)
    }
}
