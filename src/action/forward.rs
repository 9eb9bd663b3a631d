use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use super::{Decision, DispatchContext};
use crate::error::{ConfigErrorKind, LbError, Result};
use crate::target::{decode_binding, encode_binding, SetCookie, GROUP_COOKIE, MAX_STICKINESS_DURATION};
use crate::types::{Request, TargetGroupId};

/// Maximum number of target groups in one forward action
pub const MAX_FORWARD_GROUPS: usize = 5;
/// Maximum weight of a single target group
pub const MAX_WEIGHT: u32 = 999;

/// A target group and its share of traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeightedTargetGroup {
    pub group: TargetGroupId,
    pub weight: u32,
}

/// Forward to one or more weighted target groups.
///
/// Groups are chosen by weighted round robin; when the chosen group has
/// no selectable target the other groups are tried by descending weight.
#[derive(Debug)]
pub struct ForwardAction {
    groups: Vec<WeightedTargetGroup>,
    stickiness: Option<Duration>,
    total_weight: u32,
    cursor: AtomicUsize,
}

impl Clone for ForwardAction {
    fn clone(&self) -> Self {
        Self {
            groups: self.groups.clone(),
            stickiness: self.stickiness,
            total_weight: self.total_weight,
            cursor: AtomicUsize::new(self.cursor.load(Ordering::Relaxed)),
        }
    }
}

impl PartialEq for ForwardAction {
    fn eq(&self, other: &Self) -> bool {
        self.groups == other.groups && self.stickiness == other.stickiness
    }
}

fn invalid(message: impl Into<String>) -> LbError {
    LbError::config(ConfigErrorKind::InvalidForward, message)
}

impl ForwardAction {
    /// Forward everything to a single group
    pub fn to(group: TargetGroupId) -> Self {
        Self {
            groups: vec![WeightedTargetGroup { group, weight: 1 }],
            stickiness: None,
            total_weight: 1,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Forward to several groups by weight
    pub fn weighted(groups: Vec<(TargetGroupId, u32)>) -> Result<Self> {
        if groups.is_empty() || groups.len() > MAX_FORWARD_GROUPS {
            return Err(invalid(format!(
                "forward takes 1 to {} target groups, got {}",
                MAX_FORWARD_GROUPS,
                groups.len()
            )));
        }
        for (i, (id, weight)) in groups.iter().enumerate() {
            if *weight > MAX_WEIGHT {
                return Err(invalid(format!("weight {} of {} exceeds {}", weight, id, MAX_WEIGHT)));
            }
            if groups[..i].iter().any(|(other, _)| other == id) {
                return Err(invalid(format!("target group {} listed twice", id)));
            }
        }

        let total_weight: u32 = groups.iter().map(|(_, w)| w).sum();
        if groups.len() > 1 && total_weight == 0 {
            return Err(invalid("at least one target group needs a non-zero weight"));
        }

        Ok(Self {
            groups: groups
                .into_iter()
                .map(|(group, weight)| WeightedTargetGroup { group, weight })
                .collect(),
            stickiness: None,
            total_weight,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Bind clients to the chosen group for `duration`
    pub fn with_stickiness(mut self, duration: Duration) -> Result<Self> {
        if duration < Duration::from_secs(1) || duration > MAX_STICKINESS_DURATION {
            return Err(invalid(format!("stickiness duration {:?} out of range", duration)));
        }
        self.stickiness = Some(duration);
        Ok(self)
    }

    pub fn groups(&self) -> &[WeightedTargetGroup] {
        &self.groups
    }

    pub fn stickiness(&self) -> Option<Duration> {
        self.stickiness
    }

    /// Groups eligible for traffic. A lone group is always eligible.
    fn routable(&self, group: TargetGroupId) -> bool {
        self.groups
            .iter()
            .any(|g| g.group == group && (g.weight > 0 || self.groups.len() == 1))
    }

    fn pick_group(&self) -> TargetGroupId {
        if self.groups.len() == 1 || self.total_weight == 0 {
            return self.groups[0].group;
        }
        let slot = (self.cursor.fetch_add(1, Ordering::Relaxed) % self.total_weight as usize) as u32;
        let mut acc = 0;
        for g in &self.groups {
            acc += g.weight;
            if slot < acc {
                return g.group;
            }
        }
        self.groups[0].group
    }

    /// The chosen group first, then the other routable groups by weight
    fn attempt_order(&self, first: TargetGroupId) -> Vec<TargetGroupId> {
        let mut rest: Vec<&WeightedTargetGroup> = self
            .groups
            .iter()
            .filter(|g| g.group != first && g.weight > 0)
            .collect();
        rest.sort_by(|a, b| b.weight.cmp(&a.weight));

        let mut order = Vec::with_capacity(rest.len() + 1);
        order.push(first);
        order.extend(rest.into_iter().map(|g| g.group));
        order
    }

    pub(crate) fn execute(&self, request: &Request, ctx: &DispatchContext<'_>) -> Result<Decision> {
        let bound = self
            .stickiness
            .and_then(|_| request.cookie(GROUP_COOKIE))
            .and_then(decode_binding)
            .filter(|b| b.is_live(ctx.now) && self.routable(b.group))
            .map(|b| b.group);

        let first = bound.unwrap_or_else(|| self.pick_group());
        for id in self.attempt_order(first) {
            let Some(group) = ctx.groups.get(id) else {
                warn!(group = %id, "forward references a missing target group");
                continue;
            };
            match group.select_target_for(request, ctx.now) {
                Ok(selection) => {
                    let mut cookies = Vec::new();
                    if let Some(ttl) = self.stickiness {
                        cookies.push(SetCookie {
                            name: GROUP_COOKIE.to_string(),
                            value: encode_binding(id, None, ctx.now, ttl),
                            max_age: ttl,
                        });
                    }
                    cookies.extend(selection.cookie);
                    debug!(group = %id, target = %selection.target, "forwarding");
                    return Ok(Decision::ForwardTo {
                        group: id,
                        target: selection.target,
                        guard: selection.guard,
                        cookies,
                    });
                }
                Err(LbError::NoHealthyTargets { .. }) => {
                    debug!(group = %id, "no healthy targets, trying next group");
                }
                Err(e) => return Err(e),
            }
        }

        warn!(group = %first, "no healthy targets in any forward group");
        Err(LbError::NoHealthyTargets { group: first })
    }
}
