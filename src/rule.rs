//! Listener rules and the per-listener rule table.

use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::action::Action;
use crate::error::{AdminErrorKind, ConfigErrorKind, LbError, Result};
use crate::matcher::{Condition, RequestMatcher};
use crate::types::Request;

/// Accepted rule priority range
pub const MIN_PRIORITY: u32 = 1;
pub const MAX_PRIORITY: u32 = 50_000;

/// A prioritized set of conditions (AND) with one action.
///
/// A rule without conditions is the listener's default rule and carries
/// no priority.
#[derive(Debug, Clone)]
pub struct Rule {
    priority: Option<u32>,
    conditions: Vec<Condition>,
    action: Action,
}

fn default_rule_error(message: impl Into<String>) -> LbError {
    LbError::config(ConfigErrorKind::InvalidDefaultRule, message)
}

/// Fields that may appear at most once per rule
fn single_use(field: &str) -> bool {
    matches!(
        field,
        "host-header" | "path-pattern" | "http-request-method" | "source-ip"
    )
}

fn check_conditions(conditions: &[Condition]) -> Result<()> {
    for (i, c) in conditions.iter().enumerate() {
        if single_use(c.field()) && conditions[..i].iter().any(|o| o.field() == c.field()) {
            return Err(LbError::config(
                ConfigErrorKind::InvalidCondition,
                format!("{} condition may appear only once per rule", c.field()),
            ));
        }
    }
    Ok(())
}

impl Rule {
    /// A conditioned rule
    pub fn new(priority: u32, conditions: Vec<Condition>, action: Action) -> Result<Self> {
        Self::from_parts(Some(priority), conditions, action)
    }

    /// The catch-all rule
    pub fn default_rule(action: Action) -> Self {
        Self {
            priority: None,
            conditions: Vec::new(),
            action,
        }
    }

    /// Build from optional parts, enforcing the default-rule shape
    pub fn from_parts(priority: Option<u32>, conditions: Vec<Condition>, action: Action) -> Result<Self> {
        match (priority, conditions.is_empty()) {
            (Some(p), false) => {
                if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&p) {
                    return Err(LbError::config(
                        ConfigErrorKind::InvalidPriority,
                        format!("priority {} outside {}-{}", p, MIN_PRIORITY, MAX_PRIORITY),
                    ));
                }
                check_conditions(&conditions)?;
            }
            (Some(p), true) => {
                return Err(default_rule_error(format!(
                    "rule with priority {} has no conditions",
                    p
                )))
            }
            (None, false) => return Err(default_rule_error("conditioned rule needs a priority")),
            (None, true) => {}
        }
        Ok(Self {
            priority,
            conditions,
            action,
        })
    }

    pub fn priority(&self) -> Option<u32> {
        self.priority
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn is_default(&self) -> bool {
        self.conditions.is_empty()
    }

    /// True if every condition matches. The default rule matches everything.
    pub fn matches(&self, request: &Request) -> bool {
        self.conditions.iter().all(|c| c.matches(request))
    }

    /// Copy with one more condition. The default rule cannot gain conditions.
    pub fn with_condition(&self, condition: Condition) -> Result<Self> {
        if self.is_default() {
            return Err(default_rule_error("the default rule cannot have conditions"));
        }
        let mut conditions = self.conditions.clone();
        conditions.push(condition);
        check_conditions(&conditions)?;
        Ok(Self {
            conditions,
            ..self.clone()
        })
    }

    /// Copy without the conditions on `field` (e.g. "path-pattern")
    pub fn without_condition(&self, field: &str) -> Result<Self> {
        let conditions: Vec<Condition> = self
            .conditions
            .iter()
            .filter(|c| c.field() != field)
            .cloned()
            .collect();
        if conditions.len() == self.conditions.len() {
            return Err(LbError::admin(
                AdminErrorKind::NotFound,
                format!("rule has no {} condition", field),
            ));
        }
        if conditions.is_empty() {
            return Err(default_rule_error("a prioritized rule must keep at least one condition"));
        }
        Ok(Self {
            conditions,
            ..self.clone()
        })
    }

    /// Copy with a different action
    pub fn with_action(&self, action: Action) -> Self {
        Self {
            action,
            ..self.clone()
        }
    }
}

#[derive(Default)]
struct RuleSet {
    /// Conditioned rules, ascending priority
    ordered: Vec<Arc<Rule>>,
    default: Option<Arc<Rule>>,
}

impl RuleSet {
    fn build(ordered: Vec<Arc<Rule>>, default: Option<Arc<Rule>>) -> Arc<Self> {
        Arc::new(Self { ordered, default })
    }
}

/// Ordered rules of one listener.
///
/// Evaluation reads an immutable snapshot; mutations are serialized and
/// swap in a new snapshot only after validation succeeds.
pub struct RuleTable {
    snapshot: ArcSwap<RuleSet>,
    writer: Mutex<()>,
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleTable").field("rules", &self.len()).finish()
    }
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(RuleSet::default()),
            writer: Mutex::new(()),
        }
    }

    /// Table holding only a default rule
    pub fn with_default(action: Action) -> Self {
        let table = Self::new();
        table.snapshot.store(Arc::new(RuleSet {
            ordered: Vec::new(),
            default: Some(Arc::new(Rule::default_rule(action))),
        }));
        table
    }

    /// First conditioned rule that matches, by ascending priority, else
    /// the default rule. None only while the table has no default.
    pub fn evaluate(&self, request: &Request) -> Option<Arc<Rule>> {
        let set = self.snapshot.load();
        if let Some(rule) = set.ordered.iter().find(|r| r.matches(request)) {
            debug!(priority = ?rule.priority(), path = %request.path, "rule matched");
            return Some(Arc::clone(rule));
        }
        set.default.clone()
    }

    pub fn add(&self, rule: Rule) -> Result<Arc<Rule>> {
        let _writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let rule = Arc::new(rule);

        match rule.priority() {
            None => {
                if current.default.is_some() {
                    return Err(default_rule_error("listener already has a default rule"));
                }
                self.snapshot
                    .store(RuleSet::build(current.ordered.clone(), Some(Arc::clone(&rule))));
                info!("default rule added");
            }
            Some(priority) => {
                let pos = match current
                    .ordered
                    .binary_search_by_key(&priority, |r| r.priority().unwrap_or(0))
                {
                    Ok(_) => {
                        return Err(LbError::config(
                            ConfigErrorKind::DuplicatePriority,
                            format!("priority {} already in use", priority),
                        ))
                    }
                    Err(pos) => pos,
                };
                let mut ordered = current.ordered.clone();
                ordered.insert(pos, Arc::clone(&rule));
                self.snapshot.store(RuleSet::build(ordered, current.default.clone()));
                info!(priority, "rule added");
            }
        }
        Ok(rule)
    }

    /// Remove a conditioned rule
    pub fn remove(&self, priority: u32) -> Result<Arc<Rule>> {
        let _writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let pos = current
            .ordered
            .binary_search_by_key(&priority, |r| r.priority().unwrap_or(0))
            .map_err(|_| not_found(priority))?;

        let mut ordered = current.ordered.clone();
        let removed = ordered.remove(pos);
        self.snapshot.store(RuleSet::build(ordered, current.default.clone()));
        info!(priority, "rule removed");
        Ok(removed)
    }

    /// Remove the default rule; only allowed when it is the last rule
    pub fn remove_default(&self) -> Result<Arc<Rule>> {
        let _writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let Some(default) = current.default.clone() else {
            return Err(LbError::admin(AdminErrorKind::NotFound, "no default rule"));
        };
        if !current.ordered.is_empty() {
            return Err(default_rule_error(
                "the default rule can only be removed when no other rules remain",
            ));
        }
        self.snapshot.store(Arc::new(RuleSet::default()));
        info!("default rule removed");
        Ok(default)
    }

    /// Swap the rule at the same priority (or the default rule). Returns
    /// the replaced rule.
    pub fn replace(&self, rule: Rule) -> Result<Arc<Rule>> {
        let _writer = self.writer.lock();
        let current = self.snapshot.load_full();
        let rule = Arc::new(rule);

        match rule.priority() {
            None => {
                let old = current
                    .default
                    .clone()
                    .ok_or_else(|| LbError::admin(AdminErrorKind::NotFound, "no default rule"))?;
                self.snapshot
                    .store(RuleSet::build(current.ordered.clone(), Some(rule)));
                info!("default rule replaced");
                Ok(old)
            }
            Some(priority) => {
                let pos = current
                    .ordered
                    .binary_search_by_key(&priority, |r| r.priority().unwrap_or(0))
                    .map_err(|_| not_found(priority))?;
                let mut ordered = current.ordered.clone();
                let old = std::mem::replace(&mut ordered[pos], rule);
                self.snapshot.store(RuleSet::build(ordered, current.default.clone()));
                info!(priority, "rule replaced");
                Ok(old)
            }
        }
    }

    pub fn get(&self, priority: u32) -> Option<Arc<Rule>> {
        let set = self.snapshot.load();
        set.ordered
            .binary_search_by_key(&priority, |r| r.priority().unwrap_or(0))
            .ok()
            .map(|pos| Arc::clone(&set.ordered[pos]))
    }

    pub fn default_rule(&self) -> Option<Arc<Rule>> {
        self.snapshot.load().default.clone()
    }

    /// All rules in evaluation order, default last
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        let set = self.snapshot.load();
        set.ordered.iter().chain(set.default.iter()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        let set = self.snapshot.load();
        set.ordered.len() + usize::from(set.default.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn not_found(priority: u32) -> LbError {
    LbError::admin(
        AdminErrorKind::NotFound,
        format!("no rule with priority {}", priority),
    )
}
