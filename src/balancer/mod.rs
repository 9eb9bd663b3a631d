//! Load balancer module.
//!
//! `LoadBalancer` is the administrative surface: it owns the target group
//! registry and the listeners, and routes requests to the listener bound
//! to a port.

use std::collections::BTreeMap;
#[cfg(feature = "async")]
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
#[cfg(feature = "async")]
use parking_lot::Mutex;
use tracing::info;

use crate::action::{Action, Decision};
use crate::error::{AdminErrorKind, ConfigErrorKind, LbError, Result};
use crate::health::HealthCheck;
#[cfg(feature = "async")]
use crate::health::{AsyncHealthProber, DrainTimers, HealthMonitor};
use crate::listener::{Listener, ListenerOptions};
use crate::matcher::Condition;
use crate::rule::Rule;
use crate::target::{
    Attachable, DrainTicket, Target, TargetDescriptor, TargetGroup, TargetGroupOptions,
    TargetGroupRegistry, TargetHealthDescription,
};
use crate::types::{LoadBalancerKind, Request, TargetGroupId};

/// Options for `LoadBalancer::add_targets`: create a group, register
/// targets and route to it from a listener in one step.
#[derive(Debug, Clone)]
pub struct AddTargetsOptions {
    pub name: String,
    pub targets: Vec<TargetDescriptor>,
    /// None adds the listener's default rule
    pub priority: Option<u32>,
    pub conditions: Vec<Condition>,
    /// None derives protocol and port from the listener
    pub group: Option<TargetGroupOptions>,
}

impl AddTargetsOptions {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: Vec::new(),
            priority: None,
            conditions: Vec::new(),
            group: None,
        }
    }

    pub fn with_target(mut self, target: &dyn Attachable) -> Self {
        self.targets.push(target.describe());
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_group_options(mut self, options: TargetGroupOptions) -> Self {
        self.group = Some(options);
        self
    }
}

/// A load balancer: listeners by port plus the target groups they route to
pub struct LoadBalancer {
    name: String,
    kind: LoadBalancerKind,
    groups: Arc<TargetGroupRegistry>,
    listeners: ArcSwap<BTreeMap<u16, Arc<Listener>>>,
    #[cfg(feature = "async")]
    drains: DrainTimers,
    #[cfg(feature = "async")]
    monitors: Mutex<HashMap<TargetGroupId, HealthMonitor>>,
}

impl LoadBalancer {
    pub fn new(name: impl Into<String>, kind: LoadBalancerKind) -> Self {
        Self {
            name: name.into(),
            kind,
            groups: Arc::new(TargetGroupRegistry::new()),
            listeners: ArcSwap::from_pointee(BTreeMap::new()),
            #[cfg(feature = "async")]
            drains: DrainTimers::new(),
            #[cfg(feature = "async")]
            monitors: Mutex::new(HashMap::new()),
        }
    }

    pub fn application(name: impl Into<String>) -> Self {
        Self::new(name, LoadBalancerKind::Application)
    }

    pub fn network(name: impl Into<String>) -> Self {
        Self::new(name, LoadBalancerKind::Network)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> LoadBalancerKind {
        self.kind
    }

    pub fn target_groups(&self) -> &Arc<TargetGroupRegistry> {
        &self.groups
    }

    pub fn create_target_group(&self, options: TargetGroupOptions) -> Result<TargetGroupId> {
        self.groups.create(options)
    }

    pub fn target_group(&self, id: TargetGroupId) -> Option<Arc<TargetGroup>> {
        self.groups.get(id)
    }

    /// Remove a target group no rule references
    pub fn remove_target_group(&self, id: TargetGroupId) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.groups.remove_locked(id)?;
        #[cfg(feature = "async")]
        self.monitors.lock().remove(&id);
        Ok(())
    }

    pub fn add_listener(&self, options: ListenerOptions) -> Result<Arc<Listener>> {
        let _admin = self.groups.lock_admin();
        let current = self.listeners.load_full();
        if current.contains_key(&options.port) {
            return Err(LbError::config(
                ConfigErrorKind::DuplicateListener,
                format!("port {} already has a listener", options.port),
            ));
        }

        let listener = Arc::new(Listener::new_locked(options, self.kind, Arc::clone(&self.groups))?);
        let mut listeners = BTreeMap::clone(&current);
        listeners.insert(listener.port(), Arc::clone(&listener));
        self.listeners.store(Arc::new(listeners));
        Ok(listener)
    }

    /// Remove a listener and release the target groups its rules reference
    pub fn remove_listener(&self, port: u16) -> Result<()> {
        let _admin = self.groups.lock_admin();
        let current = self.listeners.load_full();
        let mut listeners = BTreeMap::clone(&current);
        let listener = listeners.remove(&port).ok_or_else(|| no_listener(port))?;
        self.listeners.store(Arc::new(listeners));
        listener.release_locked();
        info!(lb = %self.name, port, "listener removed");
        Ok(())
    }

    pub fn listener(&self, port: u16) -> Option<Arc<Listener>> {
        self.listeners.load().get(&port).cloned()
    }

    fn require_listener(&self, port: u16) -> Result<Arc<Listener>> {
        self.listener(port).ok_or_else(|| no_listener(port))
    }

    /// Listener ports, ascending
    pub fn ports(&self) -> Vec<u16> {
        self.listeners.load().keys().copied().collect()
    }

    pub fn add_rule(&self, port: u16, rule: Rule) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.require_listener(port)?.add_rule_locked(rule)
    }

    pub fn remove_rule(&self, port: u16, priority: u32) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.require_listener(port)?.remove_rule_locked(priority)
    }

    pub fn replace_rule(&self, port: u16, rule: Rule) -> Result<()> {
        let _admin = self.groups.lock_admin();
        self.require_listener(port)?.replace_rule_locked(rule)
    }

    /// Create a target group, register `targets` and forward to it from
    /// the listener on `port`. Nothing is kept if any step fails.
    pub fn add_targets(&self, port: u16, options: AddTargetsOptions) -> Result<TargetGroupId> {
        let _admin = self.groups.lock_admin();
        let listener = self.require_listener(port)?;
        let group_options = options.group.unwrap_or_else(|| {
            TargetGroupOptions::new(options.name.clone(), listener.protocol(), listener.port())
        });
        let rule_conditions = options.conditions;
        let priority = options.priority;

        let id = self.groups.create(group_options)?;
        let result = (|| -> Result<()> {
            let group = self.groups.require(id)?;
            for target in &options.targets {
                group.register_target(target)?;
            }
            let rule = Rule::from_parts(priority, rule_conditions, Action::forward(id))?;
            listener.add_rule_locked(rule)
        })();

        if let Err(e) = result {
            let _ = self.groups.remove_locked(id);
            return Err(e);
        }
        info!(lb = %self.name, port, group = %id, targets = options.targets.len(), "targets added");
        Ok(id)
    }

    /// Register a target. Re-registering a draining target cancels its
    /// pending removal.
    pub fn register_target(&self, group: TargetGroupId, target: &dyn Attachable) -> Result<Target> {
        let target = self.groups.require(group)?.register_target(target)?;
        #[cfg(feature = "async")]
        self.drains.cancel(group, target.id());
        Ok(target)
    }

    /// Start draining a target. With a tokio runtime the target is removed
    /// when the delay elapses; otherwise call `reap_drained`.
    pub fn deregister_target(&self, group: TargetGroupId, target_id: &str) -> Result<DrainTicket> {
        let tg = self.groups.require(group)?;
        let ticket = tg.deregister_target(target_id)?;
        #[cfg(feature = "async")]
        self.drains.schedule(&tg, &ticket);
        Ok(ticket)
    }

    /// Remove every target whose drain deadline has passed
    pub fn reap_drained(&self, now: Instant) -> Vec<(TargetGroupId, Target)> {
        self.groups
            .ids()
            .into_iter()
            .filter_map(|id| self.groups.get(id))
            .flat_map(|g| {
                let id = g.id();
                g.reap_drained(now).into_iter().map(move |t| (id, t))
            })
            .collect()
    }

    pub fn configure_health_check(&self, group: TargetGroupId, check: HealthCheck) -> Result<()> {
        self.groups.require(group)?.configure_health_check(check)
    }

    pub fn target_health(&self, group: TargetGroupId) -> Result<Vec<TargetHealthDescription>> {
        Ok(self.groups.require(group)?.targets())
    }

    /// Start probing a group's targets in the background
    #[cfg(feature = "async")]
    pub fn monitor_health(&self, group: TargetGroupId, prober: Arc<dyn AsyncHealthProber>) -> Result<()> {
        let tg = self.groups.require(group)?;
        let monitor = HealthMonitor::spawn(&tg, prober)?;
        self.monitors.lock().insert(group, monitor);
        Ok(())
    }

    /// Stop probing a group
    #[cfg(feature = "async")]
    pub fn stop_monitoring(&self, group: TargetGroupId) -> bool {
        self.monitors.lock().remove(&group).is_some()
    }

    /// Handle a request arriving on `port`
    pub fn handle(&self, port: u16, request: &Request) -> Result<Decision> {
        Ok(self.require_listener(port)?.handle(request))
    }
}

impl fmt::Debug for LoadBalancer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadBalancer")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("ports", &self.ports())
            .finish()
    }
}

fn no_listener(port: u16) -> LbError {
    LbError::admin(AdminErrorKind::NotFound, format!("no listener on port {}", port))
}
