use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, warn};

use super::{HealthCheck, HealthProber, ProbeResult, StaticProber};
use crate::error::{LbError, Result};
use crate::target::{DrainTicket, Target, TargetGroup};
use crate::types::TargetGroupId;

/// How often the monitor picks up registrations and removals
const RECONCILE_INTERVAL: Duration = Duration::from_secs(1);

/// Async health probe transport
#[async_trait]
pub trait AsyncHealthProber: Send + Sync {
    async fn probe(&self, target: &Target, check: &HealthCheck) -> ProbeResult;
}

/// Runs a blocking prober on the blocking thread pool
pub struct BlockingProber<P>(Arc<P>);

impl<P: HealthProber + 'static> BlockingProber<P> {
    pub fn new(prober: P) -> Self {
        Self(Arc::new(prober))
    }
}

#[async_trait]
impl<P: HealthProber + 'static> AsyncHealthProber for BlockingProber<P> {
    async fn probe(&self, target: &Target, check: &HealthCheck) -> ProbeResult {
        let prober = Arc::clone(&self.0);
        let target = target.clone();
        let check = check.clone();
        tokio::task::spawn_blocking(move || HealthProber::probe(&*prober, &target, &check))
            .await
            .unwrap_or_else(|e| ProbeResult::failed(format!("probe task failed: {}", e)))
    }
}

#[async_trait]
impl AsyncHealthProber for StaticProber {
    async fn probe(&self, target: &Target, check: &HealthCheck) -> ProbeResult {
        HealthProber::probe(self, target, check)
    }
}

type TaskMap = Arc<Mutex<HashMap<String, JoinHandle<()>>>>;

/// Periodically probes every active target of a group.
///
/// One task per target probes immediately, then once per interval; each
/// probe is bounded by the check timeout, and a timeout counts as a
/// failure. Tasks hold the group weakly and exit once it is dropped.
pub struct HealthMonitor {
    group: TargetGroupId,
    tasks: TaskMap,
    supervisor: JoinHandle<()>,
}

impl HealthMonitor {
    /// Start monitoring a group. Requires a running tokio runtime.
    pub fn spawn(group: &Arc<TargetGroup>, prober: Arc<dyn AsyncHealthProber>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| LbError::Probe(format!("health monitor needs a tokio runtime: {}", e)))?;

        let tasks: TaskMap = Arc::new(Mutex::new(HashMap::new()));
        let weak = Arc::downgrade(group);
        let supervisor_tasks = Arc::clone(&tasks);
        let supervisor = handle.spawn(async move {
            loop {
                let Some(group) = weak.upgrade() else { break };
                reconcile(&group, &prober, &supervisor_tasks);
                drop(group);
                tokio::time::sleep(RECONCILE_INTERVAL).await;
            }
        });

        debug!(group = %group.id(), "health monitor started");
        Ok(Self {
            group: group.id(),
            tasks,
            supervisor,
        })
    }

    pub fn group(&self) -> TargetGroupId {
        self.group
    }

    /// Number of targets currently being probed
    pub fn monitored(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Stop the supervisor and every probe task
    pub fn stop(&self) {
        self.supervisor.abort();
        for (_, task) in self.tasks.lock().drain() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reconcile(group: &Arc<TargetGroup>, prober: &Arc<dyn AsyncHealthProber>, tasks: &TaskMap) {
    let active = group.active_targets();
    let ids: HashSet<&str> = active.iter().map(|t| t.id()).collect();
    let mut tasks = tasks.lock();

    tasks.retain(|id, task| {
        let keep = ids.contains(id.as_str()) && !task.is_finished();
        if !keep {
            task.abort();
        }
        keep
    });

    for target in active {
        if tasks.contains_key(target.id()) {
            continue;
        }
        debug!(group = %group.id(), target = %target, "probing target");
        let id = target.id().to_string();
        let task = tokio::spawn(probe_loop(Arc::downgrade(group), target, Arc::clone(prober)));
        tasks.insert(id, task);
    }
}

async fn probe_loop(group: Weak<TargetGroup>, target: Target, prober: Arc<dyn AsyncHealthProber>) {
    loop {
        let Some(g) = group.upgrade() else { return };
        let check = g.health_check();
        drop(g);

        if check.enabled {
            let result = match tokio::time::timeout(check.timeout, prober.probe(&target, &check)).await {
                Ok(result) => result,
                Err(_) => ProbeResult::failed(format!("probe timed out after {:?}", check.timeout)),
            };
            if let ProbeResult::Failed { reason } = &result {
                debug!(target = %target, reason = %reason, "health probe failed");
            }

            let Some(g) = group.upgrade() else { return };
            if let Some(state) = g.record_probe(target.id(), result.is_pass()) {
                if state == crate::target::TargetState::Unhealthy {
                    warn!(group = %g.id(), target = %target, "target unhealthy");
                }
            }
        }

        tokio::time::sleep(check.interval).await;
    }
}

type DrainKey = (TargetGroupId, String);

/// Completes deregistrations once their delay elapses.
///
/// A timer only removes the target if the drain it was scheduled for is
/// still current; re-registration makes stale timers no-ops.
#[derive(Default)]
pub struct DrainTimers {
    pending: Arc<Mutex<HashMap<DrainKey, (u64, AbortHandle)>>>,
}

impl DrainTimers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule removal for a drain ticket. Returns false if nothing was
    /// scheduled (already completed, or no tokio runtime).
    pub fn schedule(&self, group: &Arc<TargetGroup>, ticket: &DrainTicket) -> bool {
        if ticket.completed {
            return false;
        }
        let Ok(handle) = Handle::try_current() else {
            return false;
        };

        let key = (group.id(), ticket.target_id.clone());
        let generation = ticket.generation;
        let delay = ticket.delay;
        let weak = Arc::downgrade(group);
        let pending = Arc::clone(&self.pending);
        let task_key = key.clone();

        // Held across spawn so the timer cannot clear its entry before it exists
        let mut guard = self.pending.lock();
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(group) = weak.upgrade() {
                group.complete_drain(&task_key.1, generation);
            }
            let mut pending = pending.lock();
            if matches!(pending.get(&task_key), Some((g, _)) if *g == generation) {
                pending.remove(&task_key);
            }
        });
        if let Some((_, previous)) = guard.insert(key, (generation, task.abort_handle())) {
            previous.abort();
        }
        true
    }

    /// Cancel the pending timer for a target, if any
    pub fn cancel(&self, group: TargetGroupId, target_id: &str) -> bool {
        match self.pending.lock().remove(&(group, target_id.to_string())) {
            Some((_, task)) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    /// Number of scheduled timers
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }
}

impl Drop for DrainTimers {
    fn drop(&mut self) {
        for (_, (_, task)) in self.pending.lock().drain() {
            task.abort();
        }
    }
}
