use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard};
use tracing::info;

use super::{TargetGroup, TargetGroupOptions};
use crate::error::{AdminErrorKind, LbError, Result};
use crate::types::TargetGroupId;

/// Arena of target groups, addressed by `TargetGroupId`.
///
/// Forward actions hold ids rather than group references; lookups go
/// through the current map snapshot without locking. The admin lock
/// serializes group removal with every rule and listener mutation of the
/// load balancer sharing this registry.
pub struct TargetGroupRegistry {
    groups: ArcSwap<HashMap<TargetGroupId, Arc<TargetGroup>>>,
    next_id: Mutex<u32>,
    admin: Mutex<()>,
}

impl Default for TargetGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetGroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: ArcSwap::from_pointee(HashMap::new()),
            next_id: Mutex::new(1),
            admin: Mutex::new(()),
        }
    }

    /// Hold while checking group references and publishing the change
    pub(crate) fn lock_admin(&self) -> MutexGuard<'_, ()> {
        self.admin.lock()
    }

    /// Create a group and return its id
    pub fn create(&self, options: TargetGroupOptions) -> Result<TargetGroupId> {
        let mut next_id = self.next_id.lock();
        let id = TargetGroupId(*next_id);
        let group = Arc::new(TargetGroup::new(id, options)?);
        *next_id += 1;

        let mut groups = HashMap::clone(&self.groups.load());
        info!(group = %id, name = group.name(), "target group created");
        groups.insert(id, group);
        self.groups.store(Arc::new(groups));
        Ok(id)
    }

    pub fn get(&self, id: TargetGroupId) -> Option<Arc<TargetGroup>> {
        self.groups.load().get(&id).cloned()
    }

    /// Look up a group, failing with `NotFound`
    pub fn require(&self, id: TargetGroupId) -> Result<Arc<TargetGroup>> {
        self.get(id).ok_or_else(|| {
            LbError::admin(AdminErrorKind::NotFound, format!("target group {} not found", id))
        })
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<TargetGroup>> {
        self.groups
            .load()
            .values()
            .find(|g| g.name() == name)
            .cloned()
    }

    /// Remove a group that no listener rule references
    pub fn remove(&self, id: TargetGroupId) -> Result<Arc<TargetGroup>> {
        let _admin = self.lock_admin();
        self.remove_locked(id)
    }

    /// `remove` for callers already holding the admin lock
    pub(crate) fn remove_locked(&self, id: TargetGroupId) -> Result<Arc<TargetGroup>> {
        let current = self.groups.load_full();
        let group = current.get(&id).cloned().ok_or_else(|| {
            LbError::admin(AdminErrorKind::NotFound, format!("target group {} not found", id))
        })?;
        if group.attachments() > 0 {
            return Err(LbError::admin(
                AdminErrorKind::InUse,
                format!(
                    "target group {} is referenced by {} rule(s)",
                    id,
                    group.attachments()
                ),
            ));
        }

        let mut groups = HashMap::clone(&current);
        groups.remove(&id);
        self.groups.store(Arc::new(groups));
        info!(group = %id, "target group removed");
        Ok(group)
    }

    /// Ids of all groups, ascending
    pub fn ids(&self) -> Vec<TargetGroupId> {
        let mut ids: Vec<_> = self.groups.load().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.groups.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
