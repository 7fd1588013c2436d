//! Bounded FIFO of warm instances for one config fingerprint.

use std::collections::VecDeque;

use clusterpool_reconcile::Fingerprint;

use crate::types::{ClusterConfig, ClusterInstance, ClusterState, InstanceId};

/// Warm instances sharing one fingerprint, oldest first.
///
/// Members are always READY or CREATING and never exceed `size`. Refills in
/// flight are tracked separately so concurrent refills cannot overshoot.
#[derive(Debug)]
pub struct PoolQueue {
    fingerprint: Fingerprint,
    /// Config used for refills.
    template: ClusterConfig,
    size: usize,
    members: VecDeque<ClusterInstance>,
    provisioning: usize,
}

impl PoolQueue {
    pub fn new(template: ClusterConfig, size: usize) -> Self {
        Self {
            fingerprint: template.fingerprint(),
            template,
            size,
            members: VecDeque::new(),
            provisioning: 0,
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn template(&self) -> &ClusterConfig {
        &self.template
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.members.len() >= self.size
    }

    pub fn contains(&self, id: &InstanceId) -> bool {
        self.members.iter().any(|m| m.id() == *id)
    }

    pub fn members(&self) -> impl Iterator<Item = &ClusterInstance> {
        self.members.iter()
    }

    /// Take the oldest READY member.
    pub fn pop_ready(&mut self) -> Option<ClusterInstance> {
        let idx = self
            .members
            .iter()
            .position(|m| m.state() == ClusterState::Ready)?;
        self.members.remove(idx)
    }

    /// Append a member. If the queue is full the oldest member is evicted
    /// and returned; with `size == 0` the pushed instance itself comes back.
    ///
    /// # Panics
    ///
    /// If the member is not READY/CREATING or belongs to another fingerprint.
    pub fn push(&mut self, instance: ClusterInstance) -> Option<ClusterInstance> {
        assert!(
            instance.state().is_poolable(),
            "cannot pool instance {} in state {}",
            instance.id(),
            instance.state()
        );
        assert!(
            instance.fingerprint() == self.fingerprint,
            "instance {} does not match pool {}",
            instance.id(),
            self.fingerprint
        );

        if self.size == 0 {
            return Some(instance);
        }
        let evicted = if self.is_full() {
            Some(self.evict())
        } else {
            None
        };
        self.members.push_back(instance);
        evicted
    }

    /// Remove and return the oldest member.
    ///
    /// # Panics
    ///
    /// If the queue is empty.
    pub fn evict(&mut self) -> ClusterInstance {
        match self.members.pop_front() {
            Some(oldest) => oldest,
            None => panic!("evict from empty pool queue {}", self.fingerprint),
        }
    }

    /// Remove a specific member.
    pub fn remove(&mut self, id: &InstanceId) -> Option<ClusterInstance> {
        let idx = self.members.iter().position(|m| m.id() == *id)?;
        self.members.remove(idx)
    }

    /// Replace the stored copy of a member, e.g. after it became READY.
    /// Returns false if it is no longer a member.
    pub fn update(&mut self, instance: ClusterInstance) -> bool {
        match self.members.iter_mut().find(|m| m.id() == instance.id()) {
            Some(slot) => {
                *slot = instance;
                true
            }
            None => false,
        }
    }

    /// IDs of members still coming up.
    pub fn creating(&self) -> Vec<InstanceId> {
        self.members
            .iter()
            .filter(|m| m.state() == ClusterState::Creating)
            .map(ClusterInstance::id)
            .collect()
    }

    /// Members needed to reach `size`, counting refills in flight.
    pub fn deficit(&self) -> usize {
        self.size
            .saturating_sub(self.members.len() + self.provisioning)
    }

    /// Reserve `count` refill slots.
    pub fn begin_provisioning(&mut self, count: usize) {
        self.provisioning += count;
    }

    /// Release one refill slot.
    pub fn finish_provisioning(&mut self) {
        self.provisioning = self.provisioning.saturating_sub(1);
    }

    pub fn provisioning(&self) -> usize {
        self.provisioning
    }
}
