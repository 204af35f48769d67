//! An in-memory store used by tests and standalone mode
//!
//! The producer side of this store is the surface external collaborators
//! would own in a real deployment: watchers that create and update
//! workloads, queues, and flavors, plus the job controller acknowledgement
//! that finalizes an eviction.

use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::{event, Level};

use crate::models::{
    Admission, ClusterQueue, ClusterQueueStatus, Condition, ConditionType, LocalQueue,
    ResourceFlavor, Workload,
};
use crate::store::{StoreEvent, WatchEvent};
use crate::Error;

/// The objects and subscribers behind the store lock
#[derive(Default)]
struct MemInner {
    /// The next resource version to stamp
    version: u64,
    /// The workloads in this store by namespace/name key
    workloads: HashMap<String, Workload>,
    /// The cluster queues in this store by name
    cluster_queues: HashMap<String, ClusterQueue>,
    /// The mirrored status counters by cluster queue name
    statuses: HashMap<String, ClusterQueueStatus>,
    /// The resource flavors in this store by name
    flavors: HashMap<String, ResourceFlavor>,
    /// The local queues in this store by namespace/name key
    local_queues: HashMap<String, LocalQueue>,
    /// The channels to stream changes to
    subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
}

impl MemInner {
    /// Stamp and return the next resource version
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Stream an event to all live subscribers
    ///
    /// # Arguments
    ///
    /// * `event` - The event to stream
    fn broadcast(&mut self, event: &StoreEvent) {
        // drop any subscribers whose receiver has closed
        self.subscribers
            .retain(|sub| sub.send(event.clone()).is_ok());
    }
}

/// An in-memory implementation of the Berth store
#[derive(Default)]
pub struct MemStore {
    /// The guarded objects and subscribers
    inner: Mutex<MemInner>,
}

impl MemStore {
    /// Create a new empty in-memory store
    #[must_use]
    pub fn new() -> Self {
        MemStore::default()
    }

    /// Lock our inner state
    fn lock(&self) -> std::sync::MutexGuard<'_, MemInner> {
        // a poisoned store lock is unrecoverable
        self.inner.lock().expect("store lock poisoned")
    }

    /// Create or replace a workload and stream the change
    ///
    /// # Arguments
    ///
    /// * `workload` - The workload to upsert
    pub fn upsert_workload(&self, mut workload: Workload) -> Workload {
        let mut inner = self.lock();
        workload.resource_version = inner.next_version();
        let key = workload.key();
        let event = match inner.workloads.insert(key, workload.clone()) {
            Some(_) => StoreEvent::Workload(WatchEvent::Modified(workload.clone())),
            None => StoreEvent::Workload(WatchEvent::Added(workload.clone())),
        };
        inner.broadcast(&event);
        workload
    }

    /// Delete a workload and stream the change
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to delete
    pub fn delete_workload(&self, key: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.workloads.remove(key) {
            Some(workload) => {
                let event = StoreEvent::Workload(WatchEvent::Deleted(workload));
                inner.broadcast(&event);
                Ok(())
            }
            None => Err(Error::NotFound(key.to_owned())),
        }
    }

    /// Create or replace a cluster queue and stream the change
    ///
    /// # Arguments
    ///
    /// * `queue` - The cluster queue to upsert
    pub fn upsert_cluster_queue(&self, queue: ClusterQueue) {
        let mut inner = self.lock();
        let event = match inner.cluster_queues.insert(queue.name.clone(), queue.clone()) {
            Some(_) => StoreEvent::ClusterQueue(WatchEvent::Modified(queue)),
            None => StoreEvent::ClusterQueue(WatchEvent::Added(queue)),
        };
        inner.broadcast(&event);
    }

    /// Delete a cluster queue and stream the change
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the cluster queue to delete
    pub fn delete_cluster_queue(&self, name: &str) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.cluster_queues.remove(name) {
            Some(queue) => {
                inner.statuses.remove(name);
                let event = StoreEvent::ClusterQueue(WatchEvent::Deleted(queue));
                inner.broadcast(&event);
                Ok(())
            }
            None => Err(Error::NotFound(name.to_owned())),
        }
    }

    /// Create or replace a resource flavor and stream the change
    ///
    /// # Arguments
    ///
    /// * `flavor` - The flavor to upsert
    pub fn upsert_flavor(&self, flavor: ResourceFlavor) {
        let mut inner = self.lock();
        let event = match inner.flavors.insert(flavor.name.clone(), flavor.clone()) {
            Some(_) => StoreEvent::Flavor(WatchEvent::Modified(flavor)),
            None => StoreEvent::Flavor(WatchEvent::Added(flavor)),
        };
        inner.broadcast(&event);
    }

    /// Create or replace a local queue and stream the change
    ///
    /// # Arguments
    ///
    /// * `queue` - The local queue to upsert
    pub fn upsert_local_queue(&self, queue: LocalQueue) {
        let mut inner = self.lock();
        let event = match inner.local_queues.insert(queue.key(), queue.clone()) {
            Some(_) => StoreEvent::LocalQueue(WatchEvent::Modified(queue)),
            None => StoreEvent::LocalQueue(WatchEvent::Added(queue)),
        };
        inner.broadcast(&event);
    }

    /// Raise the PodsReady condition on a workload
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload whose pods are ready
    pub fn set_pods_ready(&self, key: &str) -> Result<Workload, Error> {
        self.mutate(key, |workload| {
            workload.set_condition(Condition::new(
                ConditionType::PodsReady,
                true,
                "PodsReady",
                "All pods were ready or succeeded since the workload admission",
            ));
            Ok(())
        })
    }

    /// Mark a workload as finished which reclaims its usage
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload that finished
    pub fn finish(&self, key: &str) -> Result<Workload, Error> {
        self.mutate(key, |workload| {
            workload.set_condition(Condition::new(
                ConditionType::Finished,
                true,
                "JobFinished",
                "Job finished successfully",
            ));
            Ok(())
        })
    }

    /// Deactivate a workload which evicts it with the Deactivated reason
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to deactivate
    pub fn deactivate(&self, key: &str) -> Result<Workload, Error> {
        self.mutate(key, |workload| {
            workload.set_condition(Condition::new(
                ConditionType::Evicted,
                true,
                crate::models::EVICTED_BY_DEACTIVATION,
                "The workload is deactivated",
            ));
            Ok(())
        })
    }

    /// Acknowledge an eviction the way the external job controller would
    ///
    /// The controller stops the pods and then clears the admission, which
    /// is what releases the quota held by the workload.
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload whose eviction completed
    pub fn ack_eviction(&self, key: &str) -> Result<Workload, Error> {
        self.mutate(key, |workload| {
            let evicted = match workload.condition(ConditionType::Evicted) {
                Some(cond) if cond.status => cond.clone(),
                _ => {
                    return Err(Error::new(format!(
                        "{key} has no pending eviction to acknowledge"
                    )))
                }
            };
            workload.unset_admission(evicted.reason, evicted.message);
            Ok(())
        })
    }

    /// Get the mirrored status counters for a cluster queue
    ///
    /// # Arguments
    ///
    /// * `name` - The cluster queue to get counters for
    #[must_use]
    pub fn queue_status(&self, name: &str) -> ClusterQueueStatus {
        self.lock().statuses.get(name).cloned().unwrap_or_default()
    }

    /// Mutate a workload, bump its version, and stream the change
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to mutate
    /// * `update` - The mutation to apply
    fn mutate<F>(&self, key: &str, update: F) -> Result<Workload, Error>
    where
        F: FnOnce(&mut Workload) -> Result<(), Error>,
    {
        let mut inner = self.lock();
        let version = inner.next_version();
        let workload = match inner.workloads.get_mut(key) {
            Some(workload) => {
                update(workload)?;
                workload.resource_version = version;
                workload.clone()
            }
            None => return Err(Error::NotFound(key.to_owned())),
        };
        let event = StoreEvent::Workload(WatchEvent::Modified(workload.clone()));
        inner.broadcast(&event);
        Ok(workload)
    }

    /// Mutate a workload only if the callers version is current
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to mutate
    /// * `expected_version` - The resource version the caller observed
    /// * `update` - The mutation to apply
    fn mutate_versioned<F>(
        &self,
        key: &str,
        expected_version: u64,
        update: F,
    ) -> Result<Workload, Error>
    where
        F: FnOnce(&mut Workload) -> Result<(), Error>,
    {
        {
            let inner = self.lock();
            let found = match inner.workloads.get(key) {
                Some(workload) => workload.resource_version,
                None => return Err(Error::NotFound(key.to_owned())),
            };
            if found != expected_version {
                return Err(Error::conflict(key, expected_version, found));
            }
        }
        self.mutate(key, update)
    }
}

#[async_trait::async_trait]
impl super::Store for MemStore {
    /// Subscribe to changes for all entity kinds
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        // replay the current state as Added events before streaming changes
        for flavor in inner.flavors.values() {
            let _ = tx.send(StoreEvent::Flavor(WatchEvent::Added(flavor.clone())));
        }
        for queue in inner.cluster_queues.values() {
            let _ = tx.send(StoreEvent::ClusterQueue(WatchEvent::Added(queue.clone())));
        }
        for queue in inner.local_queues.values() {
            let _ = tx.send(StoreEvent::LocalQueue(WatchEvent::Added(queue.clone())));
        }
        for workload in inner.workloads.values() {
            let _ = tx.send(StoreEvent::Workload(WatchEvent::Added(workload.clone())));
        }
        inner.subscribers.push(tx);
        rx
    }

    /// Get a workload by its namespace/name key
    async fn get_workload(&self, key: &str) -> Result<Workload, Error> {
        let inner = self.lock();
        inner
            .workloads
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.to_owned()))
    }

    /// Apply an admission to a workload and raise its Admitted condition
    async fn admit(
        &self,
        key: &str,
        expected_version: u64,
        admission: Admission,
    ) -> Result<Workload, Error> {
        self.mutate_versioned(key, expected_version, |workload| {
            workload.set_admission(admission);
            Ok(())
        })
    }

    /// Raise the Evicted condition on a workload
    async fn evict(
        &self,
        key: &str,
        expected_version: u64,
        reason: &str,
        message: &str,
    ) -> Result<Workload, Error> {
        let reason = reason.to_owned();
        let message = message.to_owned();
        self.mutate_versioned(key, expected_version, move |workload| {
            workload.set_condition(Condition::new(ConditionType::Evicted, true, reason, message));
            Ok(())
        })
    }

    /// Clear a workloads admission and lower its Admitted condition
    async fn clear_admission(
        &self,
        key: &str,
        expected_version: u64,
        reason: &str,
        message: &str,
    ) -> Result<Workload, Error> {
        let reason = reason.to_owned();
        let message = message.to_owned();
        self.mutate_versioned(key, expected_version, move |workload| {
            workload.unset_admission(reason, message);
            Ok(())
        })
    }

    /// Mirror the status counters onto a cluster queues external record
    async fn update_queue_status(
        &self,
        name: &str,
        status: ClusterQueueStatus,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if !inner.cluster_queues.contains_key(name) {
            // a status flush can race a queue delete
            event!(Level::DEBUG, queue = name, msg = "Dropping status for unknown queue");
            return Ok(());
        }
        inner.statuses.insert(name.to_owned(), status);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use chrono::Utc;
    use uuid::Uuid;

    /// Build a bare workload for store tests
    fn workload(name: &str) -> Workload {
        Workload {
            namespace: "unit".into(),
            name: name.into(),
            uid: Uuid::new_v4(),
            resource_version: 0,
            created: Utc::now(),
            spec: Default::default(),
            status: Default::default(),
        }
    }

    #[tokio::test]
    async fn subscribe_replays_current_state() {
        let store = MemStore::new();
        store.upsert_flavor(ResourceFlavor::new("default"));
        store.upsert_workload(workload("replayed"));
        let mut rx = store.subscribe().await;
        // the flavor and workload should both replay as Added events
        assert!(matches!(
            rx.recv().await.unwrap(),
            StoreEvent::Flavor(WatchEvent::Added(_))
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            StoreEvent::Workload(WatchEvent::Added(_))
        ));
    }

    #[tokio::test]
    async fn stale_admissions_conflict() {
        let store = MemStore::new();
        let stored = store.upsert_workload(workload("stale"));
        // bump the version behind the schedulers back
        store.set_pods_ready(&stored.key()).unwrap();
        let denied = store
            .admit(&stored.key(), stored.resource_version, Admission::default())
            .await
            .unwrap_err();
        assert!(denied.is_conflict());
    }

    #[tokio::test]
    async fn eviction_ack_clears_admission() {
        let store = MemStore::new();
        let stored = store.upsert_workload(workload("evicted"));
        let key = stored.key();
        let admitted = store
            .admit(&key, stored.resource_version, Admission::default())
            .await
            .unwrap();
        let evicted = store
            .evict(
                &key,
                admitted.resource_version,
                crate::models::EVICTED_BY_PODS_READY_TIMEOUT,
                "Exceeded the PodsReady timeout",
            )
            .await
            .unwrap();
        // usage is still held until the ack lands
        assert!(evicted.status.admission.is_some());
        let acked = store.ack_eviction(&key).unwrap();
        assert!(acked.status.admission.is_none());
        assert!(!acked.is_admitted());
    }

    #[tokio::test]
    async fn deactivation_evicts_with_its_own_reason() {
        let store = MemStore::new();
        let stored = store.upsert_workload(workload("inactive"));
        let key = stored.key();
        store
            .admit(&key, stored.resource_version, Admission::default())
            .await
            .unwrap();
        let evicted = store.deactivate(&key).unwrap();
        let cond = evicted
            .condition(crate::models::ConditionType::Evicted)
            .unwrap();
        assert_eq!(cond.reason, crate::models::EVICTED_BY_DEACTIVATION);
        // the ack carries the deactivation reason onto the cleared admission
        let acked = store.ack_eviction(&key).unwrap();
        let admitted = acked
            .condition(crate::models::ConditionType::Admitted)
            .unwrap();
        assert_eq!(admitted.reason, crate::models::EVICTED_BY_DEACTIVATION);
    }
}
