//! The abstract store Berth reads cluster state from and writes decisions to
//!
//! The store presents watch streams for every entity kind plus the small set
//! of update operations the admission pipeline needs. Updates to workloads
//! use optimistic concurrency so a scheduler working from a stale snapshot
//! cannot clobber an external change.

use tokio::sync::mpsc;

use crate::models::{
    Admission, ClusterQueue, ClusterQueueStatus, LocalQueue, ResourceFlavor, Workload,
};
use crate::Error;

mod mem;

pub use mem::MemStore;

/// A single change to an object of one entity kind
#[derive(Debug, Clone)]
pub enum WatchEvent<T> {
    /// This object was created or replayed on subscription
    Added(T),
    /// This object was updated
    Modified(T),
    /// This object was deleted
    Deleted(T),
}

/// A change to any entity kind the admission pipeline consumes
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A change to a workload
    Workload(WatchEvent<Workload>),
    /// A change to a cluster queue
    ClusterQueue(WatchEvent<ClusterQueue>),
    /// A change to a resource flavor
    Flavor(WatchEvent<ResourceFlavor>),
    /// A change to a local queue
    LocalQueue(WatchEvent<LocalQueue>),
}

/// The operations Berth requires from an external store
#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Subscribe to changes for all entity kinds
    ///
    /// The current state is replayed as Added events before any subsequent
    /// changes are streamed so a restarted service can rebuild its cache.
    async fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent>;

    /// Get a workload by its namespace/name key
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to get
    async fn get_workload(&self, key: &str) -> Result<Workload, Error>;

    /// Apply an admission to a workload and raise its Admitted condition
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to admit
    /// * `expected_version` - The resource version the caller observed
    /// * `admission` - The admission to apply
    async fn admit(
        &self,
        key: &str,
        expected_version: u64,
        admission: Admission,
    ) -> Result<Workload, Error>;

    /// Raise the Evicted condition on a workload
    ///
    /// Usage stays held until the external job controller acknowledges the
    /// eviction by clearing the admission.
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to evict
    /// * `expected_version` - The resource version the caller observed
    /// * `reason` - The machine readable eviction reason
    /// * `message` - The human readable eviction message
    async fn evict(
        &self,
        key: &str,
        expected_version: u64,
        reason: &str,
        message: &str,
    ) -> Result<Workload, Error>;

    /// Clear a workloads admission and lower its Admitted condition
    ///
    /// # Arguments
    ///
    /// * `key` - The key of the workload to clear
    /// * `expected_version` - The resource version the caller observed
    /// * `reason` - The machine readable reason admission was cleared
    /// * `message` - The human readable message to attach
    async fn clear_admission(
        &self,
        key: &str,
        expected_version: u64,
        reason: &str,
        message: &str,
    ) -> Result<Workload, Error>;

    /// Mirror the status counters onto a cluster queues external record
    ///
    /// # Arguments
    ///
    /// * `name` - The cluster queue to update
    /// * `status` - The counters to mirror
    async fn update_queue_status(
        &self,
        name: &str,
        status: ClusterQueueStatus,
    ) -> Result<(), Error>;
}
