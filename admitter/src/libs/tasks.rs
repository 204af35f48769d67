//! Timed background actions the scheduler runs between cycles

use chrono::prelude::*;
use std::collections::BTreeMap;

use berth::Conf;

/// Actions to complete at specific times
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tasks {
    /// Mirror queue counters and usage onto the external records
    StatusFlush,
    /// Log the current usage of every cluster queue
    LogUsage,
}

impl Tasks {
    /// Setup a task queue with all tasks spread out to avoid collisions
    ///
    /// # Arguments
    ///
    /// * `conf` - The Berth config
    pub fn setup_queue(conf: &Conf) -> BTreeMap<DateTime<Utc>, Tasks> {
        let mut queue = BTreeMap::default();
        queue.insert(
            Utc::now() + chrono::Duration::seconds(Tasks::StatusFlush.delay(conf)),
            Tasks::StatusFlush,
        );
        queue.insert(
            Utc::now() + chrono::Duration::seconds(Tasks::LogUsage.delay(conf)),
            Tasks::LogUsage,
        );
        queue
    }

    /// The delay before this task runs again in seconds
    ///
    /// # Arguments
    ///
    /// * `conf` - The Berth config
    pub fn delay(&self, conf: &Conf) -> i64 {
        match self {
            Tasks::StatusFlush => conf.berth.admitter.status_flush as i64,
            Tasks::LogUsage => conf.berth.admitter.usage_log as i64,
        }
    }
}
