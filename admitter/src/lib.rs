//! The admission scheduler for Berth

mod args;
mod libs;

pub use args::Args;
pub use libs::{Admitter, Cache, Monitor, QueueManager};
pub use libs::{assigner, cache, monitor, preempt, queues, scheduler};
