//! The Berth data model, store abstraction, and shared utilities
//!
//! Berth admits batch workloads into hierarchically shared quota queues. This
//! crate carries the objects shared by all Berth services along with the
//! abstract store they are read from and written to.

#[macro_use]
extern crate serde_derive;

pub mod conf;
mod errors;
pub mod models;
pub mod store;
pub mod utils;

// expose test utilities if that feature is enabled
#[cfg(feature = "test-utilities")]
pub mod test_utilities;

pub use conf::Conf;
pub use errors::Error;
