//! Backup Shipping Library
//!
//! Schedules backup shipments from cluster nodes to remotes and keeps a catalog of the backups
//! stored on object-store remotes.
//!
//! An embedding controller starts with [`ShippingService::bootstrap`], which loads the config,
//! installs logging and seeds the cluster-wide shipping properties.

pub mod admission;
pub mod catalog;
pub mod chain;
pub mod config;
pub mod graph;
pub mod key;
pub mod manifest;
pub mod models;
pub mod node_finder;
pub mod notify;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod scope;
pub mod selector;
pub mod service;
pub mod store;
pub mod utils;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::Config;
pub use service::ShippingService;
pub use utils::errors::{Result, ShippingError};
