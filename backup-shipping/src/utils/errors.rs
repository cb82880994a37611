//! Error types for the shipment scheduler and backup catalog.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum ShippingError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// A backup that should be deleted is the base of another manifest.
    #[error("{key} should be deleted, but at least {dependent} is referencing it. Use cascading to delete recursively")]
    DependentBackup { key: String, dependent: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid remote: {0}")]
    InvalidRemote(String),

    #[error("No usable node: {0}")]
    NoUsableNode(String),

    #[error("Remote store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Broken internal invariant. Never recoverable.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShippingError {
    /// Whether the error aborted a request before any mutation.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ShippingError::Conflict(_) | ShippingError::DependentBackup { .. })
    }
}

pub type Result<T> = std::result::Result<T, ShippingError>;
