//! Utility modules for the shipping controller.

pub mod errors;
pub mod logger;

pub use errors::{Result, ShippingError};
