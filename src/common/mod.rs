//! Common library

pub mod error;
/// Utility module
pub mod util;

/// Log related module
pub mod logger;
