//! Tamarind Common - Shared types, traits, and utilities
//!
//! This crate provides the foundational types used across all Tamarind components:
//! - Error types and wire error codes
//! - Node and session model
//! - Ensemble client traits
//! - Path and endpoint utilities

pub mod error;
pub mod model;
pub mod traits;
pub mod utils;

// Re-exports for convenience
pub use error::{ErrorCode, KeeperError};
pub use model::*;
pub use traits::*;
pub use utils::{
    Endpoint, escape_segment, join_path, parent_path, parse_endpoints, resource_path,
    validate_path,
};

/// Default root under which lock nodes are created
pub const DEFAULT_LOCK_ROOT: &str = "/locks";

/// Default session timeout requested from the ensemble (milliseconds)
pub const DEFAULT_SESSION_TIMEOUT_MS: u64 = 50_000;

/// Default pause between lock attempts under contention (milliseconds)
pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 20;
