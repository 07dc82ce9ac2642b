//! Tamarind Ensemble - In-memory coordination ensemble
//!
//! This crate provides:
//! - A hierarchical node tree with ephemeral and sequential nodes
//! - Sessions with negotiated timeouts and expiry
//! - `Connector`/`Coordinator` implementations for tests and `--memory` runs
//! - Fault injection (forced expiry, ensemble unavailability)

pub mod client;
pub mod ensemble;
pub mod tree;

pub use client::{MemoryClient, MemoryConnector};
pub use ensemble::{EnsembleOptions, EnsembleStats, MemoryEnsemble};
pub use tree::{DataNode, DataTree};
