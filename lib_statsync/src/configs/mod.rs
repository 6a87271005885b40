//! # Configuration Modules
//!
//! Static configuration the synchronization engine is paired with.

/// Per-entity default metrics, built in or loaded from JSON5.
pub mod defaults_catalog;
