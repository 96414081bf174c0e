//! # shardlink-core
//!
//! Core types, configuration, and utilities for shardlink.
//!
//! This crate provides shared functionality used across all shardlink crates:
//!
//! - **Configuration**: Loading, validation, and management of config files
//! - **Types**: The wire envelope, typed payloads, and shard/guild identifiers
//! - **Utilities**: Path resolution, routing-key generation, and environment handling

pub mod config;
pub mod env;
pub mod error;
pub mod id;
pub mod paths;
pub mod secret;
pub mod types;

// Re-exports for convenience
pub use config::Config;
pub use error::{Error, Result};
pub use secret::SecretString;
pub use types::*;
