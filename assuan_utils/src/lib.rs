//! Shared utilities for the IPC workspace.
//!
//! This crate provides the ambient pieces used by the protocol core and the
//! programs embedding it: TOML configuration and logging initialisation.

pub mod config;
pub mod logging;

// Re-export commonly used items for convenience
pub use config::{Config, ConfigError, ConfigManager, ProtocolConfig, SocketConfig};
