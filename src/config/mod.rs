//! Worker Configuration Module
//!
//! Provides the worker configuration loaded from a TOML file.
//!
//! ## Loading Order
//!
//! 1. `FABFLEET_CONFIG` environment variable (path to TOML file)
//! 2. `worker_config.toml` in the current working directory
//! 3. Built-in defaults (see [`defaults`])
//!
//! The loaded value is passed to the components that need it; there is no
//! global configuration.

mod worker_config;
pub mod defaults;

pub use worker_config::*;
