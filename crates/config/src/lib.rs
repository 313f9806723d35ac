//! Configuration module for the stream capture daemon
//!
//! Handles loading configuration from TOML files, environment variable overrides and validation.

pub mod config;

pub use config::*;
