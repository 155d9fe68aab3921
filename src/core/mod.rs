//! # Core Module
//!
//! Shared configuration for the relay library and binary.
//!
//! - **Version**: 1.0.0
//! - **Since**: 0.1.0

pub mod config;

pub use config::{Config, TrackerConfig};
