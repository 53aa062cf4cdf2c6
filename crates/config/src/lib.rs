//! Configuration for scrubline
//!
//! Handles loading configuration from TOML files and environment variable overrides.

pub mod age;
pub mod config;

pub use age::{AgeThreshold, AgeUnit, ParseAgeError};
pub use config::*;
