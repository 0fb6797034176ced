//! Configuration module
//!
//! Settings file loading and defaults.

pub mod config;
