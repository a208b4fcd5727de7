//! Kindling Common - Shared types and utilities
//!
//! This crate provides configuration, the error taxonomy, and the domain
//! enums shared across all Kindling components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
