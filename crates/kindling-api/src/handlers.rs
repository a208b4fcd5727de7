//! API request handlers

pub mod accounts;
pub mod directory;
pub mod health;
pub mod stats;
