//! Kindling Storage - PostgreSQL persistence for the warmup engine
//!
//! Accounts, conversations, messages, templates, health snapshots, jobs and
//! audit events. Every repository is a trait so the engine can run against
//! the in-memory store in tests.

pub mod db;
#[cfg(feature = "memory")]
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use models::*;
pub use repository::*;
