//! Shared handler state

use kindling_core::Engine;
use kindling_storage::DatabasePool;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Engine,
    /// Absent when the engine runs on in-memory repositories
    pub db_pool: Option<DatabasePool>,
}

impl AppState {
    pub fn new(engine: Engine, db_pool: Option<DatabasePool>) -> Self {
        Self { engine, db_pool }
    }
}
