//! Kindling API - HTTP surface
//!
//! Enrollment, account lifecycle and read-only stats over the warmup engine.

pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
