//! HTTP surface over the ledger engine

pub mod routes;

pub use routes::{create_router, ApiError, AppState};
