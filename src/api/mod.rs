//! HTTP API
//! Mission: The thin façade over registry, hub, engine and repository

pub mod routes;

pub use routes::{router, AppState};
