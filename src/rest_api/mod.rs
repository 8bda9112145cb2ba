//! Operator HTTP endpoints
//!
//! Liveness, leader-aware readiness and the Prometheus scrape endpoint.

mod handlers;
mod server;

pub use handlers::ProbeState;
pub use server::{router, run_server};
