//! HTTP API for user notifications and admin global broadcasts.

pub mod middleware;
pub mod routes;
pub mod state;
