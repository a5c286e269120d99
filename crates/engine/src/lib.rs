//! Batch dispatch engine and notification inbox.

pub mod delivery;
pub mod dispatcher;
pub mod inbox;
pub mod pg_store;
pub mod resolver;
pub mod store;
