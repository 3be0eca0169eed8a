//! HTTP API over the snapshot cache and refresh scheduler.

pub mod error;
pub mod records;
pub mod routes;
pub mod status;

pub use routes::*;
