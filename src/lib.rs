//! Market data refresh-and-cache service.
//!
//! A background scheduler pulls instrument data for several market segments
//! concurrently, substitutes deterministic synthetic records for segments
//! whose upstream fails, publishes the merged result as an immutable
//! [`market::Snapshot`], and persists it in bulk. Reads go through
//! [`query::QueryService`] against the current snapshot and never wait on a
//! refresh.

pub mod app;
pub mod cache;
pub mod cli;
pub mod config;
pub mod data;
pub mod logging;
pub mod market;
pub mod query;
pub mod refresh;
pub mod source;
pub mod state;
pub mod utils;
pub mod web;
