//! Concurrent worker fleet for monitoring Avito catalog search results.
//!
//! A [`supervisor`] spawns a fixed pool of [`worker`] processes, each of which
//! leases a task and a proxy from the [`store`], drives a headless browser
//! through catalog traversal and per-listing [`validation`], and persists the
//! outcome.

pub mod config;
pub mod store;
pub mod supervisor;
pub mod validation;
pub mod worker;

mod browser_profile;
mod browser_setup;

pub use config::AppConfig;
pub use store::Store;
