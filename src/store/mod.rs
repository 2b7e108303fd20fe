//! The relational store and its task/proxy leasing layer.
//!
//! Table names (`tasks`, `proxies`, `parsed_cards`, `validation_results`,
//! `processed_articles`) and their schemas are assumed to already exist;
//! schema creation is explicitly out of scope.

pub mod cards;
pub mod models;
pub mod proxies;
pub mod retry;
pub mod tasks;

use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("programming error: {0}")]
    Programming(String),
}

/// Owns the connection pool and implements every leasing-layer contract
/// as an inherent method.
#[derive(Clone)]
pub struct Store {
    pool: PgPool,
}

impl Store {
    /// Connect with the same backoff policy leasing operations use: the
    /// pool itself is just another thing that can transiently fail to reach
    /// the network.
    pub async fn connect(database_url: &str, min: u32, max: u32) -> Result<Self, StoreError> {
        let mut delay = Duration::from_secs(2);
        let mut attempt = 0u32;
        loop {
            let result = PgPoolOptions::new()
                .min_connections(min)
                .max_connections(max)
                .connect(database_url)
                .await;
            match result {
                Ok(pool) => {
                    info!("connected to store (min={min}, max={max})");
                    return Ok(Self { pool });
                }
                Err(err) if retry::is_transient(&err) && attempt + 1 < 3 => {
                    attempt += 1;
                    warn!("store connect attempt {attempt}/3 failed: {err}; retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
