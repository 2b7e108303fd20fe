//! Row types for the five persisted tables.
//!
//! Status columns are plain `TEXT` in the underlying schema (schema DDL
//! itself is out of scope for this crate) rather than native Postgres enum
//! types, so every status enum round-trips through `&str` via
//! [`sqlx::Type`]'s `rename_all` string mapping instead of a `CREATE TYPE`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum TaskStatus {
    New,
    InProgress,
    Done,
    Error,
}

#[derive(Debug, Clone, FromRow)]
pub struct Task {
    pub id: i64,
    pub article: String,
    pub status: TaskStatus,
    pub worker_id: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ProxyStatus {
    Free,
    InUse,
    Blocked,
}

#[derive(Debug, Clone, FromRow)]
pub struct Proxy {
    pub id: i64,
    pub address: String,
    pub status: ProxyStatus,
    pub worker_id: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub blocked_at: Option<DateTime<Utc>>,
    pub blocked_reason: Option<String>,
}

impl Proxy {
    /// Split a `"host:port:user:pass"` address into its authenticated parts.
    pub fn parse_address(address: &str) -> Option<ProxyAuth> {
        let parts: Vec<&str> = address.split(':').collect();
        if parts.len() != 4 {
            return None;
        }
        let port = parts[1].parse().ok()?;
        Some(ProxyAuth {
            host: parts[0].to_string(),
            port,
            username: parts[2].to_string(),
            password: parts[3].to_string(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProxyAuth {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ParsedCard {
    pub avito_item_id: i64,
    pub article: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub price: Option<i64>,
    pub seller_name: Option<String>,
    pub parsed_data: Option<serde_json::Value>,
    pub published_at: Option<DateTime<Utc>>,
    pub location: Option<String>,
    pub views_count: Option<i64>,
    pub characteristics: Option<serde_json::Value>,
    pub parsed_at: DateTime<Utc>,
}

/// A listing as seen in the catalog, before it becomes a persisted
/// [`ParsedCard`]. This is the shape the external catalog-traversal
/// collaborator (F) hands back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogListing {
    pub avito_item_id: i64,
    pub title: String,
    pub description: String,
    pub price: i64,
    pub seller: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ValidationType {
    Mechanical,
    Ai,
}

#[derive(Debug, Clone, FromRow)]
pub struct ValidationResult {
    pub avito_item_id: i64,
    pub validation_type: ValidationType,
    pub passed: bool,
    pub rejection_reason: Option<String>,
    pub validation_details: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type, Serialize, Deserialize)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum ProcessingStatus {
    Success,
    Error,
    NoResults,
}

#[derive(Debug, Clone, FromRow)]
pub struct ProcessedArticle {
    pub article: String,
    pub processed_at: DateTime<Utc>,
    pub processing_status: ProcessingStatus,
    pub items_found: i32,
    pub items_passed: i32,
    pub started_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
}

/// Detail fields fetched from a single listing page (output of collaborator G).
#[derive(Debug, Clone)]
pub struct DetailData {
    pub title: Option<String>,
    pub price: Option<i64>,
    pub seller: Option<String>,
    pub item_id: i64,
    pub published_at: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub characteristics: Option<serde_json::Value>,
    pub views_total: Option<i64>,
}
