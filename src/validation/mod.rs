//! Two-stage validation pipeline: mechanical validation
//! runs first and unconditionally; LLM validation runs only over mechanical
//! passers and only when an API key is configured.

pub mod llm;
pub mod mechanical;

use crate::store::models::{CatalogListing, ValidationType};
use crate::store::{Store, StoreError};
use llm::{AiResult, LlmError, LlmValidator};
use mechanical::{validate_mechanical, MechanicalResult};

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Final per-listing outcome after both stages have had a chance to run.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub avito_item_id: i64,
    pub passed: bool,
}

/// Runs mechanical validation over `listings`, persists one row per result,
/// then (only for passers, only if `llm` is `Some`) runs LLM validation and
/// persists those results too. Returns the final pass/fail per listing.
pub async fn validate_batch(
    store: &Store,
    listings: &[CatalogListing],
    stopwords: &[String],
    article: &str,
    llm: Option<&LlmValidator>,
) -> Result<Vec<Outcome>, ValidationError> {
    let mechanical_results = validate_mechanical(listings, stopwords);
    for result in &mechanical_results {
        persist_mechanical(store, result).await?;
    }

    let passed_listings: Vec<CatalogListing> = mechanical_results
        .iter()
        .filter(|r| r.passed)
        .filter_map(|r| listings.iter().find(|l| l.avito_item_id == r.avito_item_id).cloned())
        .collect();

    let ai_results = match llm {
        Some(validator) if !passed_listings.is_empty() => {
            validator.validate(&passed_listings, article).await?
        }
        _ => Default::default(),
    };
    for (avito_item_id, result) in &ai_results {
        persist_ai(store, *avito_item_id, result).await?;
    }

    Ok(mechanical_results
        .into_iter()
        .map(|m| {
            let passed = m.passed
                && ai_results
                    .get(&m.avito_item_id)
                    .map(|ai| ai.passed)
                    .unwrap_or(true);
            Outcome { avito_item_id: m.avito_item_id, passed }
        })
        .collect())
}

async fn persist_mechanical(store: &Store, result: &MechanicalResult) -> Result<(), StoreError> {
    let details = serde_json::json!({
        "stage": "mechanical",
        "decision": if result.passed { "passed" } else { "rejected" },
    });
    store
        .save_validation_result(
            result.avito_item_id,
            ValidationType::Mechanical,
            result.passed,
            result.rejection_reason,
            &details,
        )
        .await
}

async fn persist_ai(store: &Store, avito_item_id: i64, result: &AiResult) -> Result<(), StoreError> {
    store
        .save_validation_result(
            avito_item_id,
            ValidationType::Ai,
            result.passed,
            result.rejection_reason.as_deref(),
            &result.validation_details,
        )
        .await
}
