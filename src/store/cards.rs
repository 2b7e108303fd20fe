//! Card and validation-result persistence:
//! `SaveParsedCard`, `CheckExistingCards`, `SaveValidationResult`,
//! `GetCardsForAIValidation`, `GetCardsForDetailedParsing`,
//! `UpdateCardDetailedData`.

use std::collections::HashSet;

use super::models::{CatalogListing, DetailData, ParsedCard, ValidationType};
use super::retry::with_retry;
use super::tasks::deleted_listing_timestamp;
use super::{Store, StoreError};

impl Store {
    /// Inserted on first catalog observation; on re-observation only the
    /// `article` tag inside `parsed_data` is refreshed on conflict.
    pub async fn save_parsed_card(
        &self,
        article: &str,
        listing: &CatalogListing,
    ) -> Result<(), StoreError> {
        with_retry("save_parsed_card", || async {
            sqlx::query(
                "INSERT INTO parsed_cards \
                 (avito_item_id, article, title, description, price, seller_name, parsed_data, parsed_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, jsonb_build_object('article', $2::text), now()) \
                 ON CONFLICT (avito_item_id) DO UPDATE SET \
                    parsed_data = jsonb_set( \
                        coalesce(parsed_cards.parsed_data, '{}'::jsonb), '{article}', to_jsonb($2::text)), \
                    parsed_at = now()",
            )
            .bind(listing.avito_item_id)
            .bind(article)
            .bind(&listing.title)
            .bind(&listing.description)
            .bind(listing.price)
            .bind(&listing.seller)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Batch membership check used to avoid re-validating cards already
    /// seen, chunked to stay under Postgres's bind-parameter limit.
    pub async fn check_existing_cards(
        &self,
        ids: &[i64],
    ) -> Result<HashSet<i64>, StoreError> {
        if ids.is_empty() {
            return Ok(HashSet::new());
        }
        let mut existing = HashSet::new();
        for chunk in ids.chunks(500) {
            let rows: Vec<(i64,)> = with_retry("check_existing_cards", || async {
                sqlx::query_as("SELECT avito_item_id FROM parsed_cards WHERE avito_item_id = ANY($1)")
                    .bind(chunk)
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;
            existing.extend(rows.into_iter().map(|(id,)| id));
        }
        Ok(existing)
    }

    pub async fn save_validation_result(
        &self,
        avito_item_id: i64,
        validation_type: ValidationType,
        passed: bool,
        rejection_reason: Option<&str>,
        validation_details: &serde_json::Value,
    ) -> Result<(), StoreError> {
        with_retry("save_validation_result", || async {
            sqlx::query(
                "INSERT INTO validation_results \
                 (avito_item_id, validation_type, passed, rejection_reason, validation_details, created_at) \
                 VALUES ($1, $2, $3, $4, $5, now())",
            )
            .bind(avito_item_id)
            .bind(validation_type)
            .bind(passed)
            .bind(rejection_reason)
            .bind(validation_details)
            .execute(&self.pool)
            .await
        })
        .await?;
        Ok(())
    }

    /// Cards from `article` whose most recent MECHANICAL result passed and
    /// that have no AI result yet.
    pub async fn get_cards_for_ai_validation(
        &self,
        article: &str,
    ) -> Result<Vec<ParsedCard>, StoreError> {
        let cards = with_retry("get_cards_for_ai_validation", || async {
            sqlx::query_as::<_, ParsedCard>(
                "SELECT c.* FROM parsed_cards c \
                 WHERE c.article = $1 \
                 AND EXISTS ( \
                    SELECT 1 FROM validation_results m \
                    WHERE m.avito_item_id = c.avito_item_id AND m.validation_type = 'MECHANICAL' AND m.passed \
                    ORDER BY m.created_at DESC LIMIT 1 \
                 ) \
                 AND NOT EXISTS ( \
                    SELECT 1 FROM validation_results a \
                    WHERE a.avito_item_id = c.avito_item_id AND a.validation_type = 'AI' \
                 )",
            )
            .bind(article)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(cards)
    }

    /// Cards where mechanical and AI both passed and `published_at` is
    /// still unset — these are the enrichment queue.
    pub async fn get_cards_for_detailed_parsing(
        &self,
        article: &str,
    ) -> Result<Vec<ParsedCard>, StoreError> {
        let cards = with_retry("get_cards_for_detailed_parsing", || async {
            sqlx::query_as::<_, ParsedCard>(
                "SELECT c.* FROM parsed_cards c \
                 WHERE c.article = $1 AND c.published_at IS NULL \
                 AND EXISTS ( \
                    SELECT 1 FROM validation_results m \
                    WHERE m.avito_item_id = c.avito_item_id AND m.validation_type = 'MECHANICAL' AND m.passed \
                 ) \
                 AND EXISTS ( \
                    SELECT 1 FROM validation_results a \
                    WHERE a.avito_item_id = c.avito_item_id AND a.validation_type = 'AI' AND a.passed \
                 )",
            )
            .bind(article)
            .fetch_all(&self.pool)
            .await
        })
        .await?;
        Ok(cards)
    }

    /// Merges `detail` into the card's `parsed_data` JSON and the dedicated
    /// columns. A zero-row update means the card vanished underneath us,
    /// which would be a programming error.
    pub async fn update_card_detailed_data(
        &self,
        detail: &DetailData,
    ) -> Result<(), StoreError> {
        let detail_json = serde_json::json!({
            "title": detail.title,
            "price": detail.price,
            "seller": detail.seller,
            "published_at": detail.published_at,
            "description": detail.description,
            "location": detail.location,
            "characteristics": detail.characteristics,
            "views_total": detail.views_total,
        });

        let rows_affected = with_retry("update_card_detailed_data", || async {
            sqlx::query(
                "UPDATE parsed_cards SET \
                    parsed_data = coalesce(parsed_data, '{}'::jsonb) || $2, \
                    title = coalesce($3, title), \
                    description = coalesce($4, description), \
                    price = coalesce($5, price), \
                    seller_name = coalesce($6, seller_name), \
                    published_at = $7, \
                    location = coalesce($8, location), \
                    views_count = coalesce($9, views_count), \
                    characteristics = coalesce($10, characteristics) \
                 WHERE avito_item_id = $1",
            )
            .bind(detail.item_id)
            .bind(&detail_json)
            .bind(&detail.title)
            .bind(&detail.description)
            .bind(detail.price)
            .bind(&detail.seller)
            .bind(detail.published_at)
            .bind(&detail.location)
            .bind(detail.views_total)
            .bind(&detail.characteristics)
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await?;

        if rows_affected == 0 {
            return Err(StoreError::Programming(format!(
                "update_card_detailed_data: no row for avito_item_id={}",
                detail.item_id
            )));
        }
        Ok(())
    }

    /// Persists the sentinel timestamp for a listing the detector
    /// reports as deleted, so it is never re-attempted.
    pub async fn mark_card_deleted(&self, avito_item_id: i64) -> Result<(), StoreError> {
        let rows_affected = with_retry("mark_card_deleted", || async {
            sqlx::query(
                "UPDATE parsed_cards SET published_at = $2, location = 'DELETED', \
                 views_count = 0, characteristics = '{}'::jsonb WHERE avito_item_id = $1",
            )
            .bind(avito_item_id)
            .bind(deleted_listing_timestamp())
            .execute(&self.pool)
            .await
            .map(|r| r.rows_affected())
        })
        .await?;

        if rows_affected == 0 {
            return Err(StoreError::Programming(format!(
                "mark_card_deleted: no row for avito_item_id={avito_item_id}"
            )));
        }
        Ok(())
    }
}
