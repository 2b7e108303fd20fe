//! Detail enrichment pipeline: walks every card ready
//! for detail-parsing and fetches its full listing page.

use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use super::collaborators::{Collaborators, PageState};
use super::session::BrowserSession;
use crate::store::models::ParsedCard;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum DetailError {
    #[error("captcha not solved during detail enrichment")]
    CaptchaNotSolved,
    #[error("proxy blocked during detail enrichment")]
    ProxyBlocked,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DetailReport {
    pub enriched: u32,
    pub errors: u32,
}

/// Runs the step-by-step pipeline over every card
/// `GetCardsForDetailedParsing` returns for `article`. Per-card failures
/// are counted, not fatal; only captcha/proxy-block propagate.
pub async fn enrich_article(
    store: &Store,
    session: &BrowserSession,
    collaborators: &Collaborators,
    article: &str,
    nav_timeout: Duration,
) -> Result<DetailReport, DetailError> {
    let cards = store.get_cards_for_detailed_parsing(article).await?;
    let mut report = DetailReport::default();

    for card in cards {
        match enrich_one(store, session, collaborators, &card, nav_timeout).await {
            Ok(true) => report.enriched += 1,
            Ok(false) => report.errors += 1,
            Err(err @ (DetailError::CaptchaNotSolved | DetailError::ProxyBlocked)) => return Err(err),
            Err(DetailError::Store(err)) => return Err(DetailError::Store(err)),
        }
    }

    Ok(report)
}

/// `Ok(true)` on a successful enrichment, `Ok(false)` on a per-card
/// failure that should just be counted, `Err` only for the fatal kinds.
async fn enrich_one(
    store: &Store,
    session: &BrowserSession,
    collaborators: &Collaborators,
    card: &ParsedCard,
    nav_timeout: Duration,
) -> Result<bool, DetailError> {
    let url = format!("https://www.avito.ru/{}", card.avito_item_id);
    if session.navigate(&url, nav_timeout).await.is_err() {
        warn!(avito_item_id = card.avito_item_id, "detail navigation failed or timed out");
        return Ok(false);
    }

    let state = match collaborators.page_state.detect_page_state(&session.page).await {
        Ok(state) => state,
        Err(err) => {
            warn!(avito_item_id = card.avito_item_id, error = %err, "page-state detection failed");
            return Ok(false);
        }
    };

    match state {
        PageState::Captcha => {
            let solved = collaborators
                .captcha
                .resolve_captcha_flow(&session.page)
                .await
                .map_err(|_| DetailError::CaptchaNotSolved)?;
            if !solved {
                return Err(DetailError::CaptchaNotSolved);
            }
            Ok(false)
        }
        PageState::ProxyBlock403 | PageState::ProxyAuth407 => Err(DetailError::ProxyBlocked),
        PageState::NotDetected => {
            store.mark_card_deleted(card.avito_item_id).await?;
            Ok(true)
        }
        PageState::CardFound => {
            let html = match session.html().await {
                Ok(html) => html,
                Err(err) => {
                    warn!(avito_item_id = card.avito_item_id, error = %err, "failed to read detail HTML");
                    return Ok(false);
                }
            };
            let detail = match collaborators.card_parser.parse_card(&html, card.avito_item_id).await {
                Ok(Some(detail)) if detail.published_at.is_some() => detail,
                Ok(_) => {
                    warn!(avito_item_id = card.avito_item_id, "card parse incomplete, missing published_at");
                    return Ok(false);
                }
                Err(err) => {
                    warn!(avito_item_id = card.avito_item_id, error = %err, "card parsing failed");
                    return Ok(false);
                }
            };
            store.update_card_detailed_data(&detail).await?;
            Ok(true)
        }
        PageState::ContinueButton | PageState::RateLimit429 => {
            warn!(avito_item_id = card.avito_item_id, ?state, "unexpected page state during detail enrichment");
            Ok(false)
        }
    }
}
