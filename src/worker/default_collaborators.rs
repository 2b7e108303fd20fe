//! Inert stand-ins for the external collaborators: the page-state
//! detector, CAPTCHA solver, catalog traversal routine, and DOM parser are
//! all explicitly out of scope here.
//!
//! These exist only so the binary links and the worker loop is exercisable
//! end-to-end in absence of a real integration; a production deployment
//! wires its actual page-state detector, CAPTCHA solver, catalog
//! traversal, and card parser in their place via [`super::collaborators::Collaborators`].

use async_trait::async_trait;
use chromiumoxide::Page;

use super::collaborators::{
    CaptchaSolver, CardParser, CatalogTraversal, OrchestratorResult, OrchestratorStatus, PageRequestSender,
    PageState, PageStateDetector,
};
use crate::store::models::DetailData;

/// Always reports `NotDetected`; a real detector inspects DOM/response
/// status to classify captcha, rate-limit, and proxy-block pages.
pub struct NoopPageStateDetector;

#[async_trait]
impl PageStateDetector for NoopPageStateDetector {
    async fn detect_page_state(&self, _page: &Page) -> anyhow::Result<PageState> {
        Ok(PageState::NotDetected)
    }
}

/// Never solves anything; present so the worker loop can run without a
/// real solver wired in.
pub struct UnsolvableCaptchaSolver;

#[async_trait]
impl CaptchaSolver for UnsolvableCaptchaSolver {
    async fn resolve_captcha_flow(&self, _page: &Page) -> anyhow::Result<bool> {
        Ok(false)
    }
}

/// Returns an empty catalog immediately without ever emitting a
/// page-request; a real traversal drives pagination via `page_requests`.
pub struct EmptyCatalogTraversal;

#[async_trait]
impl CatalogTraversal for EmptyCatalogTraversal {
    async fn parse_catalog_until_complete(
        &self,
        _page: Page,
        _article: &str,
        _page_requests: PageRequestSender,
    ) -> anyhow::Result<OrchestratorResult> {
        Ok(OrchestratorResult {
            status: OrchestratorStatus::Success,
            listings: Vec::new(),
            attempts_exhausted: false,
            details: None,
        })
    }
}

/// Always reports an incomplete parse; a real parser extracts the detail
/// fields from the listing page's HTML.
pub struct NoopCardParser;

#[async_trait]
impl CardParser for NoopCardParser {
    async fn parse_card(&self, _html: &str, _item_id: i64) -> anyhow::Result<Option<DetailData>> {
        Ok(None)
    }
}
