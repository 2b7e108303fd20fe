//! Contracts for the external collaborators: the worker core consumes
//! these; it does not implement page-state detection, CAPTCHA solving,
//! catalog traversal, or DOM parsing itself.

use async_trait::async_trait;
use chromiumoxide::Page;
use tokio::sync::{mpsc, oneshot};

use crate::store::models::{CatalogListing, DetailData};

/// What the page currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Captcha,
    ContinueButton,
    RateLimit429,
    ProxyBlock403,
    ProxyAuth407,
    CardFound,
    NotDetected,
}

/// Classifies the current page.
#[async_trait]
pub trait PageStateDetector: Send + Sync {
    async fn detect_page_state(&self, page: &Page) -> anyhow::Result<PageState>;
}

/// Attempts to resolve a challenged page. `Ok(true)` means
/// solved; `Ok(false)` means the page is still challenged.
#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    async fn resolve_captcha_flow(&self, page: &Page) -> anyhow::Result<bool>;
}

/// Extracts structured fields from one detail-page HTML.
/// `Ok(None)` signals an incomplete parse (missing `published_at`), which
/// the detail pipeline treats as a per-card failure, not a task failure.
#[async_trait]
pub trait CardParser: Send + Sync {
    async fn parse_card(&self, html: &str, item_id: i64) -> anyhow::Result<Option<DetailData>>;
}

/// The status tag on a page-request emitted by the catalog traversal
/// routine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageRequestStatus {
    ProxyBlocked,
    CaptchaUnsolved,
    ContinueButton,
    RateLimit,
    NotDetected,
}

/// One page-request from the orchestrator to the coordinator. `reply` is
/// the single-slot channel the coordinator uses to `supply` a (possibly
/// new) page back; `page` is the orchestrator's current page handle, which
/// the coordinator may navigate or replace in place.
pub struct PageRequest {
    pub status: PageRequestStatus,
    pub attempt: u32,
    pub next_start_page: u32,
    pub page: Page,
    pub reply: oneshot::Sender<Page>,
}

/// Sender half held by the traversal routine; capacity 1 makes this the
/// "request" single-slot channel paired with the reply oneshot below.
pub type PageRequestSender = mpsc::Sender<PageRequest>;
pub type PageRequestReceiver = mpsc::Receiver<PageRequest>;

pub fn page_request_channel() -> (PageRequestSender, PageRequestReceiver) {
    mpsc::channel(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorStatus {
    Success,
    Failure,
}

/// What the catalog traversal routine hands back once it has either
/// exhausted the catalog or given up.
#[derive(Debug, Clone)]
pub struct OrchestratorResult {
    pub status: OrchestratorStatus,
    pub listings: Vec<CatalogListing>,
    pub attempts_exhausted: bool,
    pub details: Option<String>,
}

/// Iterates paginated catalog results for `article`, emitting
/// page-requests over `page_requests` whenever it needs the host to fix up
/// the page (captcha, proxy block, rate limit) before it can continue.
#[async_trait]
pub trait CatalogTraversal: Send + Sync {
    async fn parse_catalog_until_complete(
        &self,
        page: Page,
        article: &str,
        page_requests: PageRequestSender,
    ) -> anyhow::Result<OrchestratorResult>;
}

/// The bundle of external collaborators a worker is wired to. Held behind
/// `Arc` so the worker's tasks can share one instance.
pub struct Collaborators {
    pub page_state: std::sync::Arc<dyn PageStateDetector>,
    pub captcha: std::sync::Arc<dyn CaptchaSolver>,
    pub traversal: std::sync::Arc<dyn CatalogTraversal>,
    pub card_parser: std::sync::Arc<dyn CardParser>,
}
