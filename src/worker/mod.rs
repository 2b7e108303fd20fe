//! The per-task worker state machine: one
//! process, hosting one browser session, looping over leased tasks until
//! shutdown is signalled.

pub mod collaborators;
pub mod coordinator;
pub mod default_collaborators;
pub mod detail;
pub mod heartbeat;
pub mod session;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Mutex, Notify};
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::store::models::{ProcessingStatus, Task};
use crate::store::{Store, StoreError};
use crate::validation::{self, llm::LlmValidator};
use collaborators::{page_request_channel, Collaborators, OrchestratorStatus};
use coordinator::CoordinatorError;
use heartbeat::Heartbeat;
use session::BrowserSession;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Explicit home for the mutable state the reference implementation keeps
/// in process globals: the current task/proxy/browser
/// triple, plus the shutdown flag workers observe between iterations.
pub struct Worker {
    pub id: String,
    config: AppConfig,
    store: Arc<Store>,
    collaborators: Collaborators,
    llm: Option<LlmValidator>,
    stopwords: Vec<String>,
    session: Arc<Mutex<Option<BrowserSession>>>,
    shutdown: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl Worker {
    pub fn new(
        id: String,
        config: AppConfig,
        store: Arc<Store>,
        collaborators: Collaborators,
        stopwords: Vec<String>,
        shutdown: Arc<AtomicBool>,
        shutdown_notify: Arc<Notify>,
    ) -> Self {
        let llm = config.gemini_api_key.clone().map(LlmValidator::new);
        Self {
            id,
            config,
            store,
            collaborators,
            llm,
            stopwords,
            session: Arc::new(Mutex::new(None)),
            shutdown,
            shutdown_notify,
        }
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    async fn current_proxy_id(&self) -> Option<i64> {
        self.session.lock().await.as_ref().map(|s| s.proxy_id)
    }

    /// Runs the IDLE-to-IDLE loop until the shutdown flag is observed.
    pub async fn run(&self) {
        self.store
            .return_stuck_tasks(self.config.stuck_task_timeout, self.config.max_retry_attempts as i32)
            .await
            .map(|report| {
                info!(
                    worker_id = %self.id,
                    returned_to_queue = report.returned_to_queue,
                    marked_error = report.marked_error,
                    "startup stuck-task sweep complete"
                )
            })
            .unwrap_or_else(|err| warn!(worker_id = %self.id, error = %err, "stuck-task sweep failed"));

        while !self.is_shutting_down() {
            if let Err(err) = self.run_one_task().await {
                error!(worker_id = %self.id, error = %err, "unhandled error in worker loop, backing off");
                self.teardown_session().await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        }
        self.teardown_session().await;
        info!(worker_id = %self.id, "worker exiting cleanly");
    }

    async fn teardown_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.teardown().await;
        }
    }

    async fn run_one_task(&self) -> Result<(), WorkerError> {
        // IDLE
        let Some(task) = self.store.lease_next_task(&self.id).await? else {
            tokio::time::sleep(self.config.no_tasks_wait).await;
            return Ok(());
        };
        info!(worker_id = %self.id, task_id = task.id, article = %task.article, "leased task");

        // HAVE_TASK / HAVE_PROXY: a hot session from the previous iteration
        // is reused as-is (keeping its already-authenticated proxy); only a
        // cold worker leases a fresh proxy and launches a browser for it.
        let proxy_id = match self.current_proxy_id().await {
            Some(proxy_id) => proxy_id,
            None => {
                let Some(proxy) = self.store.lease_free_proxy(&self.id).await? else {
                    self.store.return_task_to_queue(task.id, "no free proxy", false).await?;
                    tokio::time::sleep(self.config.no_proxies_wait).await;
                    return Ok(());
                };
                match BrowserSession::launch(&proxy, self.config.display.is_none()).await {
                    Ok(session) => *self.session.lock().await = Some(session),
                    Err(err) => {
                        warn!(worker_id = %self.id, task_id = task.id, error = %err, "browser launch failed");
                        self.store.block_proxy(proxy.id, "launch error").await?;
                        self.store.return_task_to_queue(task.id, "browser launch failed", true).await?;
                        return Ok(());
                    }
                }
                proxy.id
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown_notify.notified() => {
                warn!(worker_id = %self.id, task_id = task.id, "shutdown signalled mid-task, releasing proxy and returning task");
                let live_proxy_id = self.current_proxy_id().await.unwrap_or(proxy_id);
                self.store.return_task_to_queue(task.id, "worker shutting down", false).await.ok();
                self.store.release_proxy(live_proxy_id).await.ok();
                Ok(())
            }
            result = self.run_task_body(&task, proxy_id) => result,
        }
    }

    async fn run_task_body(&self, task: &Task, proxy_id: i64) -> Result<(), WorkerError> {
        // CATALOG_ENTRY
        let catalog_url = format!("https://www.avito.ru/rossiya?q={}&s=104", task.article);
        if let Err(failure) = self.enter_catalog(&task.article, &catalog_url, proxy_id).await? {
            self.teardown_session().await;
            self.store
                .return_task_to_queue(task.id, &failure.reason, failure.increment_retry)
                .await?;
            return Ok(());
        }

        // RUNNING
        let heartbeat = Heartbeat::spawn(self.store.clone(), task.id, self.config.heartbeat_interval);
        let gather_result = self.run_gather(&task.article).await;
        heartbeat.stop().await;

        let listings = match gather_result {
            Ok(result) if result.status == OrchestratorStatus::Success && !result.attempts_exhausted => {
                result.listings
            }
            Ok(result) => {
                let live_proxy_id = self.current_proxy_id().await.unwrap_or(proxy_id);
                self.teardown_session().await;
                self.store.release_proxy(live_proxy_id).await.ok();
                return self.recover_task(task.id, task.retry_count, "catalog traversal did not succeed", result.details).await;
            }
            Err(err) => {
                let live_proxy_id = self.current_proxy_id().await.unwrap_or(proxy_id);
                self.teardown_session().await;
                self.store.release_proxy(live_proxy_id).await.ok();
                return self.recover_task(task.id, task.retry_count, "catalog traversal failed", Some(err.to_string())).await;
            }
        };

        for listing in &listings {
            self.store.save_parsed_card(&task.article, listing).await?;
        }

        // VALIDATING
        let outcomes = validation::validate_batch(
            &self.store,
            &listings,
            &self.stopwords,
            &task.article,
            self.llm.as_ref(),
        )
        .await
        .map_err(|err| anyhow::anyhow!(err))?;
        let items_passed = outcomes.iter().filter(|o| o.passed).count() as i32;

        // ENRICHING
        {
            let session_guard = self.session.lock().await;
            if let Some(session) = session_guard.as_ref() {
                match detail::enrich_article(
                    &self.store,
                    session,
                    &self.collaborators,
                    &task.article,
                    self.config.detail_nav_timeout,
                )
                .await
                {
                    Ok(report) => info!(
                        worker_id = %self.id, task_id = task.id,
                        enriched = report.enriched, errors = report.errors,
                        "detail enrichment complete"
                    ),
                    Err(detail::DetailError::Store(err)) => return Err(err.into()),
                    Err(err) => {
                        drop(session_guard);
                        let live_proxy_id = self.current_proxy_id().await.unwrap_or(proxy_id);
                        self.teardown_session().await;
                        self.store.release_proxy(live_proxy_id).await.ok();
                        return self
                            .recover_task(task.id, task.retry_count, &err.to_string(), None)
                            .await;
                    }
                }
            }
        }

        // FINALIZING
        let processing_status =
            if listings.is_empty() { ProcessingStatus::NoResults } else { ProcessingStatus::Success };
        self.store
            .complete_task(task.id, &task.article, &self.id, processing_status, listings.len() as i32, items_passed)
            .await?;
        info!(worker_id = %self.id, task_id = task.id, items_found = listings.len(), items_passed, "task complete");
        Ok(())
    }

    /// Navigates to the catalog entry URL and resolves captcha/proxy-block
    /// states, rotating proxies up to `CatalogProxyRotationLimit`. Returns
    /// `Ok(Err(reason))` for a recoverable failure the caller should
    /// return the task for, never panics or propagates a `WorkerError` for
    /// the expected anti-bot states.
    async fn enter_catalog(
        &self,
        article: &str,
        catalog_url: &str,
        initial_proxy_id: i64,
    ) -> Result<Result<(), CatalogEntryFailure>, WorkerError> {
        let mut current_proxy_id = initial_proxy_id;
        for attempt in 0..self.config.catalog_proxy_rotation_limit {
            {
                let guard = self.session.lock().await;
                let Some(session) = guard.as_ref() else {
                    return Ok(Err(CatalogEntryFailure::retryable("no browser session")));
                };
                if session.navigate(catalog_url, self.config.page_request_timeout).await.is_err() {
                    drop(guard);
                    self.store.block_proxy(current_proxy_id, "navigation failure").await?;
                    return Ok(Err(CatalogEntryFailure::retryable("catalog navigation failed")));
                }
            }

            let state = {
                let guard = self.session.lock().await;
                let session = guard.as_ref().expect("checked above");
                self.collaborators.page_state.detect_page_state(&session.page).await
            };
            let state = match state {
                Ok(state) => state,
                Err(err) => {
                    return Ok(Err(CatalogEntryFailure::retryable(format!(
                        "page-state detection failed: {err}"
                    ))));
                }
            };

            match state {
                collaborators::PageState::Captcha
                | collaborators::PageState::ContinueButton
                | collaborators::PageState::RateLimit429 => {
                    let solved = {
                        let guard = self.session.lock().await;
                        let session = guard.as_ref().expect("checked above");
                        self.collaborators.captcha.resolve_captcha_flow(&session.page).await
                    };
                    match solved {
                        Ok(true) => continue,
                        _ => {
                            self.store.release_proxy(current_proxy_id).await?;
                            return Ok(Err(CatalogEntryFailure::retryable("captcha not solved")));
                        }
                    }
                }
                collaborators::PageState::ProxyBlock403 | collaborators::PageState::ProxyAuth407 => {
                    self.store.block_proxy(current_proxy_id, "blocked at catalog entry").await?;
                    let Some(new_proxy) = self.store.lease_free_proxy(&self.id).await? else {
                        return Ok(Err(CatalogEntryFailure::retryable("no free proxy to rotate onto")));
                    };
                    current_proxy_id = new_proxy.id;

                    let old = self.session.lock().await.take();
                    if let Some(old) = old {
                        old.teardown().await;
                    }
                    match BrowserSession::launch(&new_proxy, self.config.display.is_none()).await {
                        Ok(session) => *self.session.lock().await = Some(session),
                        Err(err) => {
                            return Ok(Err(CatalogEntryFailure::retryable(format!(
                                "relaunch after rotation failed: {err}"
                            ))));
                        }
                    }
                    let _ = article; // URL already embeds the article; nothing further to build.
                }
                collaborators::PageState::CardFound | collaborators::PageState::NotDetected => {
                    return Ok(Ok(()));
                }
            }

            if attempt + 1 == self.config.catalog_proxy_rotation_limit {
                return Ok(Err(CatalogEntryFailure::no_increment(
                    "catalog proxy rotation limit exceeded",
                )));
            }
        }
        Ok(Err(CatalogEntryFailure::no_increment("catalog proxy rotation limit exceeded")))
    }

    async fn run_gather(&self, article: &str) -> Result<collaborators::OrchestratorResult, WorkerError> {
        let (tx, rx) = page_request_channel();
        let page = {
            let guard = self.session.lock().await;
            guard.as_ref().expect("session present after enter_catalog").page.clone()
        };

        let traversal = self.collaborators.traversal.clone();
        let article_owned = article.to_string();
        let orchestrator_task =
            tokio::spawn(async move { traversal.parse_catalog_until_complete(page, &article_owned, tx).await });

        let coordinator_result = coordinator::run(
            rx,
            &self.store,
            &self.id,
            &self.session,
            &self.collaborators,
            self.config.display.is_none(),
            self.config.page_request_timeout,
        )
        .await;

        if let Err(err) = coordinator_result {
            orchestrator_task.abort();
            return Err(coordinator_error_to_worker(err));
        }

        let result = orchestrator_task
            .await
            .map_err(|err| anyhow::anyhow!("orchestrator task panicked: {err}"))??;
        Ok(result)
    }

    async fn recover_task(
        &self,
        task_id: i64,
        retry_count: i32,
        reason: &str,
        details: Option<String>,
    ) -> Result<(), WorkerError> {
        let message = match details {
            Some(details) => format!("{reason}: {details}"),
            None => reason.to_string(),
        };
        if retry_count >= self.config.max_retry_attempts as i32 {
            self.store.mark_task_as_error(task_id, &message).await?;
        } else {
            self.store.return_task_to_queue(task_id, &message, true).await?;
        }
        Ok(())
    }
}

/// A recoverable `CATALOG_ENTRY` failure:
/// rotation-limit exhaustion returns the task without incrementing
/// `retry_count`, every other cause increments it.
struct CatalogEntryFailure {
    reason: String,
    increment_retry: bool,
}

impl CatalogEntryFailure {
    fn retryable(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), increment_retry: true }
    }

    fn no_increment(reason: impl Into<String>) -> Self {
        Self { reason: reason.into(), increment_retry: false }
    }
}

fn coordinator_error_to_worker(err: CoordinatorError) -> WorkerError {
    match err {
        CoordinatorError::Store(err) => WorkerError::Store(err),
        other => WorkerError::Other(anyhow::anyhow!(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_failure_increments_retry_count() {
        let failure = CatalogEntryFailure::retryable("captcha not solved");
        assert!(failure.increment_retry);
        assert_eq!(failure.reason, "captcha not solved");
    }

    #[test]
    fn rotation_limit_failure_does_not_increment_retry_count() {
        let failure = CatalogEntryFailure::no_increment("catalog proxy rotation limit exceeded");
        assert!(!failure.increment_retry);
    }

    #[test]
    fn coordinator_store_error_maps_to_store_variant() {
        let err = coordinator_error_to_worker(CoordinatorError::Store(StoreError::Programming(
            "card not found".to_string(),
        )));
        assert!(matches!(err, WorkerError::Store(StoreError::Programming(_))));
    }

    #[test]
    fn coordinator_captcha_error_maps_to_other_variant() {
        let err = coordinator_error_to_worker(CoordinatorError::CaptchaNotSolved);
        assert!(matches!(err, WorkerError::Other(_)));
    }
}
