//! The coordinator activity: services the catalog
//! traversal routine's page-requests while it runs as a parallel activity.

use std::time::Duration;

use thiserror::Error;
use tracing::{info, warn};

use super::collaborators::{Collaborators, PageRequestReceiver, PageRequestStatus};
use super::session::BrowserSession;
use crate::store::{Store, StoreError};

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("captcha not solved")]
    CaptchaNotSolved,
    #[error("no free proxy available to rotate onto")]
    ProxyBlockedNoReplacement,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Runs until the traversal routine either stops sending requests for
/// `page_request_timeout` (clean exit — F finished on its own) or a
/// request cannot be serviced (propagated as an error, which cancels the
/// whole gather point).
///
/// `session` is an `Option` exchanged under the worker's mutex by the
/// caller between requests; this function only touches it while servicing
/// one request at a time, matching the "outside the lock" rule for
/// long-running browser I/O.
pub async fn run(
    mut requests: PageRequestReceiver,
    store: &Store,
    worker_id: &str,
    session: &tokio::sync::Mutex<Option<BrowserSession>>,
    collaborators: &Collaborators,
    headless: bool,
    page_request_timeout: Duration,
) -> Result<(), CoordinatorError> {
    loop {
        let request = match tokio::time::timeout(page_request_timeout, requests.recv()).await {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()), // sender dropped: traversal finished normally
            Err(_) => {
                info!(worker_id, "page-request wait timed out; traversal assumed finished");
                return Ok(());
            }
        };

        match request.status {
            PageRequestStatus::ProxyBlocked => {
                warn!(worker_id, attempt = request.attempt, "proxy blocked mid-traversal, rotating");
                let old_proxy_id = {
                    let guard = session.lock().await;
                    guard.as_ref().map(|s| s.proxy_id)
                };
                if let Some(proxy_id) = old_proxy_id {
                    store.block_proxy(proxy_id, "blocked mid-traversal").await?;
                }

                let Some(new_proxy) = store.lease_free_proxy(worker_id).await? else {
                    return Err(CoordinatorError::ProxyBlockedNoReplacement);
                };

                let old_session = session.lock().await.take();
                if let Some(old_session) = old_session {
                    old_session.teardown().await;
                }

                let new_session = BrowserSession::launch(&new_proxy, headless).await?;
                let catalog_url = format!(
                    "https://www.avito.ru/rossiya?q=page_{}&s=104",
                    request.next_start_page
                );
                new_session.navigate(&catalog_url, Duration::from_secs(30)).await?;

                if matches!(
                    collaborators.page_state.detect_page_state(&new_session.page).await?,
                    super::collaborators::PageState::Captcha
                ) && !collaborators.captcha.resolve_captcha_flow(&new_session.page).await?
                {
                    return Err(CoordinatorError::CaptchaNotSolved);
                }

                let page = new_session.page.clone();
                *session.lock().await = Some(new_session);
                let _ = request.reply.send(page);
            }

            PageRequestStatus::CaptchaUnsolved
            | PageRequestStatus::ContinueButton
            | PageRequestStatus::RateLimit => {
                let solved = collaborators.captcha.resolve_captcha_flow(&request.page).await?;
                if solved {
                    let _ = request.reply.send(request.page);
                } else {
                    let proxy_id = {
                        let guard = session.lock().await;
                        guard.as_ref().map(|s| s.proxy_id)
                    };
                    if let Some(proxy_id) = proxy_id {
                        store.release_proxy(proxy_id).await?;
                    }
                    let old_session = session.lock().await.take();
                    if let Some(old_session) = old_session {
                        old_session.teardown().await;
                    }
                    return Err(CoordinatorError::CaptchaNotSolved);
                }
            }

            PageRequestStatus::NotDetected => {
                let _ = request.reply.send(request.page);
            }
        }
    }
}
