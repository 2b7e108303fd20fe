//! Browser session glue: owns one headless
//! browser bound to one authenticated proxy and hands out a single navigable
//! page. Torn down and relaunched whenever the worker crosses proxies.

use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::cdp::browser_protocol::fetch::{
    AuthChallengeResponse, AuthChallengeResponseResponse, ContinueWithAuthParams, EnableParams,
    EventAuthRequired,
};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::browser_profile::{self, BrowserProfile};
use crate::browser_setup;
use crate::store::models::Proxy;

/// One launched browser, its event-handler pump, its auth-interception
/// pump, and the profile directory backing it. Dropping this tears the
/// browser process down and removes the profile.
pub struct BrowserSession {
    pub browser: Browser,
    pub page: Page,
    handler_task: JoinHandle<()>,
    auth_task: JoinHandle<()>,
    _profile: BrowserProfile,
    pub proxy_id: i64,
}

impl BrowserSession {
    /// Launches a fresh browser bound to `proxy`, enables proxy
    /// basic-auth interception over the Fetch domain, and opens the
    /// initial blank page.
    pub async fn launch(proxy: &Proxy, headless: bool) -> Result<Self> {
        let auth = Proxy::parse_address(&proxy.address)
            .with_context(|| format!("malformed proxy address: {}", proxy.address))?;

        let profile = browser_profile::create_unique_profile()
            .context("failed to create browser profile directory")?;

        let (mut browser, handler_task, _data_dir) =
            launch_with_proxy(headless, profile.path().to_path_buf(), &auth.host, auth.port)
                .await
                .context("failed to launch proxied browser")?;

        let page = browser.new_page("about:blank").await.context("failed to open initial page")?;

        page.execute(EnableParams::builder().handle_auth_requests(true).build())
            .await
            .context("failed to enable Fetch auth interception")?;

        let auth_task = spawn_auth_responder(page.clone(), auth.username.clone(), auth.password.clone());

        Ok(Self {
            browser,
            page,
            handler_task,
            auth_task,
            _profile: profile,
            proxy_id: proxy.id,
        })
    }

    pub async fn navigate(&self, url: &str, timeout: Duration) -> Result<()> {
        tokio::time::timeout(timeout, self.page.goto(url))
            .await
            .context("navigation timed out")?
            .with_context(|| format!("failed to navigate to {url}"))?;
        Ok(())
    }

    pub async fn html(&self) -> Result<String> {
        self.page.content().await.context("failed to read page content")
    }

    /// Tears the browser process and its background pumps down. Errors
    /// are logged, not propagated — teardown happens on every exit path
    /// including failure recovery and must not itself fail the worker.
    pub async fn teardown(mut self) {
        self.auth_task.abort();
        self.handler_task.abort();
        if let Err(err) = self.browser.close().await {
            warn!(error = %err, "error closing browser during teardown");
        }
        if let Err(err) = self.browser.wait().await {
            debug!(error = %err, "browser process wait returned an error during teardown");
        }
    }
}

async fn launch_with_proxy(
    headless: bool,
    chrome_data_dir: std::path::PathBuf,
    proxy_host: &str,
    proxy_port: u16,
) -> Result<(Browser, JoinHandle<()>, std::path::PathBuf)> {
    let chrome_path = match browser_setup::find_browser_executable().await {
        Ok(path) => path,
        Err(_) => browser_setup::download_managed_browser().await?,
    };

    std::fs::create_dir_all(&chrome_data_dir).context("failed to create chrome data dir")?;

    let mut config_builder = chromiumoxide::browser::BrowserConfigBuilder::default()
        .request_timeout(Duration::from_secs(30))
        .window_size(1920, 1080)
        .user_data_dir(chrome_data_dir.clone())
        .chrome_executable(chrome_path)
        .arg(format!("--proxy-server=http://{proxy_host}:{proxy_port}"))
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--no-first-run")
        .arg("--no-sandbox");

    config_builder = if headless {
        config_builder.headless_mode(chromiumoxide::browser::HeadlessMode::default())
    } else {
        config_builder.with_head()
    };

    let browser_config = config_builder
        .build()
        .map_err(|e| anyhow::anyhow!("failed to build proxied browser config: {e}"))?;

    let (browser, mut handler) = Browser::launch(browser_config).await.context("failed to launch browser")?;

    let handler_task = tokio::task::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(err) = event {
                debug!(error = %err, "browser handler event error");
            }
        }
    });

    Ok((browser, handler_task, chrome_data_dir))
}

/// Answers Chrome's proxy basic-auth challenges as they arrive over the
/// Fetch domain, matching the `host:port:user:pass` proxy address format.
fn spawn_auth_responder(page: Page, username: String, password: String) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        let Ok(mut events) = page.event_listener::<EventAuthRequired>().await else {
            warn!("failed to subscribe to auth-required events");
            return;
        };
        while let Some(event) = events.next().await {
            let response = ContinueWithAuthParams::builder()
                .request_id(event.request_id.clone())
                .auth_challenge_response(
                    AuthChallengeResponse::builder()
                        .response(AuthChallengeResponseResponse::ProvideCredentials)
                        .username(username.clone())
                        .password(password.clone())
                        .build(),
                )
                .build()
                .expect("request_id and auth_challenge_response are always set");
            if let Err(err) = page.execute(response).await {
                warn!(error = %err, "failed to respond to proxy auth challenge");
            }
        }
    })
}
