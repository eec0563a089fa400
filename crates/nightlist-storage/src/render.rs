//! Renderers that turn the listing URL into fully populated markup.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::error::CdpError;
use chromiumoxide::Page;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::{classify_reqwest_error, classify_status, BackoffPolicy, RetryDisposition};

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct RenderedPage {
    pub url: String,
    pub html: String,
    pub rendered_at: DateTime<Utc>,
    pub attempts: usize,
}

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("launching browser: {0}")]
    Launch(String),
    #[error("browser protocol error: {0}")]
    Browser(#[from] CdpError),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("event cards did not appear at {url} within {waited:?}")]
    WaitTimeout { url: String, waited: Duration },
    #[error("reading snapshot {path}: {source}")]
    Snapshot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RenderError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            RenderError::Browser(err) => classify_cdp_error(err),
            RenderError::Request(err) => classify_reqwest_error(err),
            RenderError::HttpStatus { status, .. } => {
                match reqwest::StatusCode::from_u16(*status) {
                    Ok(status) => classify_status(status),
                    Err(_) => RetryDisposition::NonRetryable,
                }
            }
            RenderError::Launch(_) | RenderError::WaitTimeout { .. } | RenderError::Snapshot { .. } => {
                RetryDisposition::NonRetryable
            }
        }
    }
}

fn classify_cdp_error(err: &CdpError) -> RetryDisposition {
    match err {
        CdpError::Ws(_) | CdpError::Io(_) | CdpError::Timeout | CdpError::NoResponse => {
            RetryDisposition::Retryable
        }
        CdpError::ChromeMessage(msg) if msg.contains("net::ERR") => RetryDisposition::Retryable,
        _ => RetryDisposition::NonRetryable,
    }
}

#[async_trait]
pub trait PageRenderer: Send + Sync {
    fn name(&self) -> &'static str;

    /// One render attempt; retries are layered on top by [`render_with_retry`].
    async fn render_once(&self, url: &str) -> Result<String, RenderError>;
}

/// Render `url`, retrying transient failures with exponential backoff.
pub async fn render_with_retry(
    renderer: &dyn PageRenderer,
    url: &str,
    backoff: &BackoffPolicy,
) -> Result<RenderedPage, RenderError> {
    let span = info_span!("render", renderer = renderer.name(), url);
    async move {
        let max_attempts = backoff.max_attempts.max(1);
        let mut attempt = 0usize;
        loop {
            match renderer.render_once(url).await {
                Ok(html) => {
                    info!(bytes = html.len(), attempts = attempt + 1, "page rendered");
                    return Ok(RenderedPage {
                        url: url.to_string(),
                        html,
                        rendered_at: Utc::now(),
                        attempts: attempt + 1,
                    });
                }
                Err(err)
                    if err.disposition() == RetryDisposition::Retryable
                        && attempt + 1 < max_attempts =>
                {
                    let delay = backoff.delay_for_attempt(attempt);
                    warn!(attempt = attempt + 1, ?delay, error = %err, "render failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
    .instrument(span)
    .await
}

/// Bounded wait for client-side content: poll for cards, scrolling between polls.
#[derive(Debug, Clone)]
pub struct RenderWait {
    pub card_selector: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub scroll_passes: usize,
}

impl Default for RenderWait {
    fn default() -> Self {
        Self {
            card_selector: "div[class*=\"event\"]".to_string(),
            timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            scroll_passes: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BrowserRenderConfig {
    pub user_agent: String,
    pub window_size: (u32, u32),
    pub chrome_executable: Option<PathBuf>,
    pub request_timeout: Duration,
    pub wait: RenderWait,
}

impl Default for BrowserRenderConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            window_size: (1920, 1080),
            chrome_executable: None,
            request_timeout: Duration::from_secs(30),
            wait: RenderWait::default(),
        }
    }
}

/// Headless Chromium renderer. Each render owns its own browser process.
#[derive(Debug, Clone)]
pub struct BrowserRenderer {
    config: BrowserRenderConfig,
}

impl BrowserRenderer {
    pub fn new(config: BrowserRenderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl PageRenderer for BrowserRenderer {
    fn name(&self) -> &'static str {
        "browser"
    }

    async fn render_once(&self, url: &str) -> Result<String, RenderError> {
        let session = BrowserSession::launch(&self.config).await?;
        let rendered = session.render(url, &self.config.wait).await;
        session.close().await;
        rendered
    }
}

/// Scoped browser process plus the task driving its CDP connection.
///
/// `close` is the normal release path. If the session is dropped without it
/// (panic, cancelled future), the handler task is aborted and the browser
/// process is killed by chromiumoxide's own drop.
struct BrowserSession {
    browser: Option<Browser>,
    handler: Option<JoinHandle<()>>,
}

impl BrowserSession {
    async fn launch(config: &BrowserRenderConfig) -> Result<Self, RenderError> {
        let (width, height) = config.window_size;
        let mut builder = BrowserConfig::builder()
            .no_sandbox()
            .window_size(width, height)
            .request_timeout(config.request_timeout)
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-blink-features=AutomationControlled")
            .arg(format!("--user-agent={}", config.user_agent));
        if let Some(path) = &config.chrome_executable {
            builder = builder.chrome_executable(path);
        }
        let browser_config = builder.build().map_err(RenderError::Launch)?;

        let (browser, mut handler) = Browser::launch(browser_config).await?;
        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });
        debug!("browser launched");

        Ok(Self {
            browser: Some(browser),
            handler: Some(handler),
        })
    }

    async fn render(&self, url: &str, wait: &RenderWait) -> Result<String, RenderError> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| RenderError::Launch("browser session already closed".to_string()))?;
        let page = browser.new_page("about:blank").await?;
        page.goto(url).await?;

        wait_for_cards(&page, url, wait).await?;

        let passes = wait.scroll_passes.max(1);
        for pass in 1..=passes {
            page.evaluate(format!(
                "window.scrollTo(0, document.body.scrollHeight * {pass} / {passes})"
            ))
            .await?;
            tokio::time::sleep(wait.poll_interval).await;
        }
        page.evaluate("window.scrollTo(0, 0)").await?;

        let html = page.content().await?;
        if let Err(err) = page.close().await {
            debug!(error = %err, "closing page failed");
        }
        Ok(html)
    }

    async fn close(mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(err) = browser.close().await {
                warn!(error = %err, "browser close failed");
            }
            if let Err(err) = browser.wait().await {
                warn!(error = %err, "waiting for browser exit failed");
            }
        }
        if let Some(handler) = self.handler.take() {
            let _ = handler.await;
        }
        debug!("browser released");
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            handler.abort();
        }
        if self.browser.take().is_some() {
            warn!("browser session dropped without close; process killed on drop");
        }
    }
}

async fn wait_for_cards(page: &Page, url: &str, wait: &RenderWait) -> Result<(), RenderError> {
    let started = Instant::now();
    loop {
        let found = page
            .find_elements(wait.card_selector.as_str())
            .await
            .map(|cards| cards.len())
            .unwrap_or(0);
        if found > 0 {
            debug!(found, waited = ?started.elapsed(), "event cards present");
            return Ok(());
        }
        if started.elapsed() >= wait.timeout {
            return Err(RenderError::WaitTimeout {
                url: url.to_string(),
                waited: started.elapsed(),
            });
        }
        // Lazy-loaded listings only populate once scrolled.
        let _ = page
            .evaluate("window.scrollTo(0, document.body.scrollHeight)")
            .await;
        tokio::time::sleep(wait.poll_interval).await;
    }
}

/// Plain HTTP fetch for mirrors that serve pre-rendered markup.
#[derive(Debug, Clone)]
pub struct HttpRenderer {
    client: reqwest::Client,
}

impl HttpRenderer {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, RenderError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(timeout)
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageRenderer for HttpRenderer {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn render_once(&self, url: &str) -> Result<String, RenderError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RenderError::HttpStatus {
                status: status.as_u16(),
                url: resp.url().to_string(),
            });
        }
        Ok(resp.text().await?)
    }
}

/// Serves a previously saved page dump instead of touching the network.
#[derive(Debug, Clone)]
pub struct SnapshotRenderer {
    path: PathBuf,
}

impl SnapshotRenderer {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl PageRenderer for SnapshotRenderer {
    fn name(&self) -> &'static str {
        "snapshot"
    }

    async fn render_once(&self, _url: &str) -> Result<String, RenderError> {
        tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| RenderError::Snapshot {
                path: self.path.clone(),
                source,
            })
    }
}
