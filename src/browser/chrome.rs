// spider_chrome re-exports chromiumoxide API
use super::surface::{InteractionResult, InteractionSurface, Locator, Selector};
use crate::error::{InteractionError, PpmiError, Result};
use crate::logging::Logger;
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::{
    SetDownloadBehaviorBehavior, SetDownloadBehaviorParams,
};
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::element::Element;
use chromiumoxide::page::{Page, ScreenshotParams};
use futures::StreamExt;
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);
const WINDOW_SIZE: (u32, u32) = (1200, 720);

/// Connection mode for Chrome browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    /// Launch a local Chrome
    Sandboxed {
        chrome_path: Option<String>,
        no_sandbox: bool,
        headless: bool,
    },
    /// Connect to a Chrome already running with --remote-debugging-port
    DebugPort(u16),
}

/// Chrome page driven over CDP, with downloads routed to one directory.
pub struct ChromeSurface {
    browser: Browser,
    page: Page,
    logger: Logger,
    /// False when attached to a Chrome someone else started
    owns_browser: bool,
    // Dropped (and removed) with the surface.
    _profile_dir: Option<TempDir>,
}

impl ChromeSurface {
    pub async fn launch(mode: ConnectionMode, download_dir: &Path, logger: Logger) -> Result<Self> {
        let (browser, profile_dir) = match mode {
            ConnectionMode::Sandboxed {
                chrome_path,
                no_sandbox,
                headless,
            } => {
                // A fresh profile per session keeps cookies from leaking between runs
                let profile_dir = tempfile::Builder::new()
                    .prefix("ppmi-chrome-")
                    .tempdir()
                    .map_err(|e| {
                        PpmiError::LaunchFailed(format!("Failed to create profile directory: {}", e))
                    })?;

                let mut config = if headless {
                    BrowserConfig::builder()
                } else {
                    BrowserConfig::builder().with_head()
                };

                config = config
                    .user_data_dir(profile_dir.path())
                    .window_size(WINDOW_SIZE.0, WINDOW_SIZE.1);

                if no_sandbox {
                    config = config.arg("--no-sandbox");
                }

                if let Some(path) = chrome_path {
                    config = config.chrome_executable(path);
                }

                let config = config.build().map_err(|e| {
                    PpmiError::LaunchFailed(format!(
                        "{}. \n\n\
                         Chrome not found. You can:\n\
                         - Install Chrome: https://www.google.com/chrome/\n\
                         - Or specify path: --chrome-path /path/to/chrome\n\
                         - Linux sandbox issue? Try: --no-sandbox",
                        e
                    ))
                })?;

                let (browser, mut handler) = Browser::launch(config)
                    .await
                    .map_err(|e| PpmiError::LaunchFailed(e.to_string()))?;

                tokio::spawn(async move {
                    while (handler.next().await).is_some() {
                        // Handle browser events
                    }
                });

                (browser, Some(profile_dir))
            }
            ConnectionMode::DebugPort(port) => {
                let url = format!("http://localhost:{}", port);
                let (browser, mut handler) = Browser::connect(&url).await.map_err(|e| {
                    PpmiError::ConnectionFailed(format!(
                        "Failed to connect to Chrome on port {}. \
                         Make sure Chrome is running with --remote-debugging-port={}: {}",
                        port, port, e
                    ))
                })?;

                tokio::spawn(async move {
                    while (handler.next().await).is_some() {
                        // Handle browser events
                    }
                });

                (browser, None)
            }
        };

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| PpmiError::LaunchFailed(format!("Failed to create page: {}", e)))?;

        let params = SetDownloadBehaviorParams::builder()
            .behavior(SetDownloadBehaviorBehavior::Allow)
            .download_path(download_dir.to_string_lossy().to_string())
            .build()
            .map_err(|e| PpmiError::LaunchFailed(format!("Invalid download settings: {}", e)))?;
        page.execute(params).await.map_err(|e| {
            PpmiError::LaunchFailed(format!("Failed to route downloads: {}", e))
        })?;

        logger.info(format_args!(
            "Chrome ready, downloads go to {}",
            download_dir.display()
        ));

        Ok(Self {
            browser,
            page,
            logger,
            owns_browser: profile_dir.is_some(),
            _profile_dir: profile_dir,
        })
    }

    /// Access to the underlying page for anything the surface does not cover
    pub fn page(&self) -> &Page {
        &self.page
    }

    /// Port of the browser's DevTools endpoint, for attaching another client.
    pub fn debug_port(&self) -> Option<u16> {
        url::Url::parse(self.browser.websocket_address())
            .ok()
            .and_then(|u| u.port())
    }

    /// Check if the browser is still alive and responsive
    pub async fn is_alive(&self) -> bool {
        matches!(
            tokio::time::timeout(Duration::from_secs(2), self.page.url()).await,
            Ok(Ok(_))
        )
    }
}

/// Sort a CDP failure into retryable or not.
///
/// A closed channel means the browser is gone; nothing else about the page
/// can be trusted afterwards.
fn classify(context: &str, err: impl Display) -> InteractionError {
    let text = err.to_string();
    let lowered = text.to_lowercase();
    if lowered.contains("oneshot canceled")
        || lowered.contains("channel")
        || lowered.contains("websocket")
        || lowered.contains("connection closed")
    {
        InteractionError::permanent(format!(
            "{}: browser connection lost ({})",
            context, text
        ))
    } else {
        InteractionError::transient(format!("{}: {}", context, text))
    }
}

#[async_trait]
impl InteractionSurface for ChromeSurface {
    type Element = Element;

    async fn navigate(&self, url: &str) -> InteractionResult<()> {
        self.logger.debug(format_args!("Navigating to {}", url));

        let params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| InteractionError::permanent(format!("Invalid URL {}: {}", url, e)))?;

        let response = self
            .page
            .execute(params)
            .await
            .map_err(|e| classify("navigate", e))?;

        if let Some(error_text) = response.result.error_text.clone() {
            return Err(InteractionError::transient(format!(
                "Navigation to {} failed: {}",
                url, error_text
            )));
        }

        match tokio::time::timeout(NAVIGATION_TIMEOUT, self.page.wait_for_navigation()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(classify("wait for navigation", e)),
            Err(_) => Err(InteractionError::transient(format!(
                "Timed out after {:?} waiting for {}",
                NAVIGATION_TIMEOUT, url
            ))),
        }
    }

    async fn find(&self, locator: &Locator) -> InteractionResult<Element> {
        let found = match locator.to_selector() {
            Selector::Css(css) => self.page.find_element(css).await,
            Selector::XPath(xpath) => self.page.find_xpath(xpath).await,
        };
        found.map_err(|e| classify(&format!("find {}", locator), e))
    }

    async fn find_all(&self, locator: &Locator) -> InteractionResult<Vec<Element>> {
        let found = match locator.to_selector() {
            Selector::Css(css) => self.page.find_elements(css).await,
            Selector::XPath(xpath) => self.page.find_xpaths(xpath).await,
        };
        found.map_err(|e| classify(&format!("find all {}", locator), e))
    }

    async fn click(&self, element: &Element) -> InteractionResult<()> {
        element.click().await.map_err(|e| classify("click", e))?;
        Ok(())
    }

    async fn type_text(&self, element: &Element, text: &str) -> InteractionResult<()> {
        element
            .click()
            .await
            .map_err(|e| classify("focus", e))?
            .type_str(text)
            .await
            .map_err(|e| classify("type", e))?;
        Ok(())
    }

    async fn current_url(&self) -> InteractionResult<String> {
        self.page
            .url()
            .await
            .map_err(|e| classify("current url", e))?
            .ok_or_else(|| InteractionError::transient("page has no URL yet"))
    }

    async fn page_source(&self) -> InteractionResult<String> {
        self.page
            .content()
            .await
            .map_err(|e| classify("page source", e))
    }

    async fn screenshot(&self) -> InteractionResult<Vec<u8>> {
        self.page
            .screenshot(ScreenshotParams::default())
            .await
            .map_err(|e| classify("screenshot", e))
    }

    async fn close(&mut self) -> InteractionResult<()> {
        if !self.owns_browser {
            self.logger.debug("Closing our page, leaving the attached Chrome running");
            return self
                .page
                .clone()
                .close()
                .await
                .map_err(|e| InteractionError::permanent(format!("Failed to close page: {}", e)));
        }

        self.logger.debug("Closing Chrome");
        self.browser
            .close()
            .await
            .map_err(|e| InteractionError::permanent(format!("Failed to close browser: {}", e)))?;
        Ok(())
    }
}
