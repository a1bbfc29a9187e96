//! Page-level navigation: create a page, navigate, wait for DOM-ready plus a short settle
//! window, snapshot outer HTML, close the page.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chromiumoxide::browser::Browser;

use crate::url::ImUrl;

/// Post-navigation settle window: lets late-firing `DOMContentLoaded` JS (lazy images,
/// client-rendered article bodies) finish before the outer-HTML snapshot is taken.
const SETTLE_WINDOW: Duration = Duration::from_millis(500);

async fn with_timeout<F, T>(fut: F, timeout: Duration, label: &str) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("{label} timed out after {timeout:?}")),
    }
}

/// Navigate `browser` to `url`, wait for it to settle, and return the rendered outer HTML.
pub async fn render(browser: Arc<Browser>, url: &ImUrl, timeout: Duration) -> Result<String> {
    let page = browser
        .new_page("about:blank")
        .await
        .context("failed to create page")?;

    let nav_timeout = timeout;
    let result = async {
        with_timeout(
            async {
                page.goto(url.as_str())
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))
            },
            nav_timeout,
            "navigation",
        )
        .await?;

        with_timeout(
            async {
                page.wait_for_navigation()
                    .await
                    .map_err(|e| anyhow::anyhow!("{e}"))
            },
            nav_timeout,
            "DOM ready wait",
        )
        .await?;

        tokio::time::sleep(SETTLE_WINDOW).await;

        page.content()
            .await
            .map_err(|e| anyhow::anyhow!("failed to snapshot outer HTML: {e}"))
    }
    .await;

    if let Err(err) = page.close().await {
        tracing::warn!(url = url.as_str(), error = %err, "headless: failed to close page");
    }

    result
}
