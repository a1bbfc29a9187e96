//! HTTP client construction and header shaping: a single, deterministic browser-like
//! header set rather than full stealth impersonation.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Response};

use crate::url::ImUrl;
use crate::utils::constants::CHROME_USER_AGENT;

/// Build the shared `reqwest::Client`. Redirects are disabled: the pipeline follows them
/// manually (`fetch::redirect`) so each hop can be re-classified and re-throttled.
pub fn build_client(request_timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(request_timeout)
        .build()
}

/// Headers sent on every fetch attempt: a single deterministic "recent desktop Chrome"
/// fingerprint, plus conditional-request headers when a prior cache entry supplies them.
#[must_use]
pub fn build_headers(etag: Option<&str>, last_modified: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("user-agent"),
        HeaderValue::from_static(CHROME_USER_AGENT),
    );
    headers.insert(
        HeaderName::from_static("accept"),
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
        ),
    );
    headers.insert(
        HeaderName::from_static("accept-language"),
        HeaderValue::from_static("en-US,en;q=0.9"),
    );
    headers.insert(
        HeaderName::from_static("accept-encoding"),
        HeaderValue::from_static("gzip, deflate, br"),
    );

    if let Some(etag) = etag
        && let Ok(value) = HeaderValue::from_str(etag)
    {
        headers.insert(HeaderName::from_static("if-none-match"), value);
    }
    if let Some(last_modified) = last_modified
        && let Ok(value) = HeaderValue::from_str(last_modified)
    {
        headers.insert(HeaderName::from_static("if-modified-since"), value);
    }

    headers
}

/// Parse the `Location` header of a redirect response into an absolute `ImUrl`, resolved
/// against the URL that produced the redirect.
pub fn location_of(response: &Response, from: &ImUrl) -> anyhow::Result<ImUrl> {
    let location = response
        .headers()
        .get(reqwest::header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow::anyhow!("redirect response missing Location header"))?;
    from.join(location)
}

/// Parse a `Retry-After` header: either a delta-seconds integer or an HTTP-date.
#[must_use]
pub fn parse_retry_after_ms(response: &Response) -> Option<u64> {
    let raw = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())?;

    if let Ok(seconds) = raw.trim().parse::<u64>() {
        return Some(seconds * 1000);
    }

    let target = chrono::DateTime::parse_from_rfc2822(raw.trim()).ok()?;
    let now = chrono::Utc::now();
    let delta = target.with_timezone(&chrono::Utc) - now;
    delta.num_milliseconds().try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_headers_carries_conditional_headers_when_present() {
        let headers = build_headers(Some("\"abc123\""), Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(headers.get("if-none-match").unwrap(), "\"abc123\"");
        assert_eq!(
            headers.get("if-modified-since").unwrap(),
            "Wed, 21 Oct 2015 07:28:00 GMT"
        );
        assert!(headers.get("user-agent").is_some());
    }

    #[test]
    fn build_headers_omits_conditional_headers_when_absent() {
        let headers = build_headers(None, None);
        assert!(headers.get("if-none-match").is_none());
        assert!(headers.get("if-modified-since").is_none());
    }
}
