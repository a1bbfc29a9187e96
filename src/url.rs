//! Normalized URL identity used as the dedup/equality key throughout the engine.
//!
//! `ImUrl` wraps `url::Url` behind an `Arc` so clones are cheap and equality/hash compare
//! the canonical string form. `normalize()` applies the rules in the data model: lower-cased
//! host, stripped fragment, sorted query keys, and known tracking parameters removed.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// Query parameters known to be tracking noise rather than part of resource identity.
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "gclid",
    "fbclid",
    "mc_cid",
    "mc_eid",
    "ref",
    "ref_src",
];

/// Lower-case only the ASCII letters in a path, leaving percent-encoded escapes and any
/// non-ASCII bytes untouched. Part of normalized URL identity (two paths differing only
/// by ASCII case are the same resource).
fn ascii_fold(path: &str) -> String {
    path.chars()
        .map(|c| if c.is_ascii() { c.to_ascii_lowercase() } else { c })
        .collect()
}

/// An immutable, cheaply-cloneable, normalized URL.
#[derive(Clone, Debug, Eq, Serialize, Deserialize)]
pub struct ImUrl {
    url_str: Cow<'static, str>,
    url: Arc<Url>,
}

impl PartialEq for ImUrl {
    fn eq(&self, other: &Self) -> bool {
        self.url_str == other.url_str
    }
}

impl ImUrl {
    /// Parse without normalizing. Used internally and for round-tripping already-normalized
    /// strings (e.g. reading back from the cache/store).
    pub fn parse(input: &str) -> Result<Self> {
        let parsed_url = Url::parse(input).context("failed to parse URL")?;
        let url_str = Cow::Owned(parsed_url.as_str().to_string());
        Ok(Self {
            url_str,
            url: Arc::new(parsed_url),
        })
    }

    /// Parse and normalize in one step. This is the entry point discovery code should use.
    pub fn parse_normalized(input: &str) -> Result<Self> {
        Self::parse(input)?.normalize()
    }

    /// Produce the normalized form of this URL: lower-cased host, stripped fragment,
    /// sorted query keys, tracking parameters removed. Idempotent: `norm(norm(u)) == norm(u)`.
    pub fn normalize(&self) -> Result<Self> {
        let mut url = (*self.url).clone();

        url.set_fragment(None);

        if let Some(host) = url.host_str() {
            let lowered = host.to_lowercase();
            if lowered != host {
                url.set_host(Some(&lowered)).context("failed to set lowered host")?;
            }
        }

        let folded_path = ascii_fold(url.path());
        if folded_path != url.path() {
            url.set_path(&folded_path);
        }

        if let Some(query) = url.query() {
            let mut pairs: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
                .into_owned()
                .filter(|(k, _)| !TRACKING_PARAMS.contains(&k.as_str()))
                .collect();
            pairs.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
            if pairs.is_empty() {
                url.set_query(None);
            } else {
                let encoded: String = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(pairs)
                    .finish();
                url.set_query(Some(&encoded));
            }
        }

        Self::parse(url.as_str())
    }

    pub fn as_str(&self) -> &str {
        &self.url_str
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    pub fn port(&self) -> Option<u16> {
        self.url.port()
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.url.query()
    }

    pub fn fragment(&self) -> Option<&str> {
        self.url.fragment()
    }

    /// Registered host, lowercased, used as the throttle/budget/queue key.
    pub fn host_key(&self) -> Result<String> {
        self.url
            .host_str()
            .map(str::to_lowercase)
            .context("URL has no host")
    }

    pub fn without_fragment(&self) -> Result<Self> {
        let mut url = (*self.url).clone();
        url.set_fragment(None);
        Self::parse(url.as_str())
    }

    /// Resolve a `Location` header value against this URL (redirect hop resolution).
    pub fn join(&self, location: &str) -> Result<Self> {
        let joined = self.url.join(location).context("failed to resolve redirect location")?;
        Self::parse(joined.as_str())
    }

    pub fn with_scheme(&self, scheme: &str) -> Result<Self> {
        let mut url = (*self.url).clone();
        url.set_scheme(scheme)
            .map_err(|()| anyhow::anyhow!("failed to set scheme"))?;
        Self::parse(url.as_str())
    }
}

impl fmt::Display for ImUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.url_str)
    }
}

impl Hash for ImUrl {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.url_str.hash(state);
    }
}

impl FromStr for ImUrl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for ImUrl {
    type Error = anyhow::Error;

    fn try_from(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl AsRef<str> for ImUrl {
    fn as_ref(&self) -> &str {
        &self.url_str
    }
}

impl Deref for ImUrl {
    type Target = Url;

    fn deref(&self) -> &Self::Target {
        &self.url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_fragment() {
        let url = ImUrl::parse("https://example.com/page#section1").unwrap();
        let normalized = url.normalize().unwrap();
        assert_eq!(normalized.as_str(), "https://example.com/page");
    }

    #[test]
    fn normalize_lowercases_host_and_path() {
        let url = ImUrl::parse("https://Example.COM/Path").unwrap();
        let normalized = url.normalize().unwrap();
        assert_eq!(normalized.host(), Some("example.com"));
        assert_eq!(normalized.path(), "/path");
    }

    #[test]
    fn normalize_strips_tracking_params_and_sorts_remaining() {
        let url =
            ImUrl::parse("https://example.com/a?utm_source=x&b=2&a=1&fbclid=y").unwrap();
        let normalized = url.normalize().unwrap();
        assert_eq!(normalized.query(), Some("a=1&b=2"));
    }

    #[test]
    fn normalize_is_idempotent() {
        let url = ImUrl::parse("https://Example.com/Page?Z=1&utm_source=x#frag").unwrap();
        let once = url.normalize().unwrap();
        let twice = once.normalize().unwrap();
        assert_eq!(once.as_str(), twice.as_str());
    }

    #[test]
    fn host_key_is_lowercased() {
        let url = ImUrl::parse("https://Example.COM/path").unwrap();
        assert_eq!(url.host_key().unwrap(), "example.com");
    }

    #[test]
    fn join_resolves_relative_redirect() {
        let url = ImUrl::parse("https://example.com/a/b").unwrap();
        let joined = url.join("/c").unwrap();
        assert_eq!(joined.as_str(), "https://example.com/c");
    }

    #[test]
    fn clone_is_cheap_arc_share() {
        let url1 = ImUrl::parse("https://example.com").unwrap();
        let url2 = url1.clone();
        assert!(Arc::ptr_eq(&url1.url, &url2.url));
    }
}
