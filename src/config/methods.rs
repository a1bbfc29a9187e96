//! Derived, non-trivial `CrawlConfig` methods beyond plain field access.

use super::types::CrawlConfig;

/// Which per-kind TTL applies to a queue item kind, per/§4.6 cache-decision rule.
#[derive(Debug, Clone, Copy)]
pub enum CacheKind {
    Article,
    Hub,
    Other,
}

impl CrawlConfig {
    /// Resolve the effective `maxAgeMs` for a given item kind: per-kind override if set
    /// (non-`-1`... actually per-kind configs are independent of the generic `max_age_ms`),
    /// falling back to the generic value.
    #[must_use]
    pub fn max_age_ms_for(&self, kind: CacheKind) -> i64 {
        match kind {
            CacheKind::Article if self.max_age_article_ms != -1 => self.max_age_article_ms,
            CacheKind::Hub if self.max_age_hub_ms != -1 => self.max_age_hub_ms,
            _ => self.max_age_ms,
        }
    }

    /// Whether `host` appears on the configured HTTPS-upgrade list (case-insensitive).
    #[must_use]
    pub fn should_upgrade_to_https(&self, host: &str) -> bool {
        self.https_upgrade_hosts
            .iter()
            .any(|h| h.eq_ignore_ascii_case(host))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn falls_back_to_generic_max_age_when_kind_override_unset() {
        let config = CrawlConfig::builder()
            .start_url("example.com")
            .max_age_ms(5_000)
            .build()
            .unwrap();
        assert_eq!(config.max_age_ms_for(CacheKind::Article), 5_000);
    }

    #[test]
    fn https_upgrade_is_case_insensitive() {
        let config = CrawlConfig::builder()
            .start_url("example.com")
            .https_upgrade_hosts(vec!["Insecure.Example.Com".to_string()])
            .build()
            .unwrap();
        assert!(config.should_upgrade_to_https("insecure.example.com"));
        assert!(!config.should_upgrade_to_https("other.example.com"));
    }
}
