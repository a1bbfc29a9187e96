//! Durable persistence layer: `cache`, `host_state`,
//! `host_budget`, `known_404`, `checkpoint` tables over SQLite.
//!
//! Grounded on a common `link_index/mod.rs` (sqlx SQLite pool with WAL, schema-on-open,
//! upsert-via-`ON CONFLICT`), adapted from a link graph to the engine's persisted state.

use std::path::Path;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::SqlitePool;

use crate::cache::CacheEntry;
use crate::throttle::budget::HostBudget;
use crate::throttle::{BudgetManager, HostState, ThrottleManager};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache (
    url TEXT PRIMARY KEY,
    html TEXT,
    fetched_at INTEGER NOT NULL,
    http_status INTEGER NOT NULL,
    etag TEXT,
    last_modified TEXT
);

CREATE TABLE IF NOT EXISTS host_state (
    host TEXT PRIMARY KEY,
    rpm INTEGER NOT NULL,
    next_request_at INTEGER NOT NULL,
    backoff_until INTEGER NOT NULL,
    err_429_streak INTEGER NOT NULL,
    success_streak INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS host_budget (
    host TEXT PRIMARY KEY,
    failures_json TEXT NOT NULL,
    lock_expires_at INTEGER
);

CREATE TABLE IF NOT EXISTS known_404 (
    url TEXT PRIMARY KEY,
    fetched_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoint (
    job_id TEXT PRIMARY KEY,
    queue_snapshot TEXT NOT NULL,
    visited_set TEXT NOT NULL,
    stats TEXT NOT NULL,
    saved_at INTEGER NOT NULL
);
"#;

/// SQLite-backed implementation of `crate::cache::DurableStore`, plus the extra tables
/// (`host_state`, `host_budget`, `checkpoint`) that the cache trait doesn't need but
/// the engine's startup/shutdown persistence does.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create directory {}", parent.display()))?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("failed to open sqlite store")?;

        sqlx::query(SCHEMA_SQL)
            .execute(&pool)
            .await
            .context("failed to initialize store schema")?;

        Ok(Self { pool })
    }

    #[must_use]
    pub fn in_memory_unsupported_hint() -> &'static str {
        "use SqliteStore::open with a `:memory:` or tempfile path for tests"
    }

    /// Persists every known host's throttle state.
    pub async fn save_host_states(&self, manager: &ThrottleManager) -> Result<()> {
        for host in manager.all_hosts() {
            let Some(state) = manager.snapshot(&host) else {
                continue;
            };
            sqlx::query(
                r#"
                INSERT INTO host_state (host, rpm, next_request_at, backoff_until, err_429_streak, success_streak)
                VALUES (?, ?, ?, ?, ?, ?)
                ON CONFLICT(host) DO UPDATE SET
                    rpm = excluded.rpm,
                    next_request_at = excluded.next_request_at,
                    backoff_until = excluded.backoff_until,
                    err_429_streak = excluded.err_429_streak,
                    success_streak = excluded.success_streak
                "#,
            )
            .bind(&host)
            .bind(state.rpm)
            .bind(state.next_request_at as i64)
            .bind(state.backoff_until as i64)
            .bind(state.err_429_streak)
            .bind(state.success_streak)
            .execute(&self.pool)
            .await
            .context("failed to persist host_state")?;
        }
        Ok(())
    }

    /// Loads all persisted host throttle states into a fresh `ThrottleManager` (startup resume).
    pub async fn load_host_states(&self, manager: &ThrottleManager) -> Result<()> {
        let rows: Vec<(String, i64, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT host, rpm, next_request_at, backoff_until, err_429_streak, success_streak FROM host_state",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load host_state")?;

        for (host, rpm, next_request_at, backoff_until, err_429_streak, success_streak) in rows {
            let state = HostState::from_persisted(
                rpm as u32,
                next_request_at as u64,
                backoff_until as u64,
                success_streak as u32,
                err_429_streak as u32,
            );
            manager.restore(&host, state);
        }
        Ok(())
    }

    pub async fn save_host_budgets(&self, manager: &BudgetManager) -> Result<()> {
        for host in manager.all_hosts() {
            let Some(budget) = manager.snapshot(&host) else {
                continue;
            };
            let failures_json = serde_json::to_string(&budget.failure_timestamps())?;
            sqlx::query(
                r#"
                INSERT INTO host_budget (host, failures_json, lock_expires_at)
                VALUES (?, ?, ?)
                ON CONFLICT(host) DO UPDATE SET
                    failures_json = excluded.failures_json,
                    lock_expires_at = excluded.lock_expires_at
                "#,
            )
            .bind(&host)
            .bind(failures_json)
            .bind(budget.lock_expires_at.map(|v| v as i64))
            .execute(&self.pool)
            .await
            .context("failed to persist host_budget")?;
        }
        Ok(())
    }

    pub async fn load_host_budgets(&self, manager: &BudgetManager) -> Result<()> {
        let rows: Vec<(String, String, Option<i64>)> =
            sqlx::query_as("SELECT host, failures_json, lock_expires_at FROM host_budget")
                .fetch_all(&self.pool)
                .await
                .context("failed to load host_budget")?;

        for (host, failures_json, lock_expires_at) in rows {
            let failures: Vec<u64> = serde_json::from_str(&failures_json).unwrap_or_default();
            let budget = HostBudget::from_persisted(failures, lock_expires_at.map(|v| v as u64));
            manager.restore(&host, budget);
        }
        Ok(())
    }

    pub async fn save_checkpoint(
        &self,
        job_id: &str,
        queue_snapshot: &serde_json::Value,
        visited_set: &serde_json::Value,
        stats: &serde_json::Value,
    ) -> Result<()> {
        let now = chrono::Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO checkpoint (job_id, queue_snapshot, visited_set, stats, saved_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(job_id) DO UPDATE SET
                queue_snapshot = excluded.queue_snapshot,
                visited_set = excluded.visited_set,
                stats = excluded.stats,
                saved_at = excluded.saved_at
            "#,
        )
        .bind(job_id)
        .bind(queue_snapshot.to_string())
        .bind(visited_set.to_string())
        .bind(stats.to_string())
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to save checkpoint")?;
        Ok(())
    }

    pub async fn load_checkpoint(
        &self,
        job_id: &str,
    ) -> Result<Option<(serde_json::Value, serde_json::Value, serde_json::Value)>> {
        let row: Option<(String, String, String)> = sqlx::query_as(
            "SELECT queue_snapshot, visited_set, stats FROM checkpoint WHERE job_id = ?",
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to load checkpoint")?;

        Ok(match row {
            Some((q, v, s)) => Some((
                serde_json::from_str(&q).unwrap_or(serde_json::Value::Null),
                serde_json::from_str(&v).unwrap_or(serde_json::Value::Null),
                serde_json::from_str(&s).unwrap_or(serde_json::Value::Null),
            )),
            None => None,
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait::async_trait]
impl crate::cache::DurableStore for SqliteStore {
    async fn get_cache_entry(&self, url: &str) -> Result<Option<CacheEntry>> {
        let row: Option<(String, Option<String>, i64, i64, Option<String>, Option<String>)> =
            sqlx::query_as(
                "SELECT url, html, fetched_at, http_status, etag, last_modified FROM cache WHERE url = ?",
            )
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read cache entry")?;

        Ok(row.map(
            |(url, html, fetched_at, http_status, etag, last_modified)| CacheEntry {
                url,
                html,
                fetched_at: fetched_at as u64,
                http_status: http_status as u16,
                etag,
                last_modified,
            },
        ))
    }

    async fn put_cache_entry(&self, entry: &CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cache (url, html, fetched_at, http_status, etag, last_modified)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                html = excluded.html,
                fetched_at = excluded.fetched_at,
                http_status = excluded.http_status,
                etag = excluded.etag,
                last_modified = excluded.last_modified
            "#,
        )
        .bind(&entry.url)
        .bind(&entry.html)
        .bind(entry.fetched_at as i64)
        .bind(entry.http_status as i64)
        .bind(&entry.etag)
        .bind(&entry.last_modified)
        .execute(&self.pool)
        .await
        .context("failed to write cache entry")?;
        Ok(())
    }

    async fn get_known_404(&self, url: &str) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT fetched_at FROM known_404 WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await
            .context("failed to read known_404")?;
        Ok(row.map(|(fetched_at,)| fetched_at as u64))
    }

    async fn put_known_404(&self, url: &str, fetched_at: u64) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO known_404 (url, fetched_at) VALUES (?, ?)
            ON CONFLICT(url) DO UPDATE SET fetched_at = excluded.fetched_at
            "#,
        )
        .bind(url)
        .bind(fetched_at as i64)
        .execute(&self.pool)
        .await
        .context("failed to write known_404")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DurableStore;
    use crate::throttle::{BudgetConfig, ThrottleConfig};

    async fn store() -> SqliteStore {
        let dir = tempfile::tempdir().unwrap();
        SqliteStore::open(&dir.path().join("store.sqlite"))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn cache_round_trip() {
        let store = store().await;
        let entry = CacheEntry {
            url: "https://example.com/a".to_string(),
            html: Some("<html></html>".to_string()),
            fetched_at: 1000,
            etag: Some("\"abc\"".to_string()),
            last_modified: None,
            http_status: 200,
        };
        store.put_cache_entry(&entry).await.unwrap();
        let loaded = store.get_cache_entry(&entry.url).await.unwrap().unwrap();
        assert_eq!(loaded.html, entry.html);
        assert_eq!(loaded.etag, entry.etag);
    }

    #[tokio::test]
    async fn known_404_round_trip() {
        let store = store().await;
        assert!(store
            .get_known_404("https://example.com/gone")
            .await
            .unwrap()
            .is_none());
        store
            .put_known_404("https://example.com/gone", 500)
            .await
            .unwrap();
        assert_eq!(
            store
                .get_known_404("https://example.com/gone")
                .await
                .unwrap(),
            Some(500)
        );
    }

    #[tokio::test]
    async fn host_state_round_trip() {
        let store = store().await;
        let mgr = ThrottleManager::new(ThrottleConfig::default());
        mgr.record_rate_limited("hot.example", Some(5_000));

        store.save_host_states(&mgr).await.unwrap();

        let restored = ThrottleManager::new(ThrottleConfig::default());
        store.load_host_states(&restored).await.unwrap();
        let snap = restored.snapshot("hot.example").unwrap();
        assert_eq!(snap.err_429_streak, 1);
    }

    #[tokio::test]
    async fn host_budget_round_trip() {
        let store = store().await;
        let mgr = BudgetManager::new(BudgetConfig {
            max_errors: 2,
            window_ms: 60_000,
            lockout_ms: 30_000,
        });
        mgr.record_failure("flaky.example");
        mgr.record_failure("flaky.example");
        assert!(mgr.lock_retry_after_ms("flaky.example").is_some());

        store.save_host_budgets(&mgr).await.unwrap();

        let restored = BudgetManager::new(BudgetConfig {
            max_errors: 2,
            window_ms: 60_000,
            lockout_ms: 30_000,
        });
        store.load_host_budgets(&restored).await.unwrap();
        assert!(restored.lock_retry_after_ms("flaky.example").is_some());
    }

    #[tokio::test]
    async fn checkpoint_round_trip() {
        let store = store().await;
        let q = serde_json::json!([{"url": "https://example.com"}]);
        let v = serde_json::json!(["https://example.com"]);
        let s = serde_json::json!({"fetched": 1});
        store.save_checkpoint("job-1", &q, &v, &s).await.unwrap();
        let (lq, lv, ls) = store.load_checkpoint("job-1").await.unwrap().unwrap();
        assert_eq!(lq, q);
        assert_eq!(lv, v);
        assert_eq!(ls, s);
    }
}
