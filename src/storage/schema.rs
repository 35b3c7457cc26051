use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use std::time::Duration;

use super::types::StoreError;
use crate::config::StoreConfig;

// ============================================================================
// Database
// ============================================================================

/// Shared handle over the connection pool.
///
/// Cloning is cheap; every operation is an independent round trip and no
/// state is kept between calls.
#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open the database at `path` with default settings and run migrations.
    pub async fn open(path: &str) -> Result<Self, StoreError> {
        Self::connect(&StoreConfig::for_path(path)).await
    }

    /// Open a database described by `config` and run migrations.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Locked` if another process holds the database
    /// lock, `StoreError::Migration` if schema setup fails.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", config.database_path);

        // busy_timeout set through the connect options so every pooled
        // connection inherits it
        let options = SqliteConnectOptions::from_str(&url)
            .map_err(StoreError::from_sqlx)?
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout());

        // Each in-memory connection is a separate database: pin a single
        // connection and never recycle it.
        let pool_options = if config.is_in_memory() {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
        };

        let pool = pool_options
            .acquire_timeout(config.acquire_timeout())
            .connect_with(options)
            .await
            .map_err(StoreError::from_sqlx)?;

        let db = Self { pool };
        db.migrate().await.map_err(|e| {
            let error_string = e.to_string().to_lowercase();
            if error_string.contains("database is locked")
                || error_string.contains("database table is locked")
            {
                StoreError::Locked
            } else {
                StoreError::Migration(e.to_string())
            }
        })?;

        tracing::debug!(path = %config.database_path, "Database ready");
        Ok(db)
    }

    /// Create tables and indexes atomically within a transaction.
    ///
    /// Every statement uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op. Timestamps are unix seconds in UTC.
    async fn migrate(&self) -> Result<()> {
        // Immediate so concurrent openers queue on busy_timeout instead of
        // failing on lock upgrade
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY,
                username TEXT UNIQUE NOT NULL,
                timezone TEXT NOT NULL DEFAULT 'UTC',
                is_admin INTEGER NOT NULL DEFAULT 0
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS categories (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                title TEXT NOT NULL,
                UNIQUE(user_id, title)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                category_id INTEGER NOT NULL REFERENCES categories(id) ON DELETE CASCADE,
                feed_url TEXT NOT NULL,
                site_url TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                etag_header TEXT NOT NULL DEFAULT '',
                last_modified_header TEXT NOT NULL DEFAULT '',
                checked_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
                next_check_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
                parsing_error_count INTEGER NOT NULL DEFAULT 0,
                parsing_error_msg TEXT NOT NULL DEFAULT '',
                scraper_rules TEXT NOT NULL DEFAULT '',
                rewrite_rules TEXT NOT NULL DEFAULT '',
                crawler INTEGER NOT NULL DEFAULT 0,
                user_agent TEXT NOT NULL DEFAULT '',
                username TEXT NOT NULL DEFAULT '',
                password TEXT NOT NULL DEFAULT '',
                ignore_http_cache INTEGER NOT NULL DEFAULT 0,
                fetch_via_proxy INTEGER NOT NULL DEFAULT 0,
                disabled INTEGER NOT NULL DEFAULT 0,
                UNIQUE(user_id, feed_url)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS icons (
                id INTEGER PRIMARY KEY,
                hash TEXT UNIQUE NOT NULL,
                mime_type TEXT NOT NULL,
                content BLOB NOT NULL
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // At most one icon per feed
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feed_icons (
                feed_id INTEGER PRIMARY KEY REFERENCES feeds(id) ON DELETE CASCADE,
                icon_id INTEGER NOT NULL REFERENCES icons(id) ON DELETE CASCADE
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS entries (
                id INTEGER PRIMARY KEY,
                user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                feed_id INTEGER NOT NULL REFERENCES feeds(id) ON DELETE CASCADE,
                hash TEXT NOT NULL,
                title TEXT NOT NULL DEFAULT '',
                url TEXT NOT NULL DEFAULT '',
                author TEXT NOT NULL DEFAULT '',
                content TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL DEFAULT 'unread'
                    CHECK (status IN ('unread', 'read', 'removed')),
                published_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER)),
                UNIQUE(feed_id, hash)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_user ON feeds(user_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_feeds_category ON feeds(category_id)")
            .execute(&mut *tx)
            .await?;

        // Covers the grouped counter query: WHERE user_id = ? GROUP BY feed_id, status
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_user_feed_status ON entries(user_id, feed_id, status)",
        )
        .execute(&mut *tx)
        .await?;

        // Weekly entry count filters on feed_id and a published_at range
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_entries_feed_published ON entries(feed_id, published_at DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(())
    }
}
