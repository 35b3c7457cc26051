use chrono::{DateTime, Duration, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use super::counters::{fetch_feed_counters, FeedCounters, FeedFilter};
use super::entries::{create_entry, entry_exists};
use super::schema::Database;
use super::types::{
    AdminAccess, Entry, Feed, FeedCountSummary, FeedDbRow, StoreError, MAX_PARSING_ERRORS,
};

/// Columns selected by every feed query, in `FeedDbRow` order.
///
/// Category, icon and user are LEFT JOINed: a missing icon row is the normal
/// case and must not drop the feed.
const FEED_QUERY: &str = r#"
    SELECT
        f.id,
        f.feed_url,
        f.site_url,
        f.title,
        f.etag_header,
        f.last_modified_header,
        f.user_id,
        f.checked_at,
        f.next_check_at,
        f.parsing_error_count,
        f.parsing_error_msg,
        f.scraper_rules,
        f.rewrite_rules,
        f.crawler,
        f.user_agent,
        f.username,
        f.password,
        f.ignore_http_cache,
        f.fetch_via_proxy,
        f.disabled,
        f.category_id,
        c.title AS category_title,
        fi.icon_id,
        u.timezone
    FROM feeds f
    LEFT JOIN categories c ON c.id = f.category_id
    LEFT JOIN feed_icons fi ON fi.feed_id = f.id
    LEFT JOIN users u ON u.id = f.user_id
    WHERE "#;

/// Failing feeds first, then case-insensitive title.
const FEED_ORDER: &str = " ORDER BY f.parsing_error_count DESC, lower(f.title) ASC";

/// Length of the trailing window used by [`Database::weekly_feed_entry_count`].
const WEEKLY_WINDOW_DAYS: i64 = 7;

fn feed_query(filter: &FeedFilter) -> QueryBuilder<'static, Sqlite> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(FEED_QUERY);
    filter.push_feed_predicate(&mut builder);
    builder
}

async fn fetch_feed_rows(
    conn: &mut SqliteConnection,
    filter: &FeedFilter,
) -> Result<Vec<FeedDbRow>, StoreError> {
    let mut builder = feed_query(filter);
    builder.push(FEED_ORDER);
    builder
        .build_query_as()
        .fetch_all(&mut *conn)
        .await
        .map_err(StoreError::query("unable to fetch feeds"))
}

/// Turn rows into feeds, assigning counters when they were requested.
fn merge_feeds(rows: Vec<FeedDbRow>, counters: Option<&FeedCounters>) -> Vec<Feed> {
    rows.into_iter()
        .map(|row| {
            let mut feed = row.into_feed();
            if let Some(counters) = counters {
                feed.read_count = counters.read(feed.id);
                feed.unread_count = counters.unread(feed.id);
            }
            feed
        })
        .collect()
}

impl Database {
    // ========================================================================
    // Existence Checks
    // ========================================================================

    /// Whether the user owns a feed with this ID.
    pub async fn try_feed_exists(&self, user_id: i64, feed_id: i64) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM feeds WHERE user_id = ? AND id = ?")
            .bind(user_id)
            .bind(feed_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to check feed #{}",
                feed_id
            )))?;
        Ok(row.is_some())
    }

    /// Best-effort variant of [`try_feed_exists`](Self::try_feed_exists):
    /// a failed query reads as `false`.
    pub async fn feed_exists(&self, user_id: i64, feed_id: i64) -> bool {
        self.try_feed_exists(user_id, feed_id)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, feed_id, error = %e, "Feed existence check failed");
                false
            })
    }

    /// Whether the user already subscribed to `feed_url`.
    pub async fn try_feed_url_exists(
        &self,
        user_id: i64,
        feed_url: &str,
    ) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM feeds WHERE user_id = ? AND feed_url = ?")
                .bind(user_id)
                .bind(feed_url)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::query(format!(
                    "unable to check feed URL {}",
                    feed_url
                )))?;
        Ok(row.is_some())
    }

    /// Best-effort variant of [`try_feed_url_exists`](Self::try_feed_url_exists).
    pub async fn feed_url_exists(&self, user_id: i64, feed_url: &str) -> bool {
        self.try_feed_url_exists(user_id, feed_url)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, feed_url, error = %e, "Feed URL check failed");
                false
            })
    }

    /// Whether a feed other than `feed_id` already uses `feed_url`.
    ///
    /// Lets an edit keep its own URL without tripping duplicate detection.
    pub async fn try_another_feed_url_exists(
        &self,
        user_id: i64,
        feed_id: i64,
        feed_url: &str,
    ) -> Result<bool, StoreError> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM feeds WHERE id <> ? AND user_id = ? AND feed_url = ?")
                .bind(feed_id)
                .bind(user_id)
                .bind(feed_url)
                .fetch_optional(&self.pool)
                .await
                .map_err(StoreError::query(format!(
                    "unable to check feed URL {} against feed #{}",
                    feed_url, feed_id
                )))?;
        Ok(row.is_some())
    }

    /// Best-effort variant of
    /// [`try_another_feed_url_exists`](Self::try_another_feed_url_exists).
    pub async fn another_feed_url_exists(&self, user_id: i64, feed_id: i64, feed_url: &str) -> bool {
        self.try_another_feed_url_exists(user_id, feed_id, feed_url)
            .await
            .unwrap_or_else(|e| {
                tracing::warn!(user_id, feed_id, feed_url, error = %e, "Feed URL check failed");
                false
            })
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    /// Count every feed in the store, split by the disabled flag.
    pub async fn count_all_feeds(
        &self,
        _admin: &AdminAccess,
    ) -> Result<FeedCountSummary, StoreError> {
        let rows: Vec<(bool, i64)> =
            sqlx::query_as("SELECT disabled, count(*) FROM feeds GROUP BY disabled")
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::query("unable to count feeds"))?;

        let mut summary = FeedCountSummary::default();
        for (disabled, count) in rows {
            if disabled {
                summary.disabled = count;
            } else {
                summary.enabled = count;
            }
        }
        summary.total = summary.enabled + summary.disabled;

        Ok(summary)
    }

    /// Number of feeds owned by the user.
    pub async fn count_feeds(&self, user_id: i64) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as("SELECT count(*) FROM feeds WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to count feeds of user #{}",
                user_id
            )))?;
        Ok(row.0)
    }

    /// Number of the user's feeds at or above [`MAX_PARSING_ERRORS`].
    pub async fn count_user_feeds_with_errors(&self, user_id: i64) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM feeds WHERE user_id = ? AND parsing_error_count >= ?",
        )
        .bind(user_id)
        .bind(MAX_PARSING_ERRORS)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to count failing feeds of user #{}",
            user_id
        )))?;
        Ok(row.0)
    }

    /// Number of feeds at or above [`MAX_PARSING_ERRORS`], all users included.
    pub async fn count_all_feeds_with_errors(
        &self,
        _admin: &AdminAccess,
    ) -> Result<i64, StoreError> {
        let row: (i64,) =
            sqlx::query_as("SELECT count(*) FROM feeds WHERE parsing_error_count >= ?")
                .bind(MAX_PARSING_ERRORS)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::query("unable to count failing feeds"))?;
        Ok(row.0)
    }

    /// Entries of a feed published during the seven days before now.
    pub async fn weekly_feed_entry_count(
        &self,
        user_id: i64,
        feed_id: i64,
    ) -> Result<i64, StoreError> {
        self.weekly_feed_entry_count_at(user_id, feed_id, Utc::now())
            .await
    }

    /// Entries of a feed published in `[now - 7 days, now]`, bounds included.
    pub async fn weekly_feed_entry_count_at(
        &self,
        user_id: i64,
        feed_id: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let since = now - Duration::days(WEEKLY_WINDOW_DAYS);
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            SELECT count(*)
            FROM entries
            WHERE user_id = ? AND feed_id = ? AND published_at BETWEEN ? AND ?
        "#,
        )
        .bind(user_id)
        .bind(feed_id)
        .bind(since.timestamp())
        .bind(now.timestamp())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to fetch weekly count for feed #{}",
            feed_id
        )))?;

        Ok(row.map(|(count,)| count).unwrap_or(0))
    }

    // ========================================================================
    // Listings
    // ========================================================================

    /// All of the user's feeds, without counters.
    pub async fn feeds(&self, user_id: i64) -> Result<Vec<Feed>, StoreError> {
        self.fetch_feeds(FeedFilter::User { user_id }, false).await
    }

    /// All of the user's feeds with read/unread counters.
    pub async fn feeds_with_counters(&self, user_id: i64) -> Result<Vec<Feed>, StoreError> {
        self.fetch_feeds(FeedFilter::User { user_id }, true).await
    }

    /// The user's feeds in one category, with read/unread counters.
    pub async fn feeds_by_category_with_counters(
        &self,
        user_id: i64,
        category_id: i64,
    ) -> Result<Vec<Feed>, StoreError> {
        self.fetch_feeds(
            FeedFilter::Category {
                user_id,
                category_id,
            },
            true,
        )
        .await
    }

    /// Run the feed query and, when asked, the counter query, then merge.
    ///
    /// With counters both queries share one read transaction so the counts
    /// describe the same snapshot as the rows.
    async fn fetch_feeds(
        &self,
        filter: FeedFilter,
        with_counters: bool,
    ) -> Result<Vec<Feed>, StoreError> {
        if !with_counters {
            let mut conn = self
                .pool
                .acquire()
                .await
                .map_err(StoreError::query("unable to acquire connection"))?;
            let rows = fetch_feed_rows(&mut conn, &filter).await?;
            return Ok(merge_feeds(rows, None));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(StoreError::query("unable to start transaction"))?;
        let counters = fetch_feed_counters(&mut tx, &filter).await?;
        let rows = fetch_feed_rows(&mut tx, &filter).await?;
        tx.commit()
            .await
            .map_err(StoreError::query("unable to commit transaction"))?;

        Ok(merge_feeds(rows, Some(&counters)))
    }

    /// One of the user's feeds; `Ok(None)` when it does not exist or belongs
    /// to someone else.
    pub async fn feed_by_id(&self, user_id: i64, feed_id: i64) -> Result<Option<Feed>, StoreError> {
        let row: Option<FeedDbRow> = feed_query(&FeedFilter::Feed { user_id, feed_id })
            .build_query_as()
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to fetch feed #{}",
                feed_id
            )))?;

        Ok(row.map(FeedDbRow::into_feed))
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Insert a feed and its pending entries.
    ///
    /// The generated ID is written back to `feed.id`. Each entry is then
    /// stamped with the feed and user IDs and stored in its own transaction,
    /// skipped when an entry with the same hash exists. On failure the
    /// in-flight transaction is rolled back and creation stops: the feed row
    /// and entries committed before the failure stay in place.
    pub async fn create_feed(&self, feed: &mut Feed) -> Result<(), StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO feeds (
                feed_url,
                site_url,
                title,
                category_id,
                user_id,
                etag_header,
                last_modified_header,
                crawler,
                user_agent,
                username,
                password,
                disabled,
                scraper_rules,
                rewrite_rules,
                ignore_http_cache,
                fetch_via_proxy
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
        "#,
        )
        .bind(&feed.feed_url)
        .bind(&feed.site_url)
        .bind(&feed.title)
        .bind(feed.category.id)
        .bind(feed.user_id)
        .bind(&feed.etag_header)
        .bind(&feed.last_modified_header)
        .bind(feed.crawler)
        .bind(&feed.user_agent)
        .bind(&feed.username)
        .bind(&feed.password)
        .bind(feed.disabled)
        .bind(&feed.scraper_rules)
        .bind(&feed.rewrite_rules)
        .bind(feed.ignore_http_cache)
        .bind(feed.fetch_via_proxy)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to create feed {:?}",
            feed.feed_url
        )))?;

        feed.id = row.0;
        tracing::debug!(feed_id = feed.id, user_id = feed.user_id, "Created feed");

        let (feed_id, user_id) = (feed.id, feed.user_id);
        let mut inserted = 0usize;
        for entry in feed.entries.iter_mut() {
            entry.feed_id = feed_id;
            entry.user_id = user_id;
            if self.store_entry_if_absent(entry).await? {
                inserted += 1;
            }
        }

        if !feed.entries.is_empty() {
            tracing::debug!(
                feed_id,
                inserted,
                skipped = feed.entries.len() - inserted,
                "Stored feed entries"
            );
        }

        Ok(())
    }

    /// Store one entry in its own transaction; returns whether it was new.
    ///
    /// The transaction takes the write lock up front. A deferred one would
    /// read first and then fail with SQLITE_BUSY on upgrade when another
    /// writer holds a read lock, without honoring `busy_timeout`.
    async fn store_entry_if_absent(&self, entry: &mut Entry) -> Result<bool, StoreError> {
        let mut tx = self
            .pool
            .begin_with("BEGIN IMMEDIATE")
            .await
            .map_err(StoreError::query("unable to start transaction"))?;

        let result = match entry_exists(&mut tx, entry).await {
            Ok(true) => Ok(false),
            Ok(false) => create_entry(&mut tx, entry).await.map(|()| true),
            Err(e) => Err(e),
        };

        match result {
            Ok(inserted) => {
                tx.commit()
                    .await
                    .map_err(StoreError::query("unable to commit transaction"))?;
                Ok(inserted)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::warn!(
                        feed_id = entry.feed_id,
                        error = %rollback_err,
                        "Entry transaction rollback failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Overwrite every mutable column of a feed.
    ///
    /// Scoped by `feed.id` and `feed.user_id`; neither column is written.
    pub async fn update_feed(&self, feed: &Feed) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE feeds
            SET
                feed_url = ?,
                site_url = ?,
                title = ?,
                category_id = ?,
                etag_header = ?,
                last_modified_header = ?,
                checked_at = ?,
                parsing_error_msg = ?,
                parsing_error_count = ?,
                scraper_rules = ?,
                rewrite_rules = ?,
                crawler = ?,
                user_agent = ?,
                username = ?,
                password = ?,
                disabled = ?,
                next_check_at = ?,
                ignore_http_cache = ?,
                fetch_via_proxy = ?
            WHERE id = ? AND user_id = ?
        "#,
        )
        .bind(&feed.feed_url)
        .bind(&feed.site_url)
        .bind(&feed.title)
        .bind(feed.category.id)
        .bind(&feed.etag_header)
        .bind(&feed.last_modified_header)
        .bind(feed.checked_at.timestamp())
        .bind(&feed.parsing_error_msg)
        .bind(feed.parsing_error_count)
        .bind(&feed.scraper_rules)
        .bind(&feed.rewrite_rules)
        .bind(feed.crawler)
        .bind(&feed.user_agent)
        .bind(&feed.username)
        .bind(&feed.password)
        .bind(feed.disabled)
        .bind(feed.next_check_at.timestamp())
        .bind(feed.ignore_http_cache)
        .bind(feed.fetch_via_proxy)
        .bind(feed.id)
        .bind(feed.user_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to update feed #{} ({})",
            feed.id, feed.feed_url
        )))?;
        Ok(())
    }

    /// Record the outcome of a failed fetch.
    ///
    /// Writes only the parsing error fields and the check timestamps, leaving
    /// the feed configuration untouched.
    pub async fn update_feed_error(&self, feed: &Feed) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE feeds
            SET
                parsing_error_msg = ?,
                parsing_error_count = ?,
                checked_at = ?,
                next_check_at = ?
            WHERE id = ? AND user_id = ?
        "#,
        )
        .bind(&feed.parsing_error_msg)
        .bind(feed.parsing_error_count)
        .bind(feed.checked_at.timestamp())
        .bind(feed.next_check_at.timestamp())
        .bind(feed.id)
        .bind(feed.user_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to update feed error #{} ({})",
            feed.id, feed.feed_url
        )))?;
        Ok(())
    }

    /// Delete one of the user's feeds.
    ///
    /// # Errors
    ///
    /// `StoreError::NothingRemoved` when no feed matched, including feeds
    /// owned by another user.
    pub async fn remove_feed(&self, user_id: i64, feed_id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM feeds WHERE id = ? AND user_id = ?")
            .bind(feed_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to remove feed #{}",
                feed_id
            )))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NothingRemoved { feed_id });
        }

        tracing::debug!(feed_id, user_id, "Removed feed");
        Ok(())
    }

    /// Clear the parsing error state of every feed in the store.
    pub async fn reset_feed_errors(&self, admin: &AdminAccess) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE feeds SET parsing_error_count = 0, parsing_error_msg = ''")
                .execute(&self.pool)
                .await
                .map_err(StoreError::query("unable to reset feed errors"))?;

        tracing::debug!(
            admin = admin.user_id(),
            feeds = result.rows_affected(),
            "Reset feed errors"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::storage::{Database, Entry, EntryStatus, Feed, FeedIcon, StoreError};
    use chrono::{Duration, TimeZone, Timelike, Utc};
    use chrono_tz::Tz;

    struct Fixture {
        db: Database,
        user_id: i64,
        category_id: i64,
    }

    async fn fixture() -> Fixture {
        let db = Database::open(":memory:").await.unwrap();
        let user_id = db.create_user("alice", "UTC").await.unwrap();
        let category_id = db.create_category(user_id, "All").await.unwrap();
        Fixture {
            db,
            user_id,
            category_id,
        }
    }

    fn test_feed(f: &Fixture, id: i64) -> Feed {
        let mut feed = Feed::new(
            f.user_id,
            f.category_id,
            format!("https://feed{}.example.com/rss", id),
        );
        feed.title = format!("Test Feed {}", id);
        feed
    }

    async fn create(f: &Fixture, mut feed: Feed) -> Feed {
        f.db.create_feed(&mut feed).await.unwrap();
        feed
    }

    #[tokio::test]
    async fn test_create_feed_assigns_id() {
        let f = fixture().await;
        let a = create(&f, test_feed(&f, 1)).await;
        let b = create(&f, test_feed(&f, 2)).await;
        assert!(a.id > 0);
        assert_ne!(a.id, b.id);
    }

    #[tokio::test]
    async fn test_create_feed_duplicate_url_fails() {
        let f = fixture().await;
        create(&f, test_feed(&f, 1)).await;

        let mut duplicate = test_feed(&f, 1);
        let err = f.db.create_feed(&mut duplicate).await.unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));
        assert!(err.to_string().contains("unable to create feed"));
    }

    #[tokio::test]
    async fn test_feed_by_id_populates_category() {
        let f = fixture().await;
        let feed = create(&f, test_feed(&f, 1)).await;

        let loaded = f.db.feed_by_id(f.user_id, feed.id).await.unwrap().unwrap();
        assert_eq!(loaded.category.id, f.category_id);
        assert_eq!(loaded.category.title, "All");
        assert_eq!(loaded.category.user_id, f.user_id);
        assert!(loaded.icon.is_none());
        assert_eq!(loaded.read_count, 0);
        assert_eq!(loaded.unread_count, 0);
    }

    #[tokio::test]
    async fn test_feed_by_id_missing_is_none() {
        let f = fixture().await;
        assert!(f.db.feed_by_id(f.user_id, 12345).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feed_icon_resolved_from_join() {
        let f = fixture().await;
        let with_icon = create(&f, test_feed(&f, 1)).await;
        let without_icon = create(&f, test_feed(&f, 2)).await;

        let icon_id = f.db.create_icon("hash", "image/png", b"png").await.unwrap();
        f.db.attach_feed_icon(with_icon.id, icon_id).await.unwrap();

        let feeds = f.db.feeds(f.user_id).await.unwrap();
        let a = feeds.iter().find(|x| x.id == with_icon.id).unwrap();
        let b = feeds.iter().find(|x| x.id == without_icon.id).unwrap();
        assert_eq!(
            a.icon,
            Some(FeedIcon {
                feed_id: with_icon.id,
                icon_id
            })
        );
        assert!(b.icon.is_none());
    }

    #[tokio::test]
    async fn test_listing_order_errors_then_title() {
        let f = fixture().await;
        let mut zeta = test_feed(&f, 1);
        zeta.title = "zeta".to_string();
        let mut alpha = test_feed(&f, 2);
        alpha.title = "Alpha".to_string();
        let mut beta = test_feed(&f, 3);
        beta.title = "beta".to_string();
        let mut broken = test_feed(&f, 4);
        broken.title = "Broken".to_string();

        create(&f, zeta).await;
        create(&f, alpha).await;
        create(&f, beta).await;
        let mut broken = create(&f, broken).await;

        broken.parsing_error_count = 5;
        broken.parsing_error_msg = "timeout".to_string();
        f.db.update_feed_error(&broken).await.unwrap();

        let titles: Vec<String> = f
            .db
            .feeds(f.user_id)
            .await
            .unwrap()
            .into_iter()
            .map(|feed| feed.title)
            .collect();
        assert_eq!(titles, vec!["Broken", "Alpha", "beta", "zeta"]);
    }

    #[tokio::test]
    async fn test_timestamps_localized_to_user_timezone() {
        let db = Database::open(":memory:").await.unwrap();
        let user_id = db.create_user("kenji", "Asia/Tokyo").await.unwrap();
        let category_id = db.create_category(user_id, "All").await.unwrap();
        let mut feed = Feed::new(user_id, category_id, "https://example.jp/rss");
        db.create_feed(&mut feed).await.unwrap();

        let checked = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        feed.checked_at = checked.with_timezone(&Tz::UTC);
        feed.next_check_at = (checked + Duration::hours(1)).with_timezone(&Tz::UTC);
        db.update_feed_error(&feed).await.unwrap();

        let loaded = db.feed_by_id(user_id, feed.id).await.unwrap().unwrap();
        assert_eq!(loaded.checked_at.timezone(), Tz::Asia__Tokyo);
        assert_eq!(loaded.checked_at.hour(), 21);
        assert_eq!(loaded.checked_at.with_timezone(&Utc), checked);
        assert_eq!(loaded.next_check_at.hour(), 22);
    }

    #[tokio::test]
    async fn test_update_feed_writes_configuration() {
        let f = fixture().await;
        let other_category = f.db.create_category(f.user_id, "Other").await.unwrap();
        let mut feed = create(&f, test_feed(&f, 1)).await;

        feed.title = "Renamed".to_string();
        feed.site_url = "https://feed1.example.com".to_string();
        feed.category.id = other_category;
        feed.crawler = true;
        feed.user_agent = "agent/1.0".to_string();
        feed.scraper_rules = "article".to_string();
        feed.rewrite_rules = "add_dynamic_image".to_string();
        feed.username = "u".to_string();
        feed.password = "p".to_string();
        feed.ignore_http_cache = true;
        feed.fetch_via_proxy = true;
        feed.disabled = true;
        feed.etag_header = "\"etag\"".to_string();
        feed.last_modified_header = "Mon, 01 Jan 2024 00:00:00 GMT".to_string();
        f.db.update_feed(&feed).await.unwrap();

        let loaded = f.db.feed_by_id(f.user_id, feed.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Renamed");
        assert_eq!(loaded.category.id, other_category);
        assert_eq!(loaded.category.title, "Other");
        assert!(loaded.crawler);
        assert!(loaded.ignore_http_cache);
        assert!(loaded.fetch_via_proxy);
        assert!(loaded.disabled);
        assert_eq!(loaded.password, "p");
        assert_eq!(loaded.etag_header, "\"etag\"");
    }

    #[tokio::test]
    async fn test_update_feed_scoped_by_owner() {
        let f = fixture().await;
        let bob = f.db.create_user("bob", "UTC").await.unwrap();
        let feed = create(&f, test_feed(&f, 1)).await;

        let mut hijack = feed.clone();
        hijack.user_id = bob;
        hijack.title = "Hijacked".to_string();
        f.db.update_feed(&hijack).await.unwrap();

        let loaded = f.db.feed_by_id(f.user_id, feed.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Test Feed 1");
    }

    #[tokio::test]
    async fn test_update_feed_error_leaves_configuration() {
        let f = fixture().await;
        let mut feed = create(&f, test_feed(&f, 1)).await;

        feed.title = "Not persisted".to_string();
        feed.disabled = true;
        feed.parsing_error_count = 2;
        feed.parsing_error_msg = "bad XML".to_string();
        f.db.update_feed_error(&feed).await.unwrap();

        let loaded = f.db.feed_by_id(f.user_id, feed.id).await.unwrap().unwrap();
        assert_eq!(loaded.title, "Test Feed 1");
        assert!(!loaded.disabled);
        assert_eq!(loaded.parsing_error_count, 2);
        assert_eq!(loaded.parsing_error_msg, "bad XML");
    }

    #[tokio::test]
    async fn test_remove_feed() {
        let f = fixture().await;
        let feed = create(&f, test_feed(&f, 1)).await;

        f.db.remove_feed(f.user_id, feed.id).await.unwrap();
        assert!(f.db.feed_by_id(f.user_id, feed.id).await.unwrap().is_none());

        let err = f.db.remove_feed(f.user_id, feed.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NothingRemoved { feed_id } if feed_id == feed.id));
    }

    #[tokio::test]
    async fn test_count_feeds_with_errors_threshold() {
        let f = fixture().await;
        let mut below = create(&f, test_feed(&f, 1)).await;
        let mut at = create(&f, test_feed(&f, 2)).await;
        create(&f, test_feed(&f, 3)).await;

        below.parsing_error_count = crate::storage::MAX_PARSING_ERRORS - 1;
        at.parsing_error_count = crate::storage::MAX_PARSING_ERRORS;
        f.db.update_feed_error(&below).await.unwrap();
        f.db.update_feed_error(&at).await.unwrap();

        assert_eq!(f.db.count_feeds(f.user_id).await.unwrap(), 3);
        assert_eq!(
            f.db.count_user_feeds_with_errors(f.user_id).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_reset_feed_errors() {
        let f = fixture().await;
        f.db.set_user_admin(f.user_id, true).await.unwrap();
        let admin = f.db.admin_access(f.user_id).await.unwrap();

        let mut feed = create(&f, test_feed(&f, 1)).await;
        feed.parsing_error_count = 10;
        feed.parsing_error_msg = "gone".to_string();
        f.db.update_feed_error(&feed).await.unwrap();
        assert_eq!(f.db.count_all_feeds_with_errors(&admin).await.unwrap(), 1);

        f.db.reset_feed_errors(&admin).await.unwrap();

        let loaded = f.db.feed_by_id(f.user_id, feed.id).await.unwrap().unwrap();
        assert_eq!(loaded.parsing_error_count, 0);
        assert_eq!(loaded.parsing_error_msg, "");
        assert_eq!(f.db.count_all_feeds_with_errors(&admin).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_create_feed_stores_entries_and_skips_duplicates() {
        let f = fixture().await;
        let mut feed = test_feed(&f, 1);
        let now = Utc::now();
        feed.entries = vec![
            Entry::new("a", "First", now),
            Entry::new("b", "Second", now),
            Entry::new("a", "First again", now),
        ];
        let feed = create(&f, feed).await;

        assert_eq!(f.db.count_entries(f.user_id, feed.id).await.unwrap(), 2);
        assert!(feed.entries.iter().all(|e| e.feed_id == feed.id));
        assert!(feed.entries.iter().all(|e| e.user_id == f.user_id));
        assert!(feed.entries[0].id > 0);
        assert_eq!(feed.entries[2].id, 0, "duplicate was not inserted");
    }

    #[tokio::test]
    async fn test_create_feed_keeps_entries_committed_before_failure() {
        let f = fixture().await;
        let mut feed = test_feed(&f, 1);
        let now = Utc::now();
        feed.entries = vec![
            Entry::new("a", "First", now),
            Entry::new("b", "Second", now),
            Entry::new("c", "Third", now),
        ];

        // Reject the second entry at the storage level
        sqlx::query(
            "CREATE TRIGGER reject_b BEFORE INSERT ON entries WHEN new.hash = 'b' \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&f.db.pool)
        .await
        .unwrap();

        let err = f.db.create_feed(&mut feed).await.unwrap_err();
        assert!(err.to_string().contains("unable to create entry"));

        assert!(feed.id > 0, "feed row was created");
        assert!(f.db.feed_exists(f.user_id, feed.id).await);
        assert_eq!(f.db.count_entries(f.user_id, feed.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_counters_ignore_removed_entries() {
        let f = fixture().await;
        let mut feed = test_feed(&f, 1);
        let now = Utc::now();
        feed.entries = (0..6)
            .map(|i| Entry::new(format!("e{}", i), "Entry", now))
            .collect();
        let feed = create(&f, feed).await;

        let ids: Vec<i64> = feed.entries.iter().map(|e| e.id).collect();
        for id in &ids[0..2] {
            f.db.update_entry_status(f.user_id, *id, EntryStatus::Read)
                .await
                .unwrap();
        }
        for id in &ids[2..5] {
            f.db.update_entry_status(f.user_id, *id, EntryStatus::Removed)
                .await
                .unwrap();
        }

        let feeds = f.db.feeds_with_counters(f.user_id).await.unwrap();
        assert_eq!(feeds[0].read_count, 2);
        assert_eq!(feeds[0].unread_count, 1);

        let plain = f.db.feeds(f.user_id).await.unwrap();
        assert_eq!(plain[0].read_count, 0);
        assert_eq!(plain[0].unread_count, 0);
    }

    #[tokio::test]
    async fn test_feeds_by_category_with_counters() {
        let f = fixture().await;
        let tech = f.db.create_category(f.user_id, "Tech").await.unwrap();

        let mut in_tech = test_feed(&f, 1);
        in_tech.category.id = tech;
        in_tech.entries = vec![Entry::new("x", "X", Utc::now())];
        let in_tech = create(&f, in_tech).await;

        let mut elsewhere = test_feed(&f, 2);
        elsewhere.entries = vec![Entry::new("y", "Y", Utc::now())];
        create(&f, elsewhere).await;

        let feeds = f
            .db
            .feeds_by_category_with_counters(f.user_id, tech)
            .await
            .unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].id, in_tech.id);
        assert_eq!(feeds[0].category.title, "Tech");
        assert_eq!(feeds[0].unread_count, 1);
    }

    #[tokio::test]
    async fn test_weekly_entry_count_window() {
        let f = fixture().await;
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        let mut feed = test_feed(&f, 1);
        feed.entries = vec![
            Entry::new("now", "Boundary now", now),
            Entry::new("recent", "Recent", now - Duration::days(3)),
            Entry::new("edge", "Window start", now - Duration::days(7)),
            Entry::new("old", "Too old", now - Duration::days(7) - Duration::seconds(1)),
            Entry::new("future", "Future", now + Duration::hours(1)),
        ];
        let feed = create(&f, feed).await;

        let count = f
            .db
            .weekly_feed_entry_count_at(f.user_id, feed.id, now)
            .await
            .unwrap();
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_weekly_entry_count_no_entries() {
        let f = fixture().await;
        let feed = create(&f, test_feed(&f, 1)).await;
        assert_eq!(
            f.db.weekly_feed_entry_count(f.user_id, feed.id).await.unwrap(),
            0
        );
        assert_eq!(f.db.weekly_feed_entry_count(f.user_id, 999).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_best_effort_checks_fold_failures_into_false() {
        let f = fixture().await;
        let feed = create(&f, test_feed(&f, 1)).await;
        assert!(f.db.feed_exists(f.user_id, feed.id).await);

        f.db.pool.close().await;

        assert!(!f.db.feed_exists(f.user_id, feed.id).await);
        assert!(!f.db.feed_url_exists(f.user_id, &feed.feed_url).await);
        assert!(f.db.try_feed_exists(f.user_id, feed.id).await.is_err());
        assert!(f.db.try_feed_url_exists(f.user_id, &feed.feed_url).await.is_err());
    }

    #[tokio::test]
    async fn test_listing_failure_is_reported_with_context() {
        let f = fixture().await;
        f.db.pool.close().await;

        let err = f.db.feeds_with_counters(f.user_id).await.unwrap_err();
        assert!(matches!(err, StoreError::Query { .. }));
    }
}
