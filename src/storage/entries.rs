use sqlx::SqliteConnection;

use super::schema::Database;
use super::types::{Entry, EntryStatus, StoreError};

// ============================================================================
// Transaction-scoped helpers
// ============================================================================

/// Whether `entry` is already stored for its feed and user.
///
/// Identity is the entry hash within `(user_id, feed_id)`.
pub(crate) async fn entry_exists(
    conn: &mut SqliteConnection,
    entry: &Entry,
) -> Result<bool, StoreError> {
    let row: Option<(i64,)> =
        sqlx::query_as("SELECT 1 FROM entries WHERE user_id = ? AND feed_id = ? AND hash = ?")
            .bind(entry.user_id)
            .bind(entry.feed_id)
            .bind(&entry.hash)
            .fetch_optional(&mut *conn)
            .await
            .map_err(StoreError::query(format!(
                "unable to check entry {:?} of feed #{}",
                entry.hash, entry.feed_id
            )))?;

    Ok(row.is_some())
}

/// Insert `entry`, writing the generated ID back onto it.
pub(crate) async fn create_entry(
    conn: &mut SqliteConnection,
    entry: &mut Entry,
) -> Result<(), StoreError> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO entries (user_id, feed_id, hash, title, url, author, content, status, published_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
    "#,
    )
    .bind(entry.user_id)
    .bind(entry.feed_id)
    .bind(&entry.hash)
    .bind(&entry.title)
    .bind(&entry.url)
    .bind(&entry.author)
    .bind(&entry.content)
    .bind(entry.status.as_str())
    .bind(entry.published_at.timestamp())
    .fetch_one(&mut *conn)
    .await
    .map_err(StoreError::query(format!(
        "unable to create entry {:?} for feed #{}",
        entry.hash, entry.feed_id
    )))?;

    entry.id = row.0;
    Ok(())
}

impl Database {
    // ========================================================================
    // Entry Operations
    // ========================================================================

    /// Change the status of one of the user's entries.
    ///
    /// Returns whether a row was updated.
    pub async fn update_entry_status(
        &self,
        user_id: i64,
        entry_id: i64,
        status: EntryStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE entries SET status = ? WHERE id = ? AND user_id = ?")
            .bind(status.as_str())
            .bind(entry_id)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to update status of entry #{}",
                entry_id
            )))?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of stored entries of a feed, whatever their status.
    pub async fn count_entries(&self, user_id: i64, feed_id: i64) -> Result<i64, StoreError> {
        let row: (i64,) =
            sqlx::query_as("SELECT count(*) FROM entries WHERE user_id = ? AND feed_id = ?")
                .bind(user_id)
                .bind(feed_id)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::query(format!(
                    "unable to count entries of feed #{}",
                    feed_id
                )))?;

        Ok(row.0)
    }
}
