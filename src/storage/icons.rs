use super::schema::Database;
use super::types::StoreError;

impl Database {
    // ========================================================================
    // Icon Operations
    // ========================================================================

    /// Store an icon, reusing the existing row when `hash` is already known.
    pub async fn create_icon(
        &self,
        hash: &str,
        mime_type: &str,
        content: &[u8],
    ) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO icons (hash, mime_type, content)
            VALUES (?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET mime_type = excluded.mime_type
            RETURNING id
        "#,
        )
        .bind(hash)
        .bind(mime_type)
        .bind(content)
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::query(format!("unable to create icon {}", hash)))?;

        Ok(row.0)
    }

    /// Associate an icon with a feed, replacing any previous association.
    pub async fn attach_feed_icon(&self, feed_id: i64, icon_id: i64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO feed_icons (feed_id, icon_id) VALUES (?, ?)
            ON CONFLICT(feed_id) DO UPDATE SET icon_id = excluded.icon_id
        "#,
        )
        .bind(feed_id)
        .bind(icon_id)
        .execute(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to attach icon #{} to feed #{}",
            icon_id, feed_id
        )))?;
        Ok(())
    }
}
