use super::schema::Database;
use super::types::{Category, StoreError};

impl Database {
    // ========================================================================
    // Category Operations
    // ========================================================================

    /// Create a category owned by `user_id`, returning its ID.
    ///
    /// Titles are trimmed; an empty title is stored as is, validation belongs
    /// to the caller.
    pub async fn create_category(&self, user_id: i64, title: &str) -> Result<i64, StoreError> {
        let row: (i64,) = sqlx::query_as(
            "INSERT INTO categories (user_id, title) VALUES (?, ?) RETURNING id",
        )
        .bind(user_id)
        .bind(title.trim())
        .fetch_one(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to create category {:?} for user #{}",
            title, user_id
        )))?;

        Ok(row.0)
    }

    /// Fetch one of the user's categories.
    pub async fn category_by_id(
        &self,
        user_id: i64,
        category_id: i64,
    ) -> Result<Option<Category>, StoreError> {
        let row: Option<(i64, i64, String)> = sqlx::query_as(
            "SELECT id, user_id, title FROM categories WHERE user_id = ? AND id = ?",
        )
        .bind(user_id)
        .bind(category_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::query(format!(
            "unable to fetch category #{}",
            category_id
        )))?;

        Ok(row.map(|(id, user_id, title)| Category { id, user_id, title }))
    }
}
