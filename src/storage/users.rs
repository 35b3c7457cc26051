use super::schema::Database;
use super::types::{AdminAccess, StoreError};

impl Database {
    // ========================================================================
    // User Operations
    // ========================================================================

    /// Create a user with a display timezone (IANA name), returning its ID.
    pub async fn create_user(&self, username: &str, timezone: &str) -> Result<i64, StoreError> {
        let row: (i64,) =
            sqlx::query_as("INSERT INTO users (username, timezone) VALUES (?, ?) RETURNING id")
                .bind(username)
                .bind(timezone)
                .fetch_one(&self.pool)
                .await
                .map_err(StoreError::query(format!(
                    "unable to create user {:?}",
                    username
                )))?;

        Ok(row.0)
    }

    /// Grant or revoke the administrator flag.
    pub async fn set_user_admin(&self, user_id: i64, is_admin: bool) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET is_admin = ? WHERE id = ?")
            .bind(is_admin)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to update user #{}",
                user_id
            )))?;
        Ok(())
    }

    /// Change the timezone used to display a user's timestamps.
    pub async fn set_user_timezone(&self, user_id: i64, timezone: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET timezone = ? WHERE id = ?")
            .bind(timezone)
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to update user #{}",
                user_id
            )))?;
        Ok(())
    }

    /// Obtain the capability required by process-wide operations.
    ///
    /// # Errors
    ///
    /// `StoreError::NotAdmin` when the user is missing or not an administrator.
    pub async fn admin_access(&self, user_id: i64) -> Result<AdminAccess, StoreError> {
        let row: Option<(bool,)> = sqlx::query_as("SELECT is_admin FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::query(format!(
                "unable to fetch user #{}",
                user_id
            )))?;

        match row {
            Some((true,)) => Ok(AdminAccess::new(user_id)),
            _ => Err(StoreError::NotAdmin { user_id }),
        }
    }
}
