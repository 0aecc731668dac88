//! Auth token records. Issued externally; the core stores and expires them.

use crate::models::{new_id, TokenRow};

use super::{Store, StoreError, StoreResult};

impl Store {
    pub async fn create_token(&self, user: &str, token: &str, expiry: &str) -> StoreResult<TokenRow> {
        let id = new_id();
        sqlx::query("INSERT INTO tokens (id, user, token, expiry) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(user)
            .bind(token)
            .bind(expiry)
            .execute(&self.pool())
            .await
            .map_err(|e| StoreError::from_write(e, user))?;
        self.get_token(token).await
    }

    pub async fn get_token(&self, token: &str) -> StoreResult<TokenRow> {
        sqlx::query_as("SELECT * FROM tokens WHERE token = ?")
            .bind(token)
            .fetch_optional(&self.pool())
            .await?
            .ok_or_else(|| StoreError::NotFound("token".to_string()))
    }

    /// GC phase (c): expired tokens.
    pub async fn delete_expired_tokens(&self, now: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM tokens WHERE expiry < ?")
            .bind(now)
            .execute(&self.pool())
            .await?;
        Ok(result.rows_affected())
    }
}
