//! Singleton OAuth token record for the mail account.

use chrono::{DateTime, Utc};
use rocket_db_pools::sqlx::{self, FromRow};

use super::{Store, StoreError};

#[derive(Debug, Clone, FromRow)]
pub struct MailTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Store {
    pub async fn get_mail_tokens(&self) -> Result<Option<MailTokens>, StoreError> {
        let tokens = sqlx::query_as::<_, MailTokens>(
            "SELECT access_token, refresh_token, expires_at, updated_at FROM gmail_tokens WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(tokens)
    }

    pub async fn save_mail_tokens(
        &self,
        access_token: &str,
        refresh_token: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO gmail_tokens (id, access_token, refresh_token, expires_at, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT (id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(access_token)
        .bind(refresh_token)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
