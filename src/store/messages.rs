//! Mail message persistence. Upserts key on the provider message id and
//! preserve the original `created_at`.

use chrono::Utc;
use rocket_db_pools::sqlx::{self};

use super::{Store, StoreError};
use crate::models::{Message, NewMessage};

impl Store {
    pub async fn add_message(&self, input: &NewMessage) -> Result<Message, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO messages
                (message_id, case_id, thread_id, direction, from_header, to_header,
                 subject, snippet, body, received_at, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ON CONFLICT (message_id) DO UPDATE SET
                case_id = excluded.case_id,
                thread_id = COALESCE(excluded.thread_id, messages.thread_id),
                direction = excluded.direction,
                from_header = COALESCE(excluded.from_header, messages.from_header),
                to_header = COALESCE(excluded.to_header, messages.to_header),
                subject = COALESCE(excluded.subject, messages.subject),
                snippet = COALESCE(excluded.snippet, messages.snippet),
                body = COALESCE(excluded.body, messages.body),
                received_at = COALESCE(excluded.received_at, messages.received_at)
            "#,
        )
        .bind(&input.message_id)
        .bind(&input.case_id)
        .bind(&input.thread_id)
        .bind(input.direction)
        .bind(&input.from_header)
        .bind(&input.to_header)
        .bind(&input.subject)
        .bind(&input.snippet)
        .bind(&input.body)
        .bind(input.received_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE message_id = ?1")
            .bind(&input.message_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(message)
    }

    pub async fn get_message(&self, message_id: &str) -> Result<Option<Message>, StoreError> {
        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE message_id = ?1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(message)
    }

    pub async fn list_messages_for_case(&self, case_id: &str) -> Result<Vec<Message>, StoreError> {
        let messages = sqlx::query_as::<_, Message>(
            "SELECT * FROM messages WHERE case_id = ?1 ORDER BY received_at DESC, created_at DESC",
        )
        .bind(case_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    /// Newest inbound message for a case, used for exception scanning and
    /// supplier address auto-fill.
    pub async fn latest_inbound_message(
        &self,
        case_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let message = sqlx::query_as::<_, Message>(
            r#"
            SELECT * FROM messages
            WHERE case_id = ?1 AND direction = 'INBOUND'
            ORDER BY received_at DESC, created_at DESC
            LIMIT 1
            "#,
        )
        .bind(case_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(message)
    }
}
