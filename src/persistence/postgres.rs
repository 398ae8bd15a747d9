//! Postgres transcript sink
//!
//! Table is created on first use. Ordering comes from a BIGSERIAL column, not
//! from timestamps, so two messages in the same instant keep insertion order.

use super::MessageSink;
use crate::error::AgentError;
use crate::models::{ChatMessage, Sender};
use crate::Result;
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;

pub struct PostgresMessageSink {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresMessageSink {
    /// Pool connects on first query; only a malformed URL fails here.
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(database_url)
            .map_err(|e| AgentError::Database(format!("Invalid database URL: {}", e)))?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS chat_messages (
                      seq BIGSERIAL PRIMARY KEY,
                      session_id TEXT NOT NULL,
                      sender TEXT NOT NULL,
                      text TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_chat_messages_session_seq
                    ON chat_messages (session_id, seq);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AgentError::Database(format!("Failed to initialize chat schema: {}", e))
            })?;

        Ok(())
    }

    fn sender_from_db(sender: &str) -> Sender {
        match sender {
            "agent" | "llm" => Sender::Agent,
            "user" => Sender::User,
            other => {
                warn!(sender = other, "Unknown sender in chat_messages, treating as user");
                Sender::User
            }
        }
    }
}

#[async_trait]
impl MessageSink for PostgresMessageSink {
    async fn append(&self, session_id: &str, message: &ChatMessage) -> Result<()> {
        self.ensure_schema().await?;

        sqlx::query(
            r#"
            INSERT INTO chat_messages (session_id, sender, text, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(session_id)
        .bind(message.sender.to_string())
        .bind(&message.text)
        .bind(message.timestamp)
        .execute(&self.pool)
        .await
        .map_err(|e| AgentError::Database(format!("Failed to insert chat message: {}", e)))?;

        Ok(())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        self.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT sender, text, created_at
            FROM chat_messages
            WHERE session_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AgentError::Database(format!("Failed to load chat history: {}", e)))?;

        rows.into_iter()
            .map(|row| {
                let sender: String = row
                    .try_get("sender")
                    .map_err(|e| AgentError::Database(e.to_string()))?;
                Ok(ChatMessage {
                    text: row
                        .try_get("text")
                        .map_err(|e| AgentError::Database(e.to_string()))?,
                    sender: Self::sender_from_db(&sender),
                    timestamp: row
                        .try_get("created_at")
                        .map_err(|e| AgentError::Database(e.to_string()))?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_mapping_accepts_legacy_llm_tag() {
        assert_eq!(PostgresMessageSink::sender_from_db("llm"), Sender::Agent);
        assert_eq!(PostgresMessageSink::sender_from_db("agent"), Sender::Agent);
        assert_eq!(PostgresMessageSink::sender_from_db("user"), Sender::User);
    }

    #[tokio::test]
    async fn test_malformed_url_is_rejected() {
        let result = PostgresMessageSink::connect_lazy("not a url");
        assert!(matches!(result, Err(AgentError::Database(_))));
    }
}
