//! Chat transcript persistence
//!
//! Optional durable mirror of session transcripts. The session channel never
//! depends on it for correctness; it only keeps history across restarts.

use crate::models::ChatMessage;
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

pub mod postgres;

pub use postgres::PostgresMessageSink;

#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn append(&self, session_id: &str, message: &ChatMessage) -> Result<()>;

    /// Messages for `session_id` in insertion order
    async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>>;
}

/// In-memory sink for development and tests
pub struct InMemoryMessageSink {
    sessions: Arc<RwLock<HashMap<String, Vec<ChatMessage>>>>,
}

impl InMemoryMessageSink {
    pub fn new() -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryMessageSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MessageSink for InMemoryMessageSink {
    async fn append(&self, session_id: &str, message: &ChatMessage) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(session_id.to_string())
            .or_insert_with(Vec::new)
            .push(message.clone());
        Ok(())
    }

    async fn history(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(session_id).cloned().unwrap_or_default())
    }
}

/// Postgres when a database URL is configured, in-memory otherwise.
pub fn build_sink(database_url: Option<&str>) -> Arc<dyn MessageSink> {
    if let Some(url) = database_url {
        match PostgresMessageSink::connect_lazy(url) {
            Ok(sink) => {
                info!("Transcript persistence backend: postgres");
                return Arc::new(sink);
            }
            Err(error) => {
                warn!(
                    "Failed to initialize postgres persistence, falling back to in-memory: {}",
                    error
                );
            }
        }
    }

    info!("Transcript persistence backend: in-memory");
    Arc::new(InMemoryMessageSink::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_history_keeps_insertion_order_per_session() {
        let sink = InMemoryMessageSink::new();

        sink.append("a", &ChatMessage::user("first")).await.unwrap();
        sink.append("b", &ChatMessage::user("other session")).await.unwrap();
        sink.append("a", &ChatMessage::agent("second")).await.unwrap();

        let history = sink.history("a").await.unwrap();
        let texts: Vec<_> = history.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["first", "second"]);

        assert!(sink.history("missing").await.unwrap().is_empty());
    }

    #[test]
    fn test_without_database_url_uses_memory() {
        tokio_test::block_on(async {
            let sink = build_sink(None);
            tokio_test::assert_ok!(sink.append("s", &ChatMessage::user("hello")).await);
            assert_eq!(sink.history("s").await.unwrap().len(), 1);
        });
    }
}
