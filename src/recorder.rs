use std::sync::Arc;

use chrono::Utc;
use tracing::error;

use rag_chat_core::error::{RagError, Result};
use rag_chat_core::ids::generate_id;
use rag_chat_core::models::ConversationTurn;
use rag_chat_core::store::ConversationRepository;

/// Fields of a turn known to the caller; the recorder assigns id and time.
#[derive(Debug, Clone)]
pub struct NewTurn {
    pub tenant_id: String,
    pub agent_id: String,
    pub user_id: String,
    pub user_message: String,
    pub assistant_message: String,
    pub cited_urls: Vec<String>,
    pub grounded: bool,
}

/// Persists one record per completed chat turn. Failures are logged and
/// returned as `Persistence`; they are not retried here.
pub struct ConversationRecorder {
    repo: Arc<dyn ConversationRepository>,
}

impl ConversationRecorder {
    pub fn new(repo: Arc<dyn ConversationRepository>) -> Self {
        Self { repo }
    }

    /// Save the turn and return its conversation id.
    pub async fn record(&self, turn: NewTurn) -> Result<String> {
        let record = ConversationTurn {
            id: generate_id("conv"),
            tenant_id: turn.tenant_id,
            agent_id: turn.agent_id,
            user_id: turn.user_id,
            user_message: turn.user_message,
            assistant_message: turn.assistant_message,
            cited_urls: turn.cited_urls,
            grounded: turn.grounded,
            created_at: Utc::now(),
        };

        if let Err(e) = self.repo.save(&record).await {
            error!(
                conversation_id = %record.id,
                agent_id = %record.agent_id,
                error = %e,
                "failed to record conversation turn"
            );
            return Err(match e {
                RagError::Persistence(_) => e,
                other => RagError::persistence(other),
            });
        }
        Ok(record.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rag_chat_core::store::memory::InMemoryRepository;

    fn turn() -> NewTurn {
        NewTurn {
            tenant_id: "acme".into(),
            agent_id: "agent_1".into(),
            user_id: "u1".into(),
            user_message: "What does it cost?".into(),
            assistant_message: "Ten dollars.".into(),
            cited_urls: vec!["https://a.example/pricing".into()],
            grounded: true,
        }
    }

    #[tokio::test]
    async fn test_record_assigns_conversation_id() {
        let repo = Arc::new(InMemoryRepository::new());
        let recorder = ConversationRecorder::new(repo.clone());

        let id = recorder.record(turn()).await.unwrap();
        assert!(id.starts_with("conv_"));

        let turns = repo.turns();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].id, id);
        assert_eq!(turns[0].cited_urls, vec!["https://a.example/pricing"]);
    }

    struct BrokenRepo;

    #[async_trait]
    impl ConversationRepository for BrokenRepo {
        async fn save(&self, _turn: &ConversationTurn) -> Result<()> {
            Err(RagError::Timeout("database busy".into()))
        }
    }

    #[tokio::test]
    async fn test_failure_surfaces_as_persistence() {
        let recorder = ConversationRecorder::new(Arc::new(BrokenRepo));
        let err = recorder.record(turn()).await.unwrap_err();
        assert!(matches!(err, RagError::Persistence(_)));
    }
}
